//! Connection registry: the single source of truth for live streams.
//!
//! Admission, id allocation, the shutdown flag and the active count all sit
//! behind one mutex. Every transition that can close a stream runs under
//! that mutex too, so the active count is exact and a stream closed twice is
//! only subtracted once. Per-stream counters never touch this lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tracing::debug;

use crate::error::{Error, MuxResult};
use crate::stream::{CloseReason, Stream, StreamId, StreamState, StreamSummary};
use crate::transport::ConnectionId;

/// Highest usable stream id (31-bit, as on the wire).
pub(crate) const MAX_STREAM_ID: u32 = (1 << 31) - 1;

struct RegistryInner {
    streams: HashMap<StreamId, Arc<Stream>>,
    next_id: u32,
    active: usize,
    shutting_down: bool,
    drain_deadline: Option<Instant>,
}

/// Tracks every stream on one connection.
pub struct ConnectionRegistry {
    connection: ConnectionId,
    inner: Mutex<RegistryInner>,
    /// Mirror of `inner.shutting_down`, written under the lock.
    shutting_down: AtomicBool,
    /// Set under the lock once the last stream id has been handed out.
    exhausted: AtomicBool,
    active: watch::Sender<usize>,
}

impl ConnectionRegistry {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            inner: Mutex::new(RegistryInner {
                streams: HashMap::new(),
                next_id: 1,
                active: 0,
                shutting_down: false,
                drain_deadline: None,
            }),
            shutting_down: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            active: watch::channel(0).0,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Register a new stream in `Idle`.
    ///
    /// Fails with [`Error::ConnectionClosing`] once shutdown has begun or the
    /// id space is exhausted.
    pub fn open_stream(&self) -> MuxResult<Arc<Stream>> {
        let mut inner = self.inner.lock().expect("registry lock");
        if inner.shutting_down || inner.next_id > MAX_STREAM_ID {
            return Err(Error::ConnectionClosing {
                connection: self.connection,
                stream: None,
            });
        }
        let id = StreamId(inner.next_id);
        inner.next_id = inner.next_id.saturating_add(2);
        if inner.next_id > MAX_STREAM_ID {
            self.exhausted.store(true, Ordering::Release);
            debug!(connection = %self.connection, stream = %id, "stream ids exhausted");
        }

        let stream = Arc::new(Stream::new(id));
        inner.streams.insert(id, Arc::clone(&stream));
        inner.active += 1;
        self.active.send_replace(inner.active);
        debug!(connection = %self.connection, stream = %id, active = inner.active, "stream registered");
        Ok(stream)
    }

    pub fn get(&self, id: StreamId) -> MuxResult<Arc<Stream>> {
        self.inner
            .lock()
            .expect("registry lock")
            .streams
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownStream {
                connection: self.connection,
                stream: id,
            })
    }

    /// Remove a closed stream's bookkeeping.
    pub fn close_stream(&self, id: StreamId) -> MuxResult<Arc<Stream>> {
        let mut inner = self.inner.lock().expect("registry lock");
        let state = inner
            .streams
            .get(&id)
            .map(|s| s.state())
            .ok_or(Error::UnknownStream {
                connection: self.connection,
                stream: id,
            })?;
        if !state.is_closed() {
            return Err(Error::StreamNotClosed { stream: id, state });
        }
        let stream = inner.streams.remove(&id).ok_or(Error::UnknownStream {
            connection: self.connection,
            stream: id,
        })?;
        debug!(connection = %self.connection, stream = %id, "stream removed");
        Ok(stream)
    }

    pub(crate) fn activate(&self, stream: &Stream) -> MuxResult<StreamState> {
        self.transition(stream, Stream::activate)
    }

    pub(crate) fn end_local(&self, stream: &Stream) -> MuxResult<StreamState> {
        self.transition(stream, Stream::end_local)
    }

    pub(crate) fn end_remote(&self, stream: &Stream) -> MuxResult<StreamState> {
        self.transition(stream, Stream::end_remote)
    }

    /// Close `stream`; `false` if it was already closed.
    pub(crate) fn close(&self, stream: &Stream, reason: CloseReason) -> bool {
        self.transition(stream, |s| s.close(reason))
    }

    fn transition<R>(&self, stream: &Stream, apply: impl FnOnce(&Stream) -> R) -> R {
        let mut inner = self.inner.lock().expect("registry lock");
        let before = stream.state();
        let result = apply(stream);
        let after = stream.state();
        if before != after {
            debug!(
                connection = %self.connection,
                stream = %stream.id(),
                from = ?before,
                to = ?after,
                "stream transition"
            );
        }
        if !before.is_closed() && after.is_closed() {
            inner.active = inner.active.saturating_sub(1);
            self.active.send_replace(inner.active);
        }
        result
    }

    /// Number of streams not yet closed.
    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("registry lock").active
    }

    /// Number of streams still registered (closed ones included).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock").streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// No further stream will be admitted: shutdown began or the id space
    /// ran out.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire) || self.is_exhausted()
    }

    /// Every stream id has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn skip_ids_to(&self, next_id: u32) {
        self.inner.lock().expect("registry lock").next_id = next_id;
    }

    /// Stop admitting streams. Returns `false` if shutdown had already begun.
    pub(crate) fn begin_shutdown(&self, deadline: Instant) -> bool {
        let mut inner = self.inner.lock().expect("registry lock");
        if inner.shutting_down {
            return false;
        }
        inner.shutting_down = true;
        inner.drain_deadline = Some(deadline);
        self.shutting_down.store(true, Ordering::Release);
        true
    }

    pub fn drain_deadline(&self) -> Option<Instant> {
        self.inner.lock().expect("registry lock").drain_deadline
    }

    /// Streams that have not reached `Closed`, in id order.
    pub fn open_streams(&self) -> Vec<Arc<Stream>> {
        let inner = self.inner.lock().expect("registry lock");
        let mut open: Vec<Arc<Stream>> = inner
            .streams
            .values()
            .filter(|s| !s.state().is_closed())
            .cloned()
            .collect();
        open.sort_by_key(|s| s.id());
        open
    }

    /// Summaries of every registered stream, in id order.
    pub fn summaries(&self) -> Vec<StreamSummary> {
        let inner = self.inner.lock().expect("registry lock");
        let mut summaries: Vec<StreamSummary> = inner
            .streams
            .values()
            .map(|s| s.summary(self.connection))
            .collect();
        summaries.sort_by_key(|s| s.stream);
        summaries
    }

    /// Watch the active count.
    pub fn subscribe_active(&self) -> watch::Receiver<usize> {
        self.active.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(ConnectionId(1))
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[test]
    fn ids_are_odd_and_monotonic() {
        let reg = registry();
        let ids: Vec<u32> = (0..4).map(|_| reg.open_stream().unwrap().id().0).collect();
        assert_eq!(ids, vec![1, 3, 5, 7]);
    }

    #[test]
    fn ids_are_not_reused_after_removal() {
        let reg = registry();
        let first = reg.open_stream().unwrap();
        reg.close(&first, CloseReason::Cancelled);
        reg.close_stream(first.id()).unwrap();
        assert_eq!(reg.open_stream().unwrap().id(), StreamId(3));
    }

    #[test]
    fn rejects_streams_once_shutting_down() {
        let reg = registry();
        reg.open_stream().unwrap();
        assert!(reg.begin_shutdown(deadline()));
        assert!(!reg.begin_shutdown(deadline()));

        let err = reg.open_stream().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosing { .. }));
        assert!(reg.is_shutting_down());
        assert!(reg.drain_deadline().is_some());
    }

    #[test]
    fn last_stream_id_retires_the_registry() {
        let reg = registry();
        reg.skip_ids_to(MAX_STREAM_ID - 2);
        assert_eq!(reg.open_stream().unwrap().id(), StreamId(MAX_STREAM_ID - 2));
        assert!(!reg.is_shutting_down());

        assert_eq!(reg.open_stream().unwrap().id(), StreamId(MAX_STREAM_ID));
        assert!(reg.is_exhausted());
        assert!(reg.is_shutting_down());
        assert!(matches!(
            reg.open_stream().unwrap_err(),
            Error::ConnectionClosing { stream: None, .. }
        ));
        // Exhaustion alone leaves the drain to the coordinator.
        assert!(reg.begin_shutdown(deadline()));
    }

    #[test]
    fn double_close_decrements_once() {
        let reg = registry();
        let a = reg.open_stream().unwrap();
        let _b = reg.open_stream().unwrap();
        assert_eq!(reg.active_count(), 2);

        assert!(reg.close(&a, CloseReason::AbortedByShutdown));
        assert!(!reg.close(&a, CloseReason::AbortedByShutdown));
        assert_eq!(reg.active_count(), 1);
        assert_eq!(a.close_reason(), Some(CloseReason::AbortedByShutdown));
    }

    #[test]
    fn normal_completion_decrements() {
        let reg = registry();
        let stream = reg.open_stream().unwrap();
        reg.activate(&stream).unwrap();
        reg.end_local(&stream).unwrap();
        assert_eq!(reg.active_count(), 1);
        reg.end_remote(&stream).unwrap();
        assert_eq!(reg.active_count(), 0);
        assert_eq!(*reg.subscribe_active().borrow(), 0);
    }

    #[test]
    fn failed_transition_leaves_count_alone() {
        let reg = registry();
        let stream = reg.open_stream().unwrap();
        assert!(reg.end_local(&stream).is_err());
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn only_closed_streams_are_removed() {
        let reg = registry();
        let stream = reg.open_stream().unwrap();
        let err = reg.close_stream(stream.id()).unwrap_err();
        assert!(matches!(err, Error::StreamNotClosed { state: StreamState::Idle, .. }));

        reg.close(&stream, CloseReason::Cancelled);
        reg.close_stream(stream.id()).unwrap();
        assert!(reg.is_empty());
        assert!(matches!(
            reg.close_stream(stream.id()).unwrap_err(),
            Error::UnknownStream { .. }
        ));
    }

    #[test]
    fn summaries_and_open_streams_are_sorted() {
        let reg = registry();
        let a = reg.open_stream().unwrap();
        let b = reg.open_stream().unwrap();
        let c = reg.open_stream().unwrap();
        reg.close(&b, CloseReason::Refused);

        let open: Vec<StreamId> = reg.open_streams().iter().map(|s| s.id()).collect();
        assert_eq!(open, vec![a.id(), c.id()]);

        let summaries = reg.summaries();
        assert_eq!(summaries.len(), 3);
        assert_eq!(summaries[1].close_reason, Some(CloseReason::Refused));
    }

    #[test]
    fn no_stream_admitted_after_shutdown_is_visible() {
        for _ in 0..50 {
            let reg = Arc::new(registry());
            let openers: Vec<_> = (0..4)
                .map(|_| {
                    let reg = Arc::clone(&reg);
                    std::thread::spawn(move || loop {
                        let observed = reg.is_shutting_down();
                        let result = reg.open_stream();
                        if observed {
                            assert!(result.is_err(), "stream admitted after shutdown");
                            break;
                        }
                    })
                })
                .collect();
            std::thread::yield_now();
            reg.begin_shutdown(deadline());
            let admitted = reg.len();
            for opener in openers {
                opener.join().unwrap();
            }
            assert_eq!(reg.len(), admitted);
            assert_eq!(reg.active_count(), admitted);
        }
    }
}
