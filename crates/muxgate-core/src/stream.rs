//! Per-stream state machine and byte accounting.
//!
//! ```text
//!            activate            end_local
//!   Idle ─────────────► Open ───────────────► HalfClosedLocal ──┐
//!                         │                                      │ end_remote
//!                         │ end_remote                           ▼
//!                         └──────────► HalfClosedRemote ──────► Closed
//!                                                   end_local     ▲
//!                      close(reason) from any state ──────────────┘
//! ```
//!
//! State lives in a `watch` channel: every transition is pushed to
//! subscribers, and the channel's lock doubles as the stream's exclusive
//! access for counter updates, so counts freeze once `Closed` is visible.

use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

use crate::counter::ByteCounter;
use crate::error::{Error, MuxResult};
use crate::transport::ConnectionId;

/// Stream identifier, unique for the lifetime of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamState {
    /// Registered but not yet announced to the peer.
    Idle,
    /// Both halves open.
    Open,
    /// Request body fully sent.
    HalfClosedLocal,
    /// Response body fully received.
    HalfClosedRemote,
    /// Terminal.
    Closed,
}

impl StreamState {
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// Whether the local half may still write body bytes.
    pub fn can_send(self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedRemote)
    }

    /// Whether the remote half may still deliver body bytes.
    pub fn can_receive(self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedLocal)
    }
}

/// Why a stream reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    /// Both halves finished normally.
    Completed,
    /// Force-closed when the drain deadline expired.
    AbortedByShutdown,
    /// Above the peer's GOAWAY watermark; never processed.
    Refused,
    /// The transport failed underneath the stream.
    TransportFailure,
    /// Reset locally by the caller.
    Cancelled,
}

impl CloseReason {
    pub fn is_success(self) -> bool {
        self == Self::Completed
    }
}

/// Point-in-time view of a stream, for diagnostics and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub connection: ConnectionId,
    pub stream: StreamId,
    pub state: StreamState,
    pub close_reason: Option<CloseReason>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One logical request/response exchange on a shared connection.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    state: watch::Sender<StreamState>,
    reason: OnceLock<CloseReason>,
    sent: ByteCounter,
    received: ByteCounter,
    opened_at: Instant,
}

impl Stream {
    pub(crate) fn new(id: StreamId) -> Self {
        let (state, _) = watch::channel(StreamState::Idle);
        Self {
            id,
            state,
            reason: OnceLock::new(),
            sent: ByteCounter::new(),
            received: ByteCounter::new(),
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Set exactly once, when the stream reaches `Closed`.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent.snapshot()
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.snapshot()
    }

    /// Time since the stream was registered.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Wait until the stream is closed and return the reason.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|s| s.is_closed()).await;
        self.close_reason().unwrap_or(CloseReason::Cancelled)
    }

    /// Consistent snapshot: counters and state are read under the state lock.
    pub fn summary(&self, connection: ConnectionId) -> StreamSummary {
        let state = self.state.borrow();
        StreamSummary {
            connection,
            stream: self.id,
            state: *state,
            close_reason: self.close_reason(),
            bytes_sent: self.sent.snapshot(),
            bytes_received: self.received.snapshot(),
        }
    }

    /// Count bytes written by the local half. Fails once the stream is closed.
    pub(crate) fn record_sent(&self, n: usize) -> Result<u64, CloseReason> {
        self.record(&self.sent, n)
    }

    /// Count bytes delivered by the peer. Fails once the stream is closed.
    pub(crate) fn record_received(&self, n: usize) -> Result<u64, CloseReason> {
        self.record(&self.received, n)
    }

    fn record(&self, counter: &ByteCounter, n: usize) -> Result<u64, CloseReason> {
        // Holding the read guard keeps `close` out until the increment lands.
        let state = self.state.borrow();
        if state.is_closed() {
            return Err(self.close_reason().unwrap_or(CloseReason::Cancelled));
        }
        Ok(counter.increment(n as u64))
    }

    /// Idle → Open.
    pub(crate) fn activate(&self) -> MuxResult<StreamState> {
        self.transition("open", |s| match s {
            StreamState::Idle => Some(StreamState::Open),
            _ => None,
        })
    }

    /// The request body has been fully sent.
    pub(crate) fn end_local(&self) -> MuxResult<StreamState> {
        self.transition("finish the request body", |s| match s {
            StreamState::Open => Some(StreamState::HalfClosedLocal),
            StreamState::HalfClosedRemote => Some(StreamState::Closed),
            _ => None,
        })
    }

    /// The response body has been fully received.
    pub(crate) fn end_remote(&self) -> MuxResult<StreamState> {
        self.transition("finish the response body", |s| match s {
            StreamState::Open => Some(StreamState::HalfClosedRemote),
            StreamState::HalfClosedLocal => Some(StreamState::Closed),
            _ => None,
        })
    }

    /// Close with `reason`. Returns `false` if the stream was already closed,
    /// in which case the original reason is kept.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_closed() {
                return false;
            }
            let _ = self.reason.set(reason);
            *state = StreamState::Closed;
            true
        })
    }

    fn transition(
        &self,
        op: &'static str,
        next: impl FnOnce(StreamState) -> Option<StreamState>,
    ) -> MuxResult<StreamState> {
        let mut outcome = Err(StreamState::Idle);
        self.state.send_if_modified(|state| match next(*state) {
            Some(new) => {
                if new.is_closed() {
                    let _ = self.reason.set(CloseReason::Completed);
                }
                *state = new;
                outcome = Ok(new);
                true
            }
            None => {
                outcome = Err(*state);
                false
            }
        });
        outcome.map_err(|state| Error::InvalidState {
            stream: self.id,
            state,
            op,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn open_stream() -> Stream {
        let stream = Stream::new(StreamId(1));
        stream.activate().unwrap();
        stream
    }

    #[test]
    fn request_then_response_completes() {
        let stream = open_stream();
        assert_eq!(stream.end_local().unwrap(), StreamState::HalfClosedLocal);
        assert_eq!(stream.end_remote().unwrap(), StreamState::Closed);
        assert_eq!(stream.close_reason(), Some(CloseReason::Completed));
    }

    #[test]
    fn response_then_request_completes() {
        let stream = open_stream();
        assert_eq!(stream.end_remote().unwrap(), StreamState::HalfClosedRemote);
        assert_eq!(stream.end_local().unwrap(), StreamState::Closed);
        assert_eq!(stream.close_reason(), Some(CloseReason::Completed));
    }

    #[test]
    fn transitions_never_move_backwards() {
        let stream = open_stream();
        stream.end_local().unwrap();

        let err = stream.end_local().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                state: StreamState::HalfClosedLocal,
                ..
            }
        ));
        assert!(stream.activate().is_err());
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
    }

    #[test]
    fn idle_stream_cannot_finish() {
        let stream = Stream::new(StreamId(3));
        assert!(stream.end_local().is_err());
        assert!(stream.end_remote().is_err());
        assert_eq!(stream.state(), StreamState::Idle);
    }

    #[test]
    fn close_is_idempotent_and_keeps_first_reason() {
        let stream = open_stream();
        assert!(stream.close(CloseReason::AbortedByShutdown));
        assert!(!stream.close(CloseReason::Cancelled));
        assert!(!stream.close(CloseReason::AbortedByShutdown));
        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(stream.close_reason(), Some(CloseReason::AbortedByShutdown));
    }

    #[test]
    fn counters_freeze_once_closed() {
        let stream = open_stream();
        assert_eq!(stream.record_sent(5).unwrap(), 5);
        assert_eq!(stream.record_received(3).unwrap(), 3);

        stream.close(CloseReason::AbortedByShutdown);

        assert_eq!(
            stream.record_received(7),
            Err(CloseReason::AbortedByShutdown)
        );
        assert_eq!(stream.bytes_sent(), 5);
        assert_eq!(stream.bytes_received(), 3);
    }

    #[test]
    fn summary_reflects_state_and_counts() {
        let stream = open_stream();
        stream.record_sent(4).unwrap();
        let summary = stream.summary(ConnectionId(9));
        assert_eq!(summary.connection, ConnectionId(9));
        assert_eq!(summary.stream, StreamId(1));
        assert_eq!(summary.state, StreamState::Open);
        assert_eq!(summary.close_reason, None);
        assert_eq!(summary.bytes_sent, 4);
    }

    #[tokio::test]
    async fn closed_wakes_waiters() {
        let stream = Arc::new(open_stream());
        let waiter = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.closed().await })
        };
        tokio::task::yield_now().await;
        stream.close(CloseReason::Refused);
        assert_eq!(waiter.await.unwrap(), CloseReason::Refused);
    }

    #[test]
    fn tally_is_frozen_against_concurrent_close() {
        // The reader races the close; whatever it managed to count before the
        // close is the final tally, and nothing is counted afterwards.
        for _ in 0..500 {
            let stream = Arc::new(open_stream());
            let reader = {
                let stream = Arc::clone(&stream);
                std::thread::spawn(move || {
                    let mut counted = 0u64;
                    while stream.record_received(1).is_ok() {
                        counted += 1;
                    }
                    counted
                })
            };
            std::thread::yield_now();
            stream.close(CloseReason::AbortedByShutdown);
            let counted = reader.join().unwrap();
            let frozen = stream.bytes_received();
            assert_eq!(frozen, counted);
            assert_eq!(stream.bytes_received(), frozen);
        }
    }
}
