//! Connection handle, the engine's public surface.
//!
//! A [`Connection`] owns the transport, the registry and the shutdown
//! coordinator task. Handles are cheap to clone and are passed to every
//! worker; dropping the last one starts a graceful shutdown.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info};

use crate::config::ConnectionConfig;
use crate::error::{Error, MuxResult, TransportError};
use crate::registry::ConnectionRegistry;
use crate::shutdown::{ShutdownCoordinator, ShutdownStats};
use crate::stream::{CloseReason, Stream, StreamId, StreamState, StreamSummary};
use crate::transport::{ConnectionId, Dialer, Transport};

/// Connection-level lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionPhase {
    Open,
    /// Shutdown started; in-flight streams are finishing.
    Draining,
    /// Terminal. The transport has been released.
    Closed,
}

/// State shared by every handle and the coordinator task.
pub(crate) struct Shared<T> {
    pub(crate) transport: T,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) config: ConnectionConfig,
    pub(crate) phase: watch::Sender<ConnectionPhase>,
    pub(crate) local_shutdown: Arc<Notify>,
    pub(crate) stats: OnceLock<ShutdownStats>,
    failure: OnceLock<TransportError>,
}

impl<T: Transport> Shared<T> {
    pub(crate) fn id(&self) -> ConnectionId {
        self.registry.connection()
    }

    pub(crate) fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    /// Open → Draining.
    pub(crate) fn mark_draining(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == ConnectionPhase::Open {
                *phase = ConnectionPhase::Draining;
                true
            } else {
                false
            }
        });
    }

    /// Transition to `Closed` and release the transport. Only the first
    /// caller does anything.
    pub(crate) fn finish(&self) -> bool {
        let closed = self.phase.send_if_modified(|phase| {
            if *phase == ConnectionPhase::Closed {
                false
            } else {
                *phase = ConnectionPhase::Closed;
                true
            }
        });
        if closed {
            self.transport.close();
            info!(connection = %self.id(), "connection closed");
        }
        closed
    }

    /// Close one stream and tell the peer. `false` if it was already closed.
    pub(crate) fn abandon(&self, stream: &Stream, reason: CloseReason) -> bool {
        let closed = self.registry.close(stream, reason);
        if closed {
            self.transport.reset(stream.id());
        }
        closed
    }

    /// A fatal transport error: every stream is aborted and the connection
    /// closes immediately.
    fn fail(&self, failure: TransportError) {
        if self.failure.set(failure.clone()).is_err() {
            return;
        }
        self.registry.begin_shutdown(Instant::now());
        let streams = self.registry.open_streams();
        error!(
            connection = %self.id(),
            error = %failure,
            streams = streams.len(),
            "fatal transport error, aborting connection"
        );
        for stream in &streams {
            self.registry.close(stream, CloseReason::TransportFailure);
        }
        self.finish();
    }

    /// Error for an operation on a stream that is already closed.
    fn closed_error(&self, stream: &Stream, reason: CloseReason, op: &'static str) -> Error {
        let connection = self.id();
        let id = stream.id();
        match reason {
            CloseReason::AbortedByShutdown => Error::AbortedByShutdown {
                connection,
                stream: id,
            },
            CloseReason::Refused => Error::ConnectionClosing {
                connection,
                stream: Some(id),
            },
            CloseReason::TransportFailure => Error::Transport {
                connection,
                stream: Some(id),
                source: self
                    .failure
                    .get()
                    .cloned()
                    .unwrap_or(TransportError::StreamReset(id)),
            },
            CloseReason::Cancelled => Error::Cancelled {
                connection,
                stream: id,
            },
            CloseReason::Completed => Error::InvalidState {
                stream: id,
                state: StreamState::Closed,
                op,
            },
        }
    }

    /// Map a transport error on one stream, closing the stream (or the whole
    /// connection when the error is fatal).
    fn transport_failure(&self, stream: &Stream, failure: TransportError) -> Error {
        let connection = self.id();
        let id = stream.id();
        if let Some(reason) = stream.close_reason() {
            return self.closed_error(stream, reason, "transfer body");
        }
        match &failure {
            TransportError::Refused(_) => {
                self.abandon(stream, CloseReason::Refused);
            }
            fatal if fatal.is_fatal() => self.fail(fatal.clone()),
            _ => {
                self.abandon(stream, CloseReason::TransportFailure);
            }
        }
        match stream.close_reason() {
            Some(CloseReason::TransportFailure) | None => Error::Transport {
                connection,
                stream: Some(id),
                source: failure,
            },
            Some(reason) => self.closed_error(stream, reason, "transfer body"),
        }
    }

    /// Map a failed transition, preferring the close reason if the stream
    /// was closed underneath us.
    fn settle(&self, stream: &Stream, result: MuxResult<StreamState>) -> MuxResult<StreamState> {
        result.map_err(|err| {
            let op = match &err {
                Error::InvalidState { op, .. } => *op,
                _ => return err,
            };
            match stream.close_reason() {
                Some(reason) => self.closed_error(stream, reason, op),
                None => err,
            }
        })
    }

    fn ensure(
        &self,
        stream: &Stream,
        allowed: fn(StreamState) -> bool,
        op: &'static str,
    ) -> MuxResult<()> {
        let state = stream.state();
        if allowed(state) {
            return Ok(());
        }
        match stream.close_reason() {
            Some(reason) => Err(self.closed_error(stream, reason, op)),
            None => Err(Error::InvalidState {
                stream: stream.id(),
                state,
                op,
            }),
        }
    }
}

/// Wakes the coordinator when the last handle goes away.
struct HandleGuard {
    local_shutdown: Arc<Notify>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.local_shutdown.notify_one();
    }
}

/// Handle to one multiplexed connection.
pub struct Connection<T: Transport> {
    shared: Arc<Shared<T>>,
    _guard: Arc<HandleGuard>,
}

impl<T: Transport> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _guard: Arc::clone(&self._guard),
        }
    }
}

impl<T: Transport> Connection<T> {
    /// Wrap a dialed transport and start its shutdown coordinator.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(transport: T, config: ConnectionConfig) -> MuxResult<Self> {
        config.validate()?;
        let local_shutdown = Arc::new(Notify::new());
        let shared = Arc::new(Shared {
            registry: ConnectionRegistry::new(transport.id()),
            transport,
            config,
            phase: watch::channel(ConnectionPhase::Open).0,
            local_shutdown: Arc::clone(&local_shutdown),
            stats: OnceLock::new(),
            failure: OnceLock::new(),
        });
        ShutdownCoordinator::spawn(Arc::clone(&shared));
        info!(connection = %shared.id(), "connection established");
        Ok(Self {
            shared,
            _guard: Arc::new(HandleGuard { local_shutdown }),
        })
    }

    /// Dial a transport and wrap it.
    pub async fn dial<D>(dialer: &D, config: ConnectionConfig) -> MuxResult<Self>
    where
        D: Dialer<Transport = T>,
    {
        let transport = dialer.dial().await.map_err(Error::Dial)?;
        Self::new(transport, config)
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Register a stream and announce it to the peer.
    pub fn open_stream(&self) -> MuxResult<StreamId> {
        let opened = self.shared.registry.open_stream();
        if self.shared.registry.is_exhausted() {
            // Out of ids: drain and retire so the caller can redial.
            self.shared.local_shutdown.notify_one();
        }
        let stream = opened?;
        let id = stream.id();
        if let Err(e) = self.shared.transport.open(id) {
            return Err(self.shared.transport_failure(&stream, e));
        }
        if let Err(e) = self
            .shared
            .settle(&stream, self.shared.registry.activate(&stream))
        {
            self.shared.transport.reset(id);
            return Err(e);
        }
        debug!(connection = %self.id(), stream = %id, "stream opened");
        Ok(id)
    }

    /// Write request body bytes, split into frames of at most
    /// `max_frame_size`. Returns the stream's running `bytes_sent`.
    pub async fn write_body(&self, id: StreamId, body: Bytes) -> MuxResult<u64> {
        let stream = self.shared.registry.get(id)?;
        self.shared
            .ensure(&stream, StreamState::can_send, "write the request body")?;

        let frame_size = self.shared.config.max_frame_size;
        let mut total = stream.bytes_sent();
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + frame_size).min(body.len());
            let frame = body.slice(offset..end);
            tokio::select! {
                sent = self.shared.transport.send_bytes(id, frame) => {
                    if let Err(e) = sent {
                        return Err(self.shared.transport_failure(&stream, e));
                    }
                }
                reason = stream.closed() => {
                    return Err(self.shared.closed_error(&stream, reason, "write the request body"));
                }
            }
            total = stream
                .record_sent(end - offset)
                .map_err(|reason| self.shared.closed_error(&stream, reason, "write the request body"))?;
            offset = end;
        }
        Ok(total)
    }

    /// End the request body (local half-close).
    pub fn finish_body(&self, id: StreamId) -> MuxResult<StreamState> {
        let stream = self.shared.registry.get(id)?;
        self.shared
            .ensure(&stream, StreamState::can_send, "finish the request body")?;
        if let Err(e) = self.shared.transport.finish(id) {
            return Err(self.shared.transport_failure(&stream, e));
        }
        self.shared
            .settle(&stream, self.shared.registry.end_local(&stream))
    }

    /// Next chunk of the response body, or `None` at end of body (which
    /// half-closes the remote side).
    ///
    /// A read blocked on the transport is released with
    /// [`Error::AbortedByShutdown`] if the stream is force-closed.
    pub async fn read_body(&self, id: StreamId) -> MuxResult<Option<Bytes>> {
        const OP: &str = "read the response body";
        let stream = self.shared.registry.get(id)?;
        self.shared.ensure(&stream, StreamState::can_receive, OP)?;

        let received = tokio::select! {
            received = self.shared.transport.receive_bytes(id) => received,
            reason = stream.closed() => return Err(self.shared.closed_error(&stream, reason, OP)),
        };
        match received {
            Ok(Some(chunk)) => {
                stream
                    .record_received(chunk.len())
                    .map_err(|reason| self.shared.closed_error(&stream, reason, OP))?;
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.shared
                    .settle(&stream, self.shared.registry.end_remote(&stream))?;
                Ok(None)
            }
            Err(e) => Err(self.shared.transport_failure(&stream, e)),
        }
    }

    /// Read the rest of the response body.
    pub async fn read_to_end(&self, id: StreamId) -> MuxResult<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read_body(id).await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    pub fn stream_state(&self, id: StreamId) -> MuxResult<StreamState> {
        Ok(self.shared.registry.get(id)?.state())
    }

    pub fn stream_summary(&self, id: StreamId) -> MuxResult<StreamSummary> {
        Ok(self.shared.registry.get(id)?.summary(self.id()))
    }

    /// Summaries of every stream still registered.
    pub fn summaries(&self) -> Vec<StreamSummary> {
        self.shared.registry.summaries()
    }

    /// Cancel a stream locally. Returns `false` if it was already closed.
    pub fn reset_stream(&self, id: StreamId) -> MuxResult<bool> {
        let stream = self.shared.registry.get(id)?;
        Ok(self.shared.abandon(&stream, CloseReason::Cancelled))
    }

    /// Drop a closed stream's bookkeeping, returning its final summary.
    pub fn close_stream(&self, id: StreamId) -> MuxResult<StreamSummary> {
        let stream = self.shared.registry.close_stream(id)?;
        self.shared.transport.release(id);
        Ok(stream.summary(self.id()))
    }

    pub fn active_count(&self) -> usize {
        self.shared.registry.active_count()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.registry.is_shutting_down()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.shared.phase()
    }

    /// Closed, with no stream left active.
    pub fn connection_drained(&self) -> bool {
        self.phase() == ConnectionPhase::Closed && self.active_count() == 0
    }

    /// Wait until the connection is closed.
    pub async fn wait_drained(&self) {
        let mut phase = self.shared.phase.subscribe();
        let _ = phase.wait_for(|p| *p == ConnectionPhase::Closed).await;
    }

    /// Start a graceful shutdown from this side.
    pub fn shutdown(&self) {
        self.shared.local_shutdown.notify_one();
    }

    /// What the coordinator observed, once the connection has closed
    /// through a drain.
    pub fn shutdown_stats(&self) -> Option<ShutdownStats> {
        self.shared.stats.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MAX_STREAM_ID;
    use crate::shutdown::ShutdownTrigger;
    use crate::transport::memory::{self, MemoryTransport};
    use std::time::Duration;

    fn connect() -> (Connection<MemoryTransport>, memory::MemoryPeer) {
        let (transport, peer) = memory::pair(ConnectionId(1), 4);
        let config = ConnectionConfig {
            drain_timeout: Duration::from_millis(200),
            ..ConnectionConfig::default()
        };
        (Connection::new(transport, config).unwrap(), peer)
    }

    #[tokio::test]
    async fn exhausted_ids_retire_the_connection() {
        let (conn, _peer) = connect();
        conn.shared.registry.skip_ids_to(MAX_STREAM_ID);

        let last = conn.open_stream().unwrap();
        assert_eq!(last, StreamId(MAX_STREAM_ID));
        assert!(conn.is_shutting_down());
        let err = conn.open_stream().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectionClosing);

        assert!(conn.reset_stream(last).unwrap());
        tokio::time::timeout(Duration::from_secs(5), conn.wait_drained())
            .await
            .expect("connection never drained");
        assert!(conn.connection_drained());
        let stats = conn.shutdown_stats().unwrap();
        assert_eq!(stats.trigger, ShutdownTrigger::Local);
        assert_eq!(stats.force_closed, 0);
    }

    #[tokio::test]
    async fn completed_streams_release_transport_state() {
        let (conn, mut peer) = connect();
        let responder = tokio::spawn(async move {
            while let Some(mut stream) = peer.accept().await {
                let body = stream.read_to_end().await.unwrap();
                stream.write(body).await.unwrap();
                stream.finish();
            }
        });

        for _ in 0..100 {
            let id = conn.open_stream().unwrap();
            conn.write_body(id, Bytes::from_static(b"hello")).await.unwrap();
            conn.finish_body(id).unwrap();
            assert_eq!(&conn.read_to_end(id).await.unwrap()[..], b"hello");
            conn.close_stream(id).unwrap();
        }
        assert!(conn.summaries().is_empty());
        assert_eq!(conn.shared.transport.stream_count(), 0);

        conn.shutdown();
        conn.wait_drained().await;
        responder.await.unwrap();
    }
}
