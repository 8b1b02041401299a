//! What the engine needs from the transport underneath.
//!
//! Framing, TLS and header compression live below this trait. The engine
//! only moves body bytes per stream and listens for the peer's shutdown
//! signal.

pub mod memory;

use std::fmt;
use std::future::Future;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::stream::StreamId;

/// Identifies one dialed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The peer's shutdown notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAway {
    /// Highest stream id the peer accepted. Streams above it were never
    /// processed. `None` means the peer accepted no stream at all.
    pub last_stream_id: Option<StreamId>,
    pub debug: String,
}

impl GoAway {
    pub fn new(last_stream_id: Option<StreamId>) -> Self {
        Self {
            last_stream_id,
            debug: String::new(),
        }
    }

    /// Whether `id` was left unprocessed by the peer.
    pub fn refuses(&self, id: StreamId) -> bool {
        match self.last_stream_id {
            Some(last) => id > last,
            None => true,
        }
    }
}

/// A multiplexed byte transport carrying many streams.
pub trait Transport: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    /// Announce a new stream to the peer.
    fn open(&self, id: StreamId) -> Result<(), TransportError>;

    /// Send one body chunk. May wait for window.
    fn send_bytes(
        &self,
        id: StreamId,
        chunk: Bytes,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// End the local half of the stream.
    fn finish(&self, id: StreamId) -> Result<(), TransportError>;

    /// Next chunk from the peer, or `None` at end of body.
    fn receive_bytes(
        &self,
        id: StreamId,
    ) -> impl Future<Output = Result<Option<Bytes>, TransportError>> + Send;

    /// Abandon a stream and release its resources.
    fn reset(&self, id: StreamId);

    /// Drop the state of a stream that completed normally.
    fn release(&self, id: StreamId);

    /// The shutdown signal. Yields `Some` exactly once.
    fn take_shutdown_signal(&self) -> Option<oneshot::Receiver<GoAway>>;

    /// Release the connection.
    fn close(&self);
}

/// Establishes transports.
pub trait Dialer: Send + Sync + 'static {
    type Transport: Transport;

    fn dial(&self) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goaway_refuses_streams_above_watermark() {
        let goaway = GoAway::new(Some(StreamId(5)));
        assert!(!goaway.refuses(StreamId(1)));
        assert!(!goaway.refuses(StreamId(5)));
        assert!(goaway.refuses(StreamId(7)));
    }

    #[test]
    fn goaway_before_any_accept_refuses_everything() {
        let goaway = GoAway::new(None);
        assert!(goaway.refuses(StreamId(1)));
    }
}
