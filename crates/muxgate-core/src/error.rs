//! Error types for the stream engine.

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::stream::{StreamId, StreamState};
use crate::transport::ConnectionId;

/// Result type alias for stream engine operations.
pub type MuxResult<T> = Result<T, Error>;

/// Failures reported by the transport layer underneath the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer never processed the stream (it is above the GOAWAY watermark).
    #[error("stream {0} refused by peer")]
    Refused(StreamId),

    #[error("stream {0} reset by peer")]
    StreamReset(StreamId),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("transport closed")]
    Closed,

    #[error("dial failed: {0}")]
    Dial(String),
}

impl TransportError {
    /// Fatal errors take the whole connection down, not just one stream.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Closed | Self::Dial(_))
    }
}

/// Errors surfaced by the engine to its callers.
///
/// Every variant that concerns a single stream carries the stream id so
/// failures stay attributable when many workers share one connection.
#[derive(Debug, Error)]
pub enum Error {
    /// Shutdown has started (or the peer refused the stream); retry on
    /// another connection.
    #[error("connection {connection} is closing")]
    ConnectionClosing {
        connection: ConnectionId,
        stream: Option<StreamId>,
    },

    /// Force-closed at the drain deadline. Byte counts are partial.
    #[error("stream {stream} on connection {connection} aborted by shutdown")]
    AbortedByShutdown {
        connection: ConnectionId,
        stream: StreamId,
    },

    #[error("stream {stream} on connection {connection}: body mismatch: {detail}")]
    BodyMismatch {
        connection: ConnectionId,
        stream: StreamId,
        detail: String,
    },

    #[error("transport error on connection {connection}: {source}")]
    Transport {
        connection: ConnectionId,
        stream: Option<StreamId>,
        #[source]
        source: TransportError,
    },

    #[error("stream {stream} on connection {connection} was cancelled")]
    Cancelled {
        connection: ConnectionId,
        stream: StreamId,
    },

    #[error("unknown stream {stream} on connection {connection}")]
    UnknownStream {
        connection: ConnectionId,
        stream: StreamId,
    },

    #[error("stream {stream} cannot {op} in state {state:?}")]
    InvalidState {
        stream: StreamId,
        state: StreamState,
        op: &'static str,
    },

    #[error("stream {stream} is still {state:?}; only closed streams can be removed")]
    StreamNotClosed { stream: StreamId, state: StreamState },

    #[error("dial failed: {0}")]
    Dial(#[source] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Reason code for an [`Error`], suitable for aggregation and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ConnectionClosing,
    AbortedByShutdown,
    BodyMismatch,
    Transport,
    Cancelled,
    Protocol,
    Dial,
    Config,
}

impl ErrorKind {
    /// Only a closing connection is worth retrying, and only elsewhere.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ConnectionClosing)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ConnectionClosing => "connection-closing",
            Self::AbortedByShutdown => "aborted-by-shutdown",
            Self::BodyMismatch => "body-mismatch",
            Self::Transport => "transport",
            Self::Cancelled => "cancelled",
            Self::Protocol => "protocol",
            Self::Dial => "dial",
            Self::Config => "config",
        };
        f.write_str(s)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionClosing { .. } => ErrorKind::ConnectionClosing,
            Self::AbortedByShutdown { .. } => ErrorKind::AbortedByShutdown,
            Self::BodyMismatch { .. } => ErrorKind::BodyMismatch,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::UnknownStream { .. }
            | Self::InvalidState { .. }
            | Self::StreamNotClosed { .. } => ErrorKind::Protocol,
            Self::Dial(_) => ErrorKind::Dial,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// The stream this error is attributed to, if any.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Self::ConnectionClosing { stream, .. } | Self::Transport { stream, .. } => *stream,
            Self::AbortedByShutdown { stream, .. }
            | Self::BodyMismatch { stream, .. }
            | Self::Cancelled { stream, .. }
            | Self::UnknownStream { stream, .. }
            | Self::InvalidState { stream, .. }
            | Self::StreamNotClosed { stream, .. } => Some(*stream),
            Self::Dial(_) | Self::Config(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_closing_is_retryable() {
        let conn = ConnectionId(1);
        let closing = Error::ConnectionClosing {
            connection: conn,
            stream: None,
        };
        let aborted = Error::AbortedByShutdown {
            connection: conn,
            stream: StreamId(3),
        };
        assert!(closing.is_retryable());
        assert!(!aborted.is_retryable());
        assert!(!ErrorKind::BodyMismatch.is_retryable());
    }

    #[test]
    fn errors_are_attributed_to_streams() {
        let err = Error::Transport {
            connection: ConnectionId(2),
            stream: Some(StreamId(5)),
            source: TransportError::StreamReset(StreamId(5)),
        };
        assert_eq!(err.stream_id(), Some(StreamId(5)));
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("reset by peer"));
    }

    #[test]
    fn fatal_transport_errors() {
        assert!(TransportError::Closed.is_fatal());
        assert!(TransportError::ConnectionLost("eof".into()).is_fatal());
        assert!(!TransportError::Refused(StreamId(1)).is_fatal());
        assert!(!TransportError::StreamReset(StreamId(1)).is_fatal());
    }

    #[test]
    fn kind_serializes_like_display() {
        let json = serde_json::to_string(&ErrorKind::AbortedByShutdown).unwrap();
        assert_eq!(json, format!("\"{}\"", ErrorKind::AbortedByShutdown));
    }
}
