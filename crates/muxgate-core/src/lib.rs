//! Stream lifecycle and body accounting for multiplexed connections.
//!
//! A [`Connection`] carries many concurrent request/response streams over
//! one [`Transport`]. Each stream has a monotonic state machine and two
//! byte counters that freeze once it closes. When the peer announces
//! shutdown (GOAWAY) or the caller asks for one, the connection stops
//! admitting streams, lets in-flight ones drain until a deadline, then
//! force-closes the rest and releases the transport.

pub mod config;
pub mod connection;
pub mod counter;
pub mod error;
pub mod registry;
pub mod shutdown;
pub mod stream;
pub mod transport;

pub use config::{ConfigError, ConnectionConfig};
pub use connection::{Connection, ConnectionPhase};
pub use counter::ByteCounter;
pub use error::{Error, ErrorKind, MuxResult, TransportError};
pub use registry::ConnectionRegistry;
pub use shutdown::{ShutdownStats, ShutdownTrigger};
pub use stream::{CloseReason, Stream, StreamId, StreamState, StreamSummary};
pub use transport::{ConnectionId, Dialer, GoAway, Transport};
