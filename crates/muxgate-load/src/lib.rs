//! Drives many concurrent streams through shared connections and checks
//! every byte end to end.

pub mod config;
pub mod dispatcher;
pub mod pool;
pub mod responder;
pub mod scenario;
pub mod verifier;

pub use config::{GoAwayPolicy, LoadConfig, LoadSettings, ResponderConfig};
pub use dispatcher::{DispatchReport, Outcome, RequestRecord, WorkItem, WorkerDispatcher};
pub use pool::ConnectionPool;
pub use responder::{EchoResponder, ResponderLedger, ResponderRecord};
pub use scenario::{ConnectionReport, HelloReport, StressReport, run_hello, run_stress};
pub use verifier::{BodyMismatch, IntegrityVerifier, MismatchKind, RequesterRecord, VerificationReport};
