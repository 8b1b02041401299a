//! End-to-end scenarios over the memory transport.

use std::sync::Arc;

use anyhow::{Context, bail};
use bytes::Bytes;
use muxgate_core::transport::memory::{self, MemoryPeer, MemoryTransport};
use muxgate_core::{
    Connection, ConnectionConfig, ConnectionId, ConnectionPhase, ErrorKind, ShutdownStats,
    StreamSummary,
};
use serde::Serialize;
use tracing::info;

use crate::config::{GoAwayPolicy, LoadConfig, ResponderConfig};
use crate::dispatcher::{DispatchReport, Outcome, WorkItem, WorkerDispatcher};
use crate::pool::ConnectionPool;
use crate::responder::{EchoResponder, ResponderLedger};
use crate::verifier::{IntegrityVerifier, RequesterRecord, VerificationReport};

/// Failure kinds a load run tolerates: the request was turned away or cut
/// off by a shutdown.
pub const ALLOWED_FAILURES: [ErrorKind; 2] =
    [ErrorKind::ConnectionClosing, ErrorKind::AbortedByShutdown];

/// Final state of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub connection: ConnectionId,
    pub phase: ConnectionPhase,
    pub active_streams: usize,
    pub shutdown: Option<ShutdownStats>,
}

impl ConnectionReport {
    fn of(conn: &Connection<MemoryTransport>) -> Self {
        Self {
            connection: conn.id(),
            phase: conn.phase(),
            active_streams: conn.active_count(),
            shutdown: conn.shutdown_stats(),
        }
    }

    pub fn is_drained(&self) -> bool {
        self.phase == ConnectionPhase::Closed && self.active_streams == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub dispatch: DispatchReport,
    pub verification: VerificationReport,
    pub connections: Vec<ConnectionReport>,
}

impl StressReport {
    /// Everything that makes this run a failure.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for mismatch in &self.verification.mismatches {
            problems.push(format!(
                "connection {} stream {}: {} mismatch ({} vs {} bytes)",
                mismatch.connection,
                mismatch.stream,
                mismatch.kind,
                mismatch.expected_len,
                mismatch.actual_len
            ));
        }
        for record in &self.dispatch.records {
            match &record.outcome {
                Outcome::Completed => {}
                Outcome::Failed { kind, message } if !ALLOWED_FAILURES.contains(kind) => {
                    problems.push(format!("request {}: {kind}: {message}", record.index));
                }
                Outcome::Failed { .. } => {}
                Outcome::Panicked { message } => {
                    problems.push(format!("request {}: worker panicked: {message}", record.index));
                }
            }
        }
        for conn in &self.connections {
            if !conn.is_drained() {
                problems.push(format!(
                    "connection {} ended {:?} with {} active streams",
                    conn.connection, conn.phase, conn.active_streams
                ));
            }
        }
        problems
    }

    pub fn is_ok(&self) -> bool {
        self.problems().is_empty()
    }
}

/// Run `load.requests` requests across `load.workers` workers, then shut
/// the pool down and verify every stream.
pub async fn run_stress(config: &LoadConfig) -> anyhow::Result<StressReport> {
    config.validate()?;
    let load = &config.load;

    let ledger = ResponderLedger::new();
    let responder = EchoResponder::new(config.responder.clone(), ledger.clone());
    let dialer = memory::MemoryDialer::new(config.connection.stream_window, move |peer: MemoryPeer| {
        responder.spawn(peer)
    });
    let pool = Arc::new(ConnectionPool::new(dialer, config.connection.clone()));
    let verifier = Arc::new(IntegrityVerifier::new(ledger));
    let dispatcher = WorkerDispatcher::new(
        Arc::clone(&pool),
        Arc::clone(&verifier),
        load.workers,
        load.max_attempts,
    );

    let items = (0..load.requests)
        .map(|i| WorkItem::new(i, format!("{}-{i}", load.body)))
        .collect();
    let dispatch = dispatcher.run(items).await;
    pool.shutdown().await;

    let connections: Vec<ConnectionReport> =
        pool.connections().iter().map(ConnectionReport::of).collect();
    let report = StressReport {
        dispatch,
        verification: verifier.verify(),
        connections,
    };
    info!(
        requests = load.requests,
        completed = report.dispatch.completed(),
        connections = report.connections.len(),
        mismatches = report.verification.mismatches.len(),
        "stress run finished"
    );
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
pub struct HelloReport {
    pub response: String,
    pub stream: StreamSummary,
    pub connection: ConnectionReport,
}

/// One five-byte request to a peer that sends GOAWAY right after answering.
pub async fn run_hello(config: &ConnectionConfig) -> anyhow::Result<HelloReport> {
    config.validate()?;
    let ledger = ResponderLedger::new();
    let responder = EchoResponder::new(
        ResponderConfig {
            goaway: GoAwayPolicy::AfterEachResponse,
            ..ResponderConfig::default()
        },
        ledger.clone(),
    );
    let (transport, peer) = memory::pair(ConnectionId(1), config.stream_window);
    responder.spawn(peer);
    let conn = Connection::new(transport, config.clone())?;

    let body = Bytes::from_static(b"hello");
    let id = conn.open_stream()?;
    conn.write_body(id, body.clone()).await?;
    conn.finish_body(id)?;
    let response = conn.read_to_end(id).await?;

    tokio::time::timeout(
        config.drain_timeout + std::time::Duration::from_secs(1),
        conn.wait_drained(),
    )
    .await
    .context("connection did not drain")?;

    let summary = conn.close_stream(id)?;
    let verifier = IntegrityVerifier::new(ledger);
    verifier.record(RequesterRecord {
        summary: summary.clone(),
        sent: body,
        received: response.clone(),
    });
    verifier.verify().ensure_clean()?;

    let report = HelloReport {
        response: String::from_utf8_lossy(&response).into_owned(),
        stream: summary,
        connection: ConnectionReport::of(&conn),
    };
    if report.response != "hello" {
        bail!("unexpected response {:?}", report.response);
    }
    if !report.connection.is_drained() {
        bail!("connection {} did not drain", report.connection.connection);
    }
    Ok(report)
}
