//! Graceful shutdown: one coordinator task per connection.
//!
//! The coordinator waits for the first trigger (the peer's GOAWAY, a local
//! `shutdown()`, or the last handle being dropped), stops admission, refuses
//! streams the peer never processed, then lets in-flight streams drain until
//! the deadline. Whatever is still open at the deadline is force-closed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionPhase, Shared};
use crate::stream::{CloseReason, StreamId};
use crate::transport::{GoAway, Transport};

/// What started the shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ShutdownTrigger {
    /// The peer sent GOAWAY.
    GoAway {
        last_stream_id: Option<StreamId>,
        debug: String,
    },
    /// `shutdown()` was called or every handle was dropped.
    Local,
}

/// Outcome of one drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownStats {
    pub trigger: ShutdownTrigger,
    /// Streams not yet closed when shutdown began.
    pub in_flight: usize,
    /// Streams that finished on their own before the deadline.
    pub drained: usize,
    /// Streams above the GOAWAY watermark.
    pub refused: usize,
    /// Streams closed with `AbortedByShutdown` at the deadline.
    pub force_closed: usize,
    pub duration_ms: u64,
}

pub(crate) struct ShutdownCoordinator<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> ShutdownCoordinator<T> {
    pub(crate) fn spawn(shared: Arc<Shared<T>>) {
        let coordinator = Self { shared };
        tokio::spawn(coordinator.run());
    }

    async fn run(self) {
        let signal = self.shared.transport.take_shutdown_signal();
        let phase = self.shared.phase.subscribe();
        let trigger = tokio::select! {
            goaway = remote_goaway(signal) => ShutdownTrigger::GoAway {
                last_stream_id: goaway.last_stream_id,
                debug: goaway.debug,
            },
            _ = self.shared.local_shutdown.notified() => ShutdownTrigger::Local,
            _ = phase_closed(phase) => {
                debug!(connection = %self.shared.id(), "connection closed before any shutdown trigger");
                return;
            }
        };
        self.drain(trigger).await;
    }

    async fn drain(&self, trigger: ShutdownTrigger) {
        let shared = &self.shared;
        let connection = shared.id();
        let started = Instant::now();
        let deadline = started + shared.config.drain_timeout;

        if !shared.registry.begin_shutdown(deadline) {
            // A fatal transport error got here first.
            shared.finish();
            return;
        }
        shared.mark_draining();
        let in_flight = shared.registry.active_count();
        info!(
            connection = %connection,
            trigger = ?trigger,
            in_flight,
            drain_timeout_ms = shared.config.drain_timeout.as_millis() as u64,
            "shutdown started"
        );

        let mut refused = 0;
        if let ShutdownTrigger::GoAway { last_stream_id, .. } = &trigger {
            let goaway = GoAway::new(*last_stream_id);
            for stream in shared.registry.open_streams() {
                if goaway.refuses(stream.id()) && shared.abandon(&stream, CloseReason::Refused) {
                    warn!(
                        connection = %connection,
                        stream = %stream.id(),
                        last_stream_id = ?last_stream_id,
                        "stream refused by peer"
                    );
                    refused += 1;
                }
            }
        }

        let active = shared.registry.subscribe_active();
        let phase = shared.phase.subscribe();
        let drained_in_time = tokio::time::timeout_at(
            tokio::time::Instant::from_std(deadline),
            drained(active, phase),
        )
        .await
        .is_ok();

        let mut force_closed = 0;
        if !drained_in_time {
            for stream in shared.registry.open_streams() {
                if shared.abandon(&stream, CloseReason::AbortedByShutdown) {
                    warn!(
                        connection = %connection,
                        stream = %stream.id(),
                        reason = "aborted-by-shutdown",
                        bytes_sent = stream.bytes_sent(),
                        bytes_received = stream.bytes_received(),
                        age_ms = elapsed_ms(stream.age()),
                        "force-closed stream at drain deadline"
                    );
                    force_closed += 1;
                }
            }
        }

        let stats = ShutdownStats {
            trigger,
            in_flight,
            drained: in_flight.saturating_sub(refused + force_closed),
            refused,
            force_closed,
            duration_ms: elapsed_ms(started.elapsed()),
        };
        info!(
            connection = %connection,
            drained = stats.drained,
            refused = stats.refused,
            force_closed = stats.force_closed,
            duration_ms = stats.duration_ms,
            "drain complete"
        );
        let _ = shared.stats.set(stats);
        shared.finish();
    }
}

/// Resolves with the peer's GOAWAY; pending forever if there is none.
async fn remote_goaway(signal: Option<oneshot::Receiver<GoAway>>) -> GoAway {
    match signal {
        Some(rx) => match rx.await {
            Ok(goaway) => goaway,
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn phase_closed(mut phase: watch::Receiver<ConnectionPhase>) {
    let _ = phase.wait_for(|p| *p == ConnectionPhase::Closed).await;
}

/// Every stream closed, or the connection closed underneath the drain.
async fn drained(mut active: watch::Receiver<usize>, phase: watch::Receiver<ConnectionPhase>) {
    tokio::select! {
        _ = async { let _ = active.wait_for(|n| *n == 0).await; } => {}
        _ = phase_closed(phase) => {}
    }
}

fn elapsed_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
