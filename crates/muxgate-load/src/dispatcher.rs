//! Worker dispatcher: a fixed pool of workers draining a shared queue.
//!
//! Each worker pops a request, runs one stream exchange on the pool's
//! current connection and records the outcome. `ConnectionClosing` is
//! retried on a fresh connection; every other failure is recorded against
//! the request and the worker moves on. `run` returns once the queue is
//! empty and every worker has exited.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use muxgate_core::{
    Connection, ConnectionId, Dialer, Error, ErrorKind, MuxResult, StreamId, StreamSummary,
    Transport,
};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::pool::ConnectionPool;
use crate::verifier::{IntegrityVerifier, RequesterRecord};

/// One queued request.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub index: usize,
    pub body: Bytes,
}

impl WorkItem {
    pub fn new(index: usize, body: impl Into<Bytes>) -> Self {
        Self {
            index,
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Outcome {
    Completed,
    Failed { kind: ErrorKind, message: String },
    /// The worker running this request panicked.
    Panicked { message: String },
}

/// Result of one request, across all of its attempts.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub index: usize,
    pub worker: usize,
    pub attempts: u32,
    /// Connection and stream of the last attempt.
    pub connection: Option<ConnectionId>,
    pub stream: Option<StreamId>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub outcome: Outcome,
}

impl RequestRecord {
    fn new(index: usize, worker: usize) -> Self {
        Self {
            index,
            worker,
            attempts: 0,
            connection: None,
            stream: None,
            bytes_sent: 0,
            bytes_received: 0,
            outcome: Outcome::Failed {
                kind: ErrorKind::ConnectionClosing,
                message: "attempts exhausted".to_string(),
            },
        }
    }

    fn fail(&mut self, err: &Error) {
        self.outcome = Outcome::Failed {
            kind: err.kind(),
            message: err.to_string(),
        };
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == Outcome::Completed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub workers: usize,
    /// Sorted by request index.
    pub records: Vec<RequestRecord>,
    pub elapsed_ms: u64,
}

impl DispatchReport {
    pub fn completed(&self) -> usize {
        self.records.iter().filter(|r| r.is_completed()).count()
    }

    pub fn failures_by_kind(&self) -> BTreeMap<ErrorKind, usize> {
        let mut failures = BTreeMap::new();
        for record in &self.records {
            if let Outcome::Failed { kind, .. } = record.outcome {
                *failures.entry(kind).or_default() += 1;
            }
        }
        failures
    }

    pub fn panicked(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Panicked { .. }))
            .count()
    }

    /// Attempts beyond the first, summed over every request.
    pub fn retries(&self) -> u64 {
        self.records
            .iter()
            .map(|r| u64::from(r.attempts.saturating_sub(1)))
            .sum()
    }
}

struct Shared<D: Dialer> {
    pool: Arc<ConnectionPool<D>>,
    verifier: Arc<IntegrityVerifier>,
    max_attempts: u32,
    queue: Mutex<VecDeque<WorkItem>>,
    records: Mutex<Vec<RequestRecord>>,
    /// Request each worker is running, by worker index.
    current: Mutex<Vec<Option<usize>>>,
    #[cfg(test)]
    panic_on: Option<usize>,
}

pub struct WorkerDispatcher<D: Dialer> {
    pool: Arc<ConnectionPool<D>>,
    verifier: Arc<IntegrityVerifier>,
    workers: usize,
    max_attempts: u32,
    #[cfg(test)]
    panic_on: Option<usize>,
}

impl<D: Dialer> WorkerDispatcher<D> {
    pub fn new(
        pool: Arc<ConnectionPool<D>>,
        verifier: Arc<IntegrityVerifier>,
        workers: usize,
        max_attempts: u32,
    ) -> Self {
        Self {
            pool,
            verifier,
            workers: workers.max(1),
            max_attempts: max_attempts.max(1),
            #[cfg(test)]
            panic_on: None,
        }
    }

    /// Run every item to completion.
    pub async fn run(&self, items: Vec<WorkItem>) -> DispatchReport {
        let started = Instant::now();
        let total = items.len();
        let shared = Arc::new(Shared {
            pool: Arc::clone(&self.pool),
            verifier: Arc::clone(&self.verifier),
            max_attempts: self.max_attempts,
            queue: Mutex::new(items.into()),
            records: Mutex::new(Vec::with_capacity(total)),
            current: Mutex::new(vec![None; self.workers]),
            #[cfg(test)]
            panic_on: self.panic_on,
        });

        info!(workers = self.workers, requests = total, "dispatch started");
        let mut set = JoinSet::new();
        let mut worker_of = HashMap::new();
        for worker in 0..self.workers {
            let handle = set.spawn(Arc::clone(&shared).work(worker));
            worker_of.insert(handle.id(), worker);
        }

        while let Some(joined) = set.join_next_with_id().await {
            let Err(err) = joined else { continue };
            let worker = worker_of.get(&err.id()).copied();
            if !err.is_panic() {
                warn!(worker = ?worker, "worker cancelled");
                continue;
            }
            let message = panic_message(err.into_panic());
            error!(worker = ?worker, panic = %message, "worker panicked");
            let index = worker.and_then(|w| shared.current.lock().expect("current lock")[w].take());
            if let (Some(worker), Some(index)) = (worker, index) {
                let mut record = RequestRecord::new(index, worker);
                record.attempts = 1;
                record.outcome = Outcome::Panicked { message };
                shared.records.lock().expect("records lock").push(record);
            }
        }

        let mut records = std::mem::take(&mut *shared.records.lock().expect("records lock"));
        records.sort_by_key(|r| r.index);
        let report = DispatchReport {
            workers: self.workers,
            records,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        info!(
            requests = total,
            completed = report.completed(),
            retries = report.retries(),
            panicked = report.panicked(),
            elapsed_ms = report.elapsed_ms,
            "dispatch finished"
        );
        report
    }

    #[cfg(test)]
    fn panic_on(mut self, index: usize) -> Self {
        self.panic_on = Some(index);
        self
    }
}

impl<D: Dialer> Shared<D> {
    async fn work(self: Arc<Self>, worker: usize) {
        loop {
            let item = self.queue.lock().expect("queue lock").pop_front();
            let Some(item) = item else { break };
            self.current.lock().expect("current lock")[worker] = Some(item.index);

            #[cfg(test)]
            if self.panic_on == Some(item.index) {
                panic!("injected failure on request {}", item.index);
            }

            let record = self.execute(worker, item).await;
            self.current.lock().expect("current lock")[worker] = None;
            self.records.lock().expect("records lock").push(record);
        }
        debug!(worker, "worker exited");
    }

    async fn execute(&self, worker: usize, item: WorkItem) -> RequestRecord {
        let mut record = RequestRecord::new(item.index, worker);
        for attempt in 1..=self.max_attempts {
            record.attempts = attempt;
            let last = attempt == self.max_attempts;

            let conn = match self.pool.get().await {
                Ok(conn) => conn,
                Err(e) => {
                    record.fail(&e);
                    return record;
                }
            };
            record.connection = Some(conn.id());

            let id = match conn.open_stream() {
                Ok(id) => id,
                Err(e) if e.is_retryable() && !last => continue,
                Err(e) => {
                    record.fail(&e);
                    return record;
                }
            };
            record.stream = Some(id);

            let result = exchange(&conn, id, item.body.clone()).await;
            if let Some(summary) = settle(&conn, id) {
                record.bytes_sent = summary.bytes_sent;
                record.bytes_received = summary.bytes_received;
                self.verifier.record(RequesterRecord {
                    summary,
                    sent: item.body.clone(),
                    received: result.as_ref().cloned().unwrap_or_default(),
                });
            }
            // Only once the verifier holds its outcome.
            if let Err(e) = conn.close_stream(id) {
                warn!(
                    request = item.index,
                    connection = %conn.id(),
                    stream = %id,
                    error = %e,
                    "stream left registered"
                );
            }

            match result {
                Ok(_) => {
                    record.outcome = Outcome::Completed;
                    return record;
                }
                Err(e) if e.is_retryable() && !last => {
                    debug!(
                        request = item.index,
                        connection = %conn.id(),
                        stream = %id,
                        attempt,
                        "connection closing, retrying"
                    );
                }
                Err(e) => {
                    debug!(request = item.index, error = %e, "request failed");
                    record.fail(&e);
                    return record;
                }
            }
        }
        record
    }
}

/// Write the body, end it, read the whole response.
async fn exchange<T: Transport>(conn: &Connection<T>, id: StreamId, body: Bytes) -> MuxResult<Bytes> {
    conn.write_body(id, body).await?;
    conn.finish_body(id)?;
    conn.read_to_end(id).await
}

/// Close the stream if the exchange left it open and take its final summary.
fn settle<T: Transport>(conn: &Connection<T>, id: StreamId) -> Option<StreamSummary> {
    if !conn.stream_state(id).ok()?.is_closed() {
        let _ = conn.reset_stream(id);
    }
    conn.stream_summary(id).ok()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponderConfig;
    use crate::responder::{EchoResponder, ResponderLedger};
    use muxgate_core::ConnectionConfig;
    use muxgate_core::transport::memory::{MemoryDialer, MemoryPeer};

    fn dispatcher(
        config: ResponderConfig,
        workers: usize,
    ) -> WorkerDispatcher<MemoryDialer<impl Fn(MemoryPeer) + Send + Sync + 'static>> {
        let ledger = ResponderLedger::new();
        let responder = EchoResponder::new(config, ledger.clone());
        let dialer = MemoryDialer::new(4, move |peer: MemoryPeer| responder.spawn(peer));
        let pool = Arc::new(ConnectionPool::new(dialer, ConnectionConfig::default()));
        WorkerDispatcher::new(pool, Arc::new(IntegrityVerifier::new(ledger)), workers, 8)
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n).map(|i| WorkItem::new(i, format!("body-{i}"))).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_item_is_attempted() {
        let dispatcher = dispatcher(ResponderConfig::default(), 4);
        let report = dispatcher.run(items(40)).await;
        assert_eq!(report.records.len(), 40);
        assert!(report.records.iter().enumerate().all(|(i, r)| r.index == i));
        for record in &report.records {
            match &record.outcome {
                Outcome::Completed => assert_eq!(record.bytes_received, record.bytes_sent),
                Outcome::Failed { kind, .. } => assert_eq!(*kind, ErrorKind::ConnectionClosing),
                Outcome::Panicked { .. } => panic!("unexpected panic"),
            }
        }
        assert!(dispatcher.verifier.verify().is_clean());
        for conn in dispatcher.pool.connections() {
            assert!(conn.summaries().is_empty(), "connection {} kept streams", conn.id());
        }
        dispatcher.pool.shutdown().await;
    }

    #[tokio::test]
    async fn goaway_after_each_response_forces_redials() {
        let dispatcher = dispatcher(ResponderConfig::default(), 1);
        let report = dispatcher.run(items(5)).await;
        assert_eq!(report.completed(), 5);
        assert!(dispatcher.pool.len() >= 5);
    }

    #[tokio::test]
    async fn panicking_worker_is_reported() {
        let dispatcher = dispatcher(ResponderConfig::default(), 2).panic_on(3);
        let report = dispatcher.run(items(10)).await;
        assert_eq!(report.records.len(), 10);
        assert_eq!(report.panicked(), 1);
        assert!(matches!(
            report.records[3].outcome,
            Outcome::Panicked { ref message } if message.contains("request 3")
        ));
        // The surviving worker drains the rest of the queue.
        assert_eq!(report.completed(), 9);
    }
}
