//! Echo responder, the peer side of a load run.
//!
//! Serves every stream on a memory connection by echoing the request body
//! back, and records what it read and wrote so the verifier can compare
//! both ends. The GOAWAY policy decides when a connection is retired.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use muxgate_core::transport::memory::{GoAwayHandle, MemoryPeer, PeerStream};
use muxgate_core::{ConnectionId, StreamId, TransportError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::{GoAwayPolicy, ResponderConfig};

/// What the responder saw on one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderRecord {
    pub connection: ConnectionId,
    pub stream: StreamId,
    pub read: Bytes,
    pub sent: Bytes,
}

/// Responder-side records keyed by connection and stream.
#[derive(Debug, Clone, Default)]
pub struct ResponderLedger {
    records: Arc<Mutex<HashMap<(ConnectionId, StreamId), ResponderRecord>>>,
}

impl ResponderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: ResponderRecord) {
        self.records
            .lock()
            .expect("ledger lock")
            .insert((record.connection, record.stream), record);
    }

    pub fn get(&self, connection: ConnectionId, stream: StreamId) -> Option<ResponderRecord> {
        self.records
            .lock()
            .expect("ledger lock")
            .get(&(connection, stream))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("ledger lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Echo server for memory connections.
#[derive(Debug, Clone)]
pub struct EchoResponder {
    config: ResponderConfig,
    ledger: ResponderLedger,
}

impl EchoResponder {
    pub fn new(config: ResponderConfig, ledger: ResponderLedger) -> Self {
        Self { config, ledger }
    }

    pub fn ledger(&self) -> &ResponderLedger {
        &self.ledger
    }

    /// Serve `peer` on a background task. Must be called inside a runtime.
    pub fn spawn(&self, peer: MemoryPeer) {
        tokio::spawn(self.clone().serve(peer));
    }

    /// Responses to send on `connection` before GOAWAY, or `None` for never.
    fn budget(&self, connection: ConnectionId) -> Option<u32> {
        match self.config.goaway {
            GoAwayPolicy::Never => None,
            GoAwayPolicy::AfterEachResponse => Some(1),
            GoAwayPolicy::AfterResponses { count } => Some(count),
            GoAwayPolicy::Random { max_responses } => {
                let mut rng = StdRng::seed_from_u64(self.config.seed ^ connection.0);
                Some(rng.random_range(1..=max_responses.max(1)))
            }
        }
    }

    /// Accept and echo streams until the client releases the connection.
    pub async fn serve(self, mut peer: MemoryPeer) {
        let connection = peer.id();
        let budget = Arc::new(Budget {
            connection,
            limit: self.budget(connection),
            served: AtomicU32::new(0),
            goaway: peer.goaway_handle(),
        });
        debug!(connection = %connection, budget = ?budget.limit, "responder attached");

        let mut handlers = JoinSet::new();
        while let Some(stream) = peer.accept().await {
            while handlers.try_join_next().is_some() {}
            let responder = self.clone();
            let budget = Arc::clone(&budget);
            handlers.spawn(async move {
                let id = stream.id();
                if let Err(e) = responder.echo(connection, stream, &budget).await {
                    debug!(connection = %connection, stream = %id, error = %e, "responder stream ended early");
                }
            });
        }
        // Released: nothing left can reach the client.
        handlers.abort_all();
        while handlers.join_next().await.is_some() {}
        debug!(
            connection = %connection,
            served = budget.served.load(Ordering::Acquire),
            "responder detached"
        );
    }

    async fn echo(
        &self,
        connection: ConnectionId,
        mut stream: PeerStream,
        budget: &Budget,
    ) -> Result<(), TransportError> {
        let mut chunks = Vec::new();
        let mut read = BytesMut::new();
        while let Some(chunk) = stream.read_chunk().await? {
            read.extend_from_slice(&chunk);
            chunks.push(chunk);
        }
        if self.config.stall {
            // Counts toward the budget so GOAWAY still starts a drain, then
            // holds the stream until the handler is aborted.
            budget.count();
            std::future::pending::<()>().await;
        }
        if !self.config.response_delay.is_zero() {
            tokio::time::sleep(self.config.response_delay).await;
        }

        let mut sent = BytesMut::with_capacity(read.len());
        for chunk in chunks {
            sent.extend_from_slice(&chunk);
            stream.write(chunk).await?;
        }
        // Recorded before the end of body so the record exists by the time
        // the client sees EOF.
        self.ledger.record(ResponderRecord {
            connection,
            stream: stream.id(),
            read: read.freeze(),
            sent: sent.freeze(),
        });
        stream.finish();
        budget.count();
        Ok(())
    }
}

/// Responses left before GOAWAY on one connection.
struct Budget {
    connection: ConnectionId,
    limit: Option<u32>,
    served: AtomicU32,
    goaway: GoAwayHandle,
}

impl Budget {
    fn count(&self) {
        let served = self.served.fetch_add(1, Ordering::AcqRel) + 1;
        if self.limit == Some(served) && self.goaway.send() {
            info!(connection = %self.connection, served, "responder sent goaway");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxgate_core::transport::memory;
    use muxgate_core::Transport;

    fn responder(goaway: GoAwayPolicy) -> EchoResponder {
        let config = ResponderConfig {
            goaway,
            ..ResponderConfig::default()
        };
        EchoResponder::new(config, ResponderLedger::new())
    }

    #[test]
    fn random_budget_is_seeded_per_connection() {
        let echo = responder(GoAwayPolicy::Random { max_responses: 5 });
        for id in 1..20 {
            let budget = echo.budget(ConnectionId(id)).unwrap();
            assert!((1..=5).contains(&budget));
            assert_eq!(echo.budget(ConnectionId(id)), Some(budget));
        }
        assert_eq!(responder(GoAwayPolicy::Never).budget(ConnectionId(1)), None);
        assert_eq!(
            responder(GoAwayPolicy::AfterResponses { count: 3 }).budget(ConnectionId(1)),
            Some(3)
        );
    }

    #[tokio::test]
    async fn echoes_and_records_then_sends_goaway() {
        let echo = responder(GoAwayPolicy::AfterEachResponse);
        let (transport, peer) = memory::pair(ConnectionId(4), 4);
        let mut signal = transport.take_shutdown_signal().unwrap();
        echo.spawn(peer);

        let id = StreamId(1);
        transport.open(id).unwrap();
        transport.send_bytes(id, Bytes::from_static(b"ping")).await.unwrap();
        transport.finish(id).unwrap();
        let mut body = BytesMut::new();
        while let Some(chunk) = transport.receive_bytes(id).await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(&body[..], b"ping");

        let goaway = (&mut signal).await.unwrap();
        assert_eq!(goaway.last_stream_id, Some(id));

        let record = echo.ledger().get(ConnectionId(4), id).unwrap();
        assert_eq!(record.read, record.sent);
        assert_eq!(&record.read[..], b"ping");
        transport.close();
    }

    #[tokio::test]
    async fn stalled_responder_never_answers() {
        let config = ResponderConfig {
            stall: true,
            ..ResponderConfig::default()
        };
        let echo = EchoResponder::new(config, ResponderLedger::new());
        let (transport, peer) = memory::pair(ConnectionId(1), 4);
        echo.spawn(peer);

        transport.open(StreamId(1)).unwrap();
        transport.finish(StreamId(1)).unwrap();
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            transport.receive_bytes(StreamId(1)),
        )
        .await;
        assert!(pending.is_err());
        assert!(echo.ledger().is_empty());
        transport.close();
    }
}
