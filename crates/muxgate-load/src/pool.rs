//! Connection pool. Hands out the current connection and redials once it
//! starts shutting down.
//!
//! Retired connections stay in the pool until [`ConnectionPool::shutdown`]
//! so their drains can be awaited and their shutdown stats reported.

use muxgate_core::{Connection, ConnectionConfig, ConnectionId, Dialer, MuxResult};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One dialer, one current connection.
pub struct ConnectionPool<D: Dialer> {
    dialer: D,
    config: ConnectionConfig,
    /// Held across the dial so concurrent callers share one new connection.
    current: Mutex<Option<Connection<D::Transport>>>,
    /// Every connection ever handed out, in dial order.
    all: std::sync::Mutex<Vec<Connection<D::Transport>>>,
}

impl<D: Dialer> ConnectionPool<D> {
    pub fn new(dialer: D, config: ConnectionConfig) -> Self {
        Self {
            dialer,
            config,
            current: Mutex::new(None),
            all: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// A connection that is still admitting streams.
    pub async fn get(&self) -> MuxResult<Connection<D::Transport>> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref() {
            if !conn.is_shutting_down() {
                return Ok(conn.clone());
            }
            debug!(connection = %conn.id(), "current connection is closing, redialing");
        }

        let conn = Connection::dial(&self.dialer, self.config.clone()).await?;
        self.all.lock().expect("pool lock").push(conn.clone());
        *current = Some(conn.clone());
        Ok(conn)
    }

    /// Snapshot of every connection dialed so far.
    pub fn connections(&self) -> Vec<Connection<D::Transport>> {
        self.all.lock().expect("pool lock").clone()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection<D::Transport>> {
        self.all
            .lock()
            .expect("pool lock")
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    /// Number of connections dialed.
    pub fn len(&self) -> usize {
        self.all.lock().expect("pool lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut every connection down and wait for all of them to close.
    pub async fn shutdown(&self) {
        self.current.lock().await.take();
        let connections = self.connections();
        for conn in &connections {
            conn.shutdown();
        }
        for conn in &connections {
            conn.wait_drained().await;
        }
        info!(connections = connections.len(), "connection pool shut down");
    }
}
