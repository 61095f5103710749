//! Registry of live transport connections and their outbound queues.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use hyperf_core::ConnectionId;
use tokio::sync::mpsc;

const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// One duplex connection as seen by the core.
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_seen: AtomicU64,
    dropped: AtomicU64,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_seen: AtomicU64::new(now_secs()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_activity(&self) {
        self.last_seen.store(now_secs(), Ordering::Relaxed);
    }

    fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_seen.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }

    /// Queue a text frame. Never blocks; a full or closed queue drops it.
    fn send(&self, message: String) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    connection_id = %self.id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.connected.store(false, Ordering::Relaxed);
                false
            }
        }
    }

    /// Messages dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// All currently registered connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    /// Register a new connection and return its ID plus the outbound queue to drain.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let connection = Arc::new(Connection::new(id.clone(), tx));
        self.connections.insert(id.clone(), connection);
        (id, rx)
    }

    /// Remove a connection. Dropping its sender closes the outbound queue.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        match self.connections.remove(id) {
            Some((_, connection)) => {
                connection.connected.store(false, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn is_connected(&self, id: &ConnectionId) -> bool {
        self.get(id).is_some_and(|c| c.is_connected())
    }

    pub fn record_activity(&self, id: &ConnectionId) {
        if let Some(connection) = self.connections.get(id) {
            connection.record_activity();
        }
    }

    /// Queue a frame for one connection.
    pub fn send_to(&self, id: &ConnectionId, message: String) -> bool {
        // Clone the Arc so the shard lock is not held while sending.
        match self.get(id) {
            Some(connection) => connection.send(message),
            None => false,
        }
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .filter(|c| c.is_connected())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Unregister connections with no activity within the client timeout.
    pub fn cleanup_dead(&self) -> Vec<ConnectionId> {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_alive(self.client_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(connection_id = %id, "cleaned up dead connection");
        }
        dead
    }
}

/// Periodically drop connections that stopped answering pings.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead();
            if !removed.is_empty() {
                tracing::info!(removed = removed.len(), "dead connection cleanup");
            }
        }
    })
}
