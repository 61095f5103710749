//! Per-connection session state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hyperf_core::{ConnectionId, User};
use tokio::sync::Mutex;

/// Mutable application state owned by exactly one connection.
#[derive(Clone, Debug)]
pub struct Session {
    connection_id: ConnectionId,
    opened_at: DateTime<Utc>,
    /// Set by a successful `user:create`.
    pub current_user: Option<User>,
}

impl Session {
    fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            opened_at: Utc::now(),
            current_user: None,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }
}

/// Sessions keyed by connection.
///
/// Each session sits behind its own async mutex, so mutations of one
/// connection's session are serialized while unrelated connections proceed
/// independently.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<ConnectionId, Arc<Mutex<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session for `id`, or return the existing one.
    pub fn open(&self, id: &ConnectionId) -> Arc<Mutex<Session>> {
        let entry = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(id.clone()))));
        Arc::clone(entry.value())
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Run `mutate` with exclusive access to the session for `id`.
    ///
    /// Returns `None` if the connection has no session.
    pub async fn update<R>(&self, id: &ConnectionId, mutate: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let session = self.get(id)?;
        let mut guard = session.lock().await;
        Some(mutate(&mut guard))
    }

    /// Drop the session for `id`, returning its final state.
    ///
    /// Waits for any holder of the session lock to finish first.
    pub async fn remove(&self, id: &ConnectionId) -> Option<Session> {
        let (_, session) = self.sessions.remove(id)?;
        let last = session.lock().await.clone();
        Some(last)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
