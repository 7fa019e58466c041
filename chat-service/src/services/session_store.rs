//! Per-session conversation history.
//!
//! The store is built once at startup and shared through `AppState`. It
//! hands out snapshots only; the backing map is never exposed.

use crate::models::Session;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session backend unavailable: {0}")]
    Unavailable(String),
}

/// Storage behind [`SessionStore`]. Each operation must be atomic with
/// respect to concurrent callers.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn get_or_create(&self, session_id: &str) -> Result<Session, StoreError>;

    async fn replace(&self, session_id: &str, session: Session) -> Result<(), StoreError>;
}

/// Process-local backend: one mutex around one map.
#[derive(Default)]
pub struct InMemorySessionBackend {
    sessions: Mutex<HashMap<String, Session>>,
}

impl InMemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionBackend for InMemorySessionBackend {
    async fn get_or_create(&self, session_id: &str) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        Ok(session.clone())
    }

    async fn replace(&self, session_id: &str, session: Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session_id.to_string(), session);
        Ok(())
    }
}

/// Session store handle. Cheap to clone.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemorySessionBackend::new()))
    }

    /// Snapshot of the session, creating an empty one on first reference.
    pub async fn get_or_create(&self, session_id: &str) -> Result<Session, StoreError> {
        self.backend.get_or_create(session_id).await
    }

    /// Overwrite the stored session. Last writer wins.
    pub async fn replace(&self, session_id: &str, session: Session) -> Result<(), StoreError> {
        tracing::debug!(
            session_id = %session_id,
            messages = session.len(),
            "Committing session history"
        );
        self.backend.replace(session_id, session).await
    }
}

/// Per-session locks held for a whole turn, so that concurrent turns on the
/// same session commit one after another instead of overwriting each other.
#[derive(Clone, Default)]
pub struct TurnLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl TurnLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `session_id`. The guard releases on drop.
    pub async fn acquire(&self, session_id: &str) -> TurnLockGuard {
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;

        TurnLockGuard {
            session_id: session_id.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Sessions that currently have a lock entry.
    pub fn active_sessions(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive hold on one session's turn lock.
///
/// Dropping it releases the lock and removes the session's entry once no
/// other turn holds or waits on it.
pub struct TurnLockGuard {
    session_id: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TurnLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left means nobody holds or awaits it.
        self.locks
            .remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
