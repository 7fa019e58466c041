//! Durable, append-only record of chat messages.
//!
//! Appends are best effort: the pipeline logs failures and carries on.

use crate::models::{Message, Role};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum HistoryLogError {
    #[error("History log write failed: {0}")]
    WriteFailed(String),

    #[error("History log unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait HistoryLog: Send + Sync {
    /// Append one message for `session_id`.
    async fn append(&self, session_id: &str, role: Role, content: &str)
        -> Result<(), HistoryLogError>;

    /// Health check.
    async fn health_check(&self) -> Result<(), HistoryLogError>;
}

/// Process-local history log used in tests and when no database is set up.
#[derive(Default)]
pub struct InMemoryHistoryLog {
    entries: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryHistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages logged for `session_id`, oldest first.
    pub async fn messages(&self, session_id: &str) -> Vec<Message> {
        self.entries
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryLog for InMemoryHistoryLog {
    async fn append(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), HistoryLogError> {
        self.entries
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(Message::new(role, content));
        Ok(())
    }

    async fn health_check(&self) -> Result<(), HistoryLogError> {
        Ok(())
    }
}
