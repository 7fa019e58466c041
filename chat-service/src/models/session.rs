//! In-memory conversation session.

use super::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation identified by a caller-supplied id.
///
/// History only grows; sessions handed out by the store are snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Caller-supplied session identifier.
    pub id: String,

    /// Messages in arrival order.
    pub history: Vec<Message>,

    /// When the session was first referenced.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    /// When a turn was last committed.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create an empty session.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Return a copy of this session extended by one completed turn.
    pub fn with_turn(&self, user: Message, assistant: Message) -> Self {
        let mut next = self.clone();
        next.history.push(user);
        next.history.push(assistant);
        next.updated_at = Utc::now();
        next
    }

    /// Number of messages in the session.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
