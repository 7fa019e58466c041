//! MongoDB-backed history log.
//!
//! Every chat message is one document in the `chat_messages` collection.

use crate::models::Role;
use crate::services::history_log::{HistoryLog, HistoryLogError};
use crate::services::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::doc,
    options::{FindOptions, IndexOptions},
    Client as MongoClient, Collection, Database, IndexModel,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::time::Instant;

const MESSAGES_COLLECTION: &str = "chat_messages";

/// Persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageRecord {
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ChatDb {
    client: MongoClient,
    db: Database,
}

impl ChatDb {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!("Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB: {}", e);
            AppError::from(e)
        })?;
        let db = client.database(database);
        tracing::info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { client, db })
    }

    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for chat-service");

        // Session + time for ordered history reads; `_id` breaks ties
        // between messages written in the same millisecond.
        let session_time_index = IndexModel::builder()
            .keys(doc! { "session_id": 1, "created_at": 1, "_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("session_time_idx".to_string())
                    .build(),
            )
            .build();

        self.messages()
            .create_index(session_time_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create session_time index: {}", e);
                AppError::from(e)
            })?;

        tracing::info!("Successfully created all MongoDB indexes");
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), AppError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!("MongoDB health check failed: {}", e);
                AppError::from(e)
            })?;
        Ok(())
    }

    pub fn messages(&self) -> Collection<ChatMessageRecord> {
        self.db.collection(MESSAGES_COLLECTION)
    }

    pub async fn insert_message(&self, record: &ChatMessageRecord) -> Result<(), AppError> {
        let start = Instant::now();
        let result = self.messages().insert_one(record, None).await;
        metrics::record_db_operation("insert", MESSAGES_COLLECTION, start.elapsed().as_secs_f64());

        result.map_err(|e| {
            metrics::record_db_error("insert", MESSAGES_COLLECTION);
            tracing::error!("Failed to insert chat message: {}", e);
            AppError::from(e)
        })?;
        Ok(())
    }

    /// Messages of one session, oldest first.
    ///
    /// Driver-generated ObjectIds increase within a process, so they order
    /// a user message before its reply when both share a timestamp.
    pub async fn find_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<ChatMessageRecord>, AppError> {
        let options = FindOptions::builder()
            .sort(doc! { "created_at": 1, "_id": 1 })
            .build();

        let cursor = self
            .messages()
            .find(doc! { "session_id": session_id }, options)
            .await
            .map_err(|e| {
                tracing::error!("Failed to query chat messages: {}", e);
                AppError::from(e)
            })?;

        cursor.try_collect().await.map_err(|e| {
            tracing::error!("Failed to collect chat messages: {}", e);
            AppError::from(e)
        })
    }
}

#[async_trait]
impl HistoryLog for ChatDb {
    async fn append(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(), HistoryLogError> {
        let record = ChatMessageRecord {
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };

        self.insert_message(&record)
            .await
            .map_err(|e| HistoryLogError::WriteFailed(e.to_string()))
    }

    async fn health_check(&self) -> Result<(), HistoryLogError> {
        self.ping()
            .await
            .map_err(|e| HistoryLogError::Unavailable(e.to_string()))
    }
}
