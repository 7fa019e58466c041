//! MongoDB history log tests.
//!
//! Run against a live MongoDB by setting `MONGODB_URI`; skipped when it is
//! unset or when `SKIP_MONGO_TESTS` is set.

use chat_service::models::Role;
use chat_service::services::{ChatDb, HistoryLog};

async fn connect() -> Option<ChatDb> {
    if std::env::var("SKIP_MONGO_TESTS").is_ok() {
        eprintln!("Skipping test: SKIP_MONGO_TESTS is set");
        return None;
    }
    let uri = match std::env::var("MONGODB_URI") {
        Ok(uri) => uri,
        Err(_) => {
            eprintln!("Skipping test: MONGODB_URI is not set");
            return None;
        }
    };

    let db = ChatDb::connect(&uri, "chat_test_db")
        .await
        .expect("Failed to connect to MongoDB");
    db.initialize_indexes()
        .await
        .expect("Failed to create indexes");
    Some(db)
}

#[tokio::test]
async fn appended_messages_are_read_back_in_order() {
    let Some(db) = connect().await else {
        return;
    };
    let session_id = format!("test-{}", uuid::Uuid::new_v4());

    db.append(&session_id, Role::User, "What is S3?")
        .await
        .expect("Failed to append user message");
    db.append(&session_id, Role::Assistant, "S3 is an object store.")
        .await
        .expect("Failed to append assistant message");

    let records = db
        .find_messages(&session_id)
        .await
        .expect("Failed to read messages");

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].role, Role::User);
    assert_eq!(records[0].content, "What is S3?");
    assert_eq!(records[1].role, Role::Assistant);
    assert!(records[0].created_at <= records[1].created_at);
}

#[tokio::test]
async fn health_check_pings_database() {
    let Some(db) = connect().await else {
        return;
    };

    assert!(db.health_check().await.is_ok());
}

#[tokio::test]
async fn back_to_back_pairs_keep_user_before_assistant() {
    let Some(db) = connect().await else {
        return;
    };
    let session_id = format!("test-{}", uuid::Uuid::new_v4());

    // Consecutive inserts routinely share a millisecond timestamp.
    for i in 0..20 {
        db.append(&session_id, Role::User, &format!("q{}", i))
            .await
            .expect("Failed to append user message");
        db.append(&session_id, Role::Assistant, &format!("a{}", i))
            .await
            .expect("Failed to append assistant message");
    }

    let records = db
        .find_messages(&session_id)
        .await
        .expect("Failed to read messages");

    assert_eq!(records.len(), 40);
    for (i, pair) in records.chunks(2).enumerate() {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[0].content, format!("q{}", i));
        assert_eq!(pair[1].role, Role::Assistant);
        assert_eq!(pair[1].content, format!("a{}", i));
    }
}
