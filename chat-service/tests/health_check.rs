//! End-to-end tests against a running chat-service.
//!
//! The server uses the canned mock provider and the in-memory history log,
//! so neither a Gemini key nor MongoDB is needed.
//! Run with: cargo test -p chat-service --test health_check

use chat_service::config::ChatConfig;
use chat_service::startup::Application;
use reqwest::Client;
use std::time::Duration;

/// Spawn the application on a random port and return the port number.
async fn spawn_app() -> u16 {
    std::env::set_var("ENVIRONMENT", "test");
    std::env::set_var("APP__PORT", "0");
    std::env::set_var("CHAT_USE_MOCK_PROVIDER", "true");
    std::env::remove_var("MONGODB_URI");

    let config = ChatConfig::load().expect("Failed to load config");
    let app = Application::build(config)
        .await
        .expect("Failed to build application");

    let port = app.port();

    tokio::spawn(async move {
        let _ = app.run_until_stopped().await;
    });

    tokio::time::sleep(Duration::from_millis(100)).await;

    port
}

#[tokio::test]
async fn health_check_returns_ok() {
    let port = spawn_app().await;
    let client = Client::new();

    let response = client
        .get(format!("http://localhost:{}/health", port))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "chat-service");
}

#[tokio::test]
async fn readiness_check_returns_ok() {
    let port = spawn_app().await;
    let client = Client::new();

    let response = client
        .get(format!("http://localhost:{}/ready", port))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());
}

#[tokio::test]
async fn chat_stream_over_http_delivers_sse() {
    let port = spawn_app().await;
    let client = Client::new();

    let response = client
        .post(format!("http://localhost:{}/chat/stream", port))
        .json(&serde_json::json!({ "message": "What is S3?", "session_id": "e2e" }))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());
    assert_eq!(response.headers()["x-accel-buffering"], "no");

    let body = response.text().await.expect("Failed to read body");
    let events: Vec<serde_json::Value> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("event is valid JSON"))
        .collect();

    let last = events.last().expect("at least one event");
    assert_eq!(last["type"], "end");
    assert_eq!(last["content"], "AWS offers managed cloud services.");
    assert!(events[..events.len() - 1]
        .iter()
        .all(|e| e["type"] == "token"));
}
