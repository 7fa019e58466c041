use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::startup::{AppState, SERVICE_NAME};

/// Liveness check.
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness check: the history log backend must answer.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.history_log.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "service": SERVICE_NAME
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unavailable",
                    "service": SERVICE_NAME,
                    "error": e.to_string()
                })),
            )
        }
    }
}
