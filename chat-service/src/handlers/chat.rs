//! Chat endpoints.
//!
//! `POST /chat/stream` answers with Server-Sent Events, one `data:` line per
//! [`StreamEvent`](crate::models::StreamEvent). `POST /chat` runs the same
//! turn and returns only the final content.

use axum::{
    extract::{Json, State},
    http::{header, HeaderMap, HeaderName},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::middleware::REQUEST_ID_HEADER;
use std::time::Duration;
use validator::Validate;

use crate::services::{TurnError, TurnRequest};
use crate::startup::AppState;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

#[derive(Debug, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(length(min = 1, max = 4000))]
    pub message: String,

    #[validate(length(min = 1, max = 128))]
    pub session_id: String,

    /// Per-request streaming deadline in seconds.
    #[validate(range(min = 1, max = 600))]
    pub timeout_seconds: Option<u64>,
}

impl ChatRequest {
    fn into_turn(self, headers: &HeaderMap) -> TurnRequest {
        let mut turn = TurnRequest::new(self.session_id, self.message);
        if let Some(secs) = self.timeout_seconds {
            turn = turn.with_timeout(Duration::from_secs(secs));
        }
        if let Some(request_id) = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            turn = turn.with_request_id(request_id);
        }
        turn
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
}

#[tracing::instrument(skip(state, headers, request), fields(session_id = %request.session_id))]
pub async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;

    let events = state
        .pipeline
        .stream_turn(request.into_turn(&headers))
        .map(|event| Event::default().json_data(&event));

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        Sse::new(events).keep_alive(KeepAlive::default()),
    ))
}

#[tracing::instrument(skip(state, headers, request), fields(session_id = %request.session_id))]
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    request.validate()?;

    match state
        .pipeline
        .run_to_completion(request.into_turn(&headers))
        .await
    {
        Ok(response) => Ok(Json(ChatResponse { response })),
        Err(TurnError::StreamFailed(detail)) => Err(AppError::BadGateway(detail)),
        Err(e @ TurnError::Aborted) => {
            tracing::error!(error = %e, "Chat turn ended without a final event");
            Err(AppError::InternalError(anyhow::anyhow!(e)))
        }
    }
}
