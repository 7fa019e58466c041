//! Application startup and lifecycle management.

use crate::config::ChatConfig;
use crate::handlers;
use crate::services::providers::gemini::{GeminiCompletionSource, GeminiConfig};
use crate::services::providers::mock::MockCompletionSource;
use crate::services::providers::{CompletionSource, GenerationParams};
use crate::services::{
    ChatDb, ChatPipeline, GuardConfig, HistoryLog, InMemoryHistoryLog, IntentGuard,
    PipelineSettings, SessionStore,
};
use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{request_id_middleware, request_span};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub const SERVICE_NAME: &str = "chat-service";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: ChatPipeline,
    pub history_log: Arc<dyn HistoryLog>,
}

impl AppState {
    /// Wire guard, session store and pipeline around a completion source and
    /// a history log.
    pub fn new(
        source: Arc<dyn CompletionSource>,
        history_log: Arc<dyn HistoryLog>,
        guard_config: GuardConfig,
        settings: PipelineSettings,
    ) -> Self {
        let guard = Arc::new(IntentGuard::new(source.clone(), guard_config));
        let pipeline = ChatPipeline::new(
            guard,
            source,
            SessionStore::in_memory(),
            history_log.clone(),
            settings,
        );

        Self {
            pipeline,
            history_log,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/chat", post(handlers::chat::chat))
        .route("/chat/stream", post(handlers::chat::chat_stream))
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: ChatConfig) -> Result<Self, AppError> {
        let source = completion_source(&config)?;
        let history_log = history_log(&config).await?;

        let settings = PipelineSettings {
            stream_timeout: config.chat.stream_timeout(),
            serialize_session_turns: config.chat.serialize_session_turns,
            generation: GenerationParams {
                temperature: Some(config.model.temperature),
                max_tokens: Some(config.model.max_output_tokens),
            },
        };
        let guard_config = GuardConfig::default()
            .with_cache_capacity(config.chat.guard_cache_capacity)
            .with_classifier_timeout(config.chat.guard_timeout());

        let state = AppState::new(source, history_log, guard_config, settings);

        // Port 0 picks a random port for tests
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port,
            environment = %config.environment,
            serialize_session_turns = config.chat.serialize_session_turns,
            "Chat service listening"
        );

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until a shutdown signal arrives.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| {
                tracing::error!("HTTP server error: {}", e);
                e
            })
    }
}

fn completion_source(config: &ChatConfig) -> Result<Arc<dyn CompletionSource>, AppError> {
    if config.model.use_mock {
        tracing::warn!("CHAT_USE_MOCK_PROVIDER is set, serving canned responses");
        return Ok(Arc::new(MockCompletionSource::canned()));
    }

    let gemini = GeminiCompletionSource::new(GeminiConfig::new(
        config.google.api_key.clone(),
        config.model.name.clone(),
        config.model.system_prompt.clone(),
    ))
    .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;

    tracing::info!(model = %config.model.name, "Initialized Gemini completion source");
    Ok(Arc::new(gemini))
}

async fn history_log(config: &ChatConfig) -> Result<Arc<dyn HistoryLog>, AppError> {
    let Some(mongo) = &config.mongodb else {
        tracing::warn!("MONGODB_URI not set, chat history log is kept in memory");
        return Ok(Arc::new(InMemoryHistoryLog::new()));
    };

    let db = ChatDb::connect(&mongo.uri, &mongo.database).await?;
    db.initialize_indexes().await.map_err(|e| {
        tracing::error!("Failed to initialize database indexes: {}", e);
        e
    })?;

    Ok(Arc::new(db))
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
