//! Prometheus metrics for chat-service.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Turn metrics
pub static CHAT_TURNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static CHAT_TURNS_IN_FLIGHT: OnceLock<IntGauge> = OnceLock::new();
pub static CHAT_TIME_TO_FIRST_TOKEN_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static GUARD_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Provider metrics
pub static PROVIDER_TOKENS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static PROVIDER_LATENCY_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static PROVIDER_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Persistence metrics
pub static PERSISTENCE_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static DB_OPERATION_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static DB_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Later calls are no-ops.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let turns_total = IntCounterVec::new(
        Opts::new("chat_turns_total", "Total chat turns by outcome"),
        &["outcome"], // completed, guard_blocked, quota_exceeded, stream_failed, cancelled
    )?;

    let turns_in_flight = IntGauge::new(
        "chat_turns_in_flight",
        "Number of chat turns currently streaming",
    )?;

    let first_token = HistogramVec::new(
        HistogramOpts::new(
            "chat_time_to_first_token_seconds",
            "Delay between turn start and the first streamed token",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["provider"],
    )?;

    let guard_decisions = IntCounterVec::new(
        Opts::new("chat_guard_decisions_total", "Intent guard decisions"),
        &["stage", "decision", "source"], // stage: input, output
    )?;

    let provider_tokens = IntCounterVec::new(
        Opts::new("chat_provider_tokens_total", "Total tokens processed"),
        &["provider", "type"], // type: input, output
    )?;

    let provider_latency = HistogramVec::new(
        HistogramOpts::new(
            "chat_provider_latency_seconds",
            "Duration of the provider streaming phase in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["provider"],
    )?;

    let provider_errors = IntCounterVec::new(
        Opts::new("chat_provider_errors_total", "Total provider errors"),
        &["provider", "error_type"],
    )?;

    let persistence_errors = IntCounterVec::new(
        Opts::new(
            "chat_persistence_errors_total",
            "Failed session store or history log writes",
        ),
        &["target"], // session_store, history_log
    )?;

    let db_duration = HistogramVec::new(
        HistogramOpts::new(
            "db_operation_duration_seconds",
            "Database operation duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["operation", "collection"],
    )?;

    let db_errors = IntCounterVec::new(
        Opts::new("db_errors_total", "Total database errors"),
        &["operation", "collection"],
    )?;

    registry.register(Box::new(turns_total.clone()))?;
    registry.register(Box::new(turns_in_flight.clone()))?;
    registry.register(Box::new(first_token.clone()))?;
    registry.register(Box::new(guard_decisions.clone()))?;
    registry.register(Box::new(provider_tokens.clone()))?;
    registry.register(Box::new(provider_latency.clone()))?;
    registry.register(Box::new(provider_errors.clone()))?;
    registry.register(Box::new(persistence_errors.clone()))?;
    registry.register(Box::new(db_duration.clone()))?;
    registry.register(Box::new(db_errors.clone()))?;

    // Initialize globals
    let _ = REGISTRY.set(registry);
    let _ = CHAT_TURNS_TOTAL.set(turns_total);
    let _ = CHAT_TURNS_IN_FLIGHT.set(turns_in_flight);
    let _ = CHAT_TIME_TO_FIRST_TOKEN_SECONDS.set(first_token);
    let _ = GUARD_DECISIONS_TOTAL.set(guard_decisions);
    let _ = PROVIDER_TOKENS_TOTAL.set(provider_tokens);
    let _ = PROVIDER_LATENCY_SECONDS.set(provider_latency);
    let _ = PROVIDER_ERRORS_TOTAL.set(provider_errors);
    let _ = PERSISTENCE_ERRORS_TOTAL.set(persistence_errors);
    let _ = DB_OPERATION_DURATION_SECONDS.set(db_duration);
    let _ = DB_ERRORS_TOTAL.set(db_errors);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to convert metrics to UTF-8");
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

// Helper functions for recording metrics

/// Record a finished turn.
pub fn record_turn(outcome: &str) {
    if let Some(counter) = CHAT_TURNS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_turns_in_flight() {
    if let Some(gauge) = CHAT_TURNS_IN_FLIGHT.get() {
        gauge.inc();
    }
}

pub fn dec_turns_in_flight() {
    if let Some(gauge) = CHAT_TURNS_IN_FLIGHT.get() {
        gauge.dec();
    }
}

pub fn record_first_token(provider: &str, duration_secs: f64) {
    if let Some(histogram) = CHAT_TIME_TO_FIRST_TOKEN_SECONDS.get() {
        histogram.with_label_values(&[provider]).observe(duration_secs);
    }
}

/// Record a guard decision for the input or output stage.
pub fn record_guard_decision(stage: &str, allowed: bool, source: &str) {
    if let Some(counter) = GUARD_DECISIONS_TOTAL.get() {
        let decision = if allowed { "allow" } else { "block" };
        counter.with_label_values(&[stage, decision, source]).inc();
    }
}

pub fn record_tokens(provider: &str, input_tokens: i32, output_tokens: i32) {
    if let Some(counter) = PROVIDER_TOKENS_TOTAL.get() {
        counter
            .with_label_values(&[provider, "input"])
            .inc_by(input_tokens.max(0) as u64);
        counter
            .with_label_values(&[provider, "output"])
            .inc_by(output_tokens.max(0) as u64);
    }
}

/// Record provider latency.
pub fn record_provider_latency(provider: &str, duration_secs: f64) {
    if let Some(histogram) = PROVIDER_LATENCY_SECONDS.get() {
        histogram.with_label_values(&[provider]).observe(duration_secs);
    }
}

/// Record a provider error.
pub fn record_provider_error(provider: &str, error_type: &str) {
    if let Some(counter) = PROVIDER_ERRORS_TOTAL.get() {
        counter.with_label_values(&[provider, error_type]).inc();
    }
}

pub fn record_persistence_error(target: &str) {
    if let Some(counter) = PERSISTENCE_ERRORS_TOTAL.get() {
        counter.with_label_values(&[target]).inc();
    }
}

/// Record database operation duration.
pub fn record_db_operation(operation: &str, collection: &str, duration_secs: f64) {
    if let Some(histogram) = DB_OPERATION_DURATION_SECONDS.get() {
        histogram
            .with_label_values(&[operation, collection])
            .observe(duration_secs);
    }
}

/// Record a database error.
pub fn record_db_error(operation: &str, collection: &str) {
    if let Some(counter) = DB_ERRORS_TOTAL.get() {
        counter.with_label_values(&[operation, collection]).inc();
    }
}
