//! Detection of provider quota / rate-limit failures.
//!
//! Such failures degrade a turn to an advisory message instead of
//! surfacing as a stream error.

use crate::services::providers::ProviderError;
use once_cell::sync::Lazy;
use regex::Regex;

/// Advisory shown when the provider reports exhausted quota.
pub const QUOTA_MESSAGE: &str =
    "The assistant is temporarily unavailable because the AI provider's usage quota was exceeded.";

/// Lowercase markers that identify a quota or rate-limit failure.
const QUOTA_MARKERS: &[&str] = &[
    "resource_exhausted",
    "resource exhausted",
    "quota",
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
];

/// HTTP 429 as a standalone status code in error detail.
static TOO_MANY_REQUESTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b429\b").expect("valid status regex"));

static RETRY_IN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)retry\s+in\s+(\d+(?:\.\d+)?)\s*s\b").expect("valid retry-in regex")
});

static RETRY_DELAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)"?retry_?delay"?\s*[:=]\s*"?(\d+(?:\.\d+)?)s"#)
        .expect("valid retry-delay regex")
});

/// A recognized quota failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaExceeded {
    /// Suggested wait parsed from the provider detail, rounded up.
    pub retry_after_secs: Option<u64>,
}

impl QuotaExceeded {
    /// Text delivered to the caller for this turn.
    pub fn message(&self) -> String {
        match self.retry_after_secs {
            Some(secs) => format!("{} Please try again in ~{}s.", QUOTA_MESSAGE, secs),
            None => format!("{} Please try again shortly.", QUOTA_MESSAGE),
        }
    }
}

/// Classify `error` as a quota failure, if it is one.
pub fn classify(error: &ProviderError) -> Option<QuotaExceeded> {
    let detail = error.to_string();
    let retry_after_secs = parse_retry_after(&detail);

    let is_quota = match error {
        ProviderError::RateLimited(_) => true,
        ProviderError::Timeout(_) => false,
        _ => {
            let lowered = detail.to_lowercase();
            QUOTA_MARKERS.iter().any(|m| lowered.contains(m))
                || TOO_MANY_REQUESTS.is_match(&detail)
                || retry_after_secs.is_some()
        }
    };

    is_quota.then_some(QuotaExceeded { retry_after_secs })
}

/// Extract a suggested retry delay in whole seconds from provider text,
/// e.g. `Please retry in 12.4s` or `"retryDelay": "12s"`.
pub fn parse_retry_after(detail: &str) -> Option<u64> {
    RETRY_IN
        .captures(detail)
        .or_else(|| RETRY_DELAY.captures(detail))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| secs.ceil() as u64)
}
