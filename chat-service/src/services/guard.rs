//! Topic guard that keeps the assistant on AWS subjects.
//!
//! Decisions come from, in order: the empty-text rule, an in-scope keyword
//! fast path, a cached verdict, a single-token ALLOW/BLOCK classification
//! call, and finally a heuristic fallback when that call fails.

use crate::services::providers::{CompletionSource, ProviderError};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Reply used whenever input or output is judged out of scope.
pub const BLOCK_MESSAGE: &str = "I specialize in AWS-related questions only. \
Please ask something about AWS services or architecture.";

/// Instruction for the intent classification call.
pub const CLASSIFIER_INSTRUCTION: &str = "You are an intent classifier for an AWS assistant.
Classify whether the user text should be allowed.
Return EXACTLY one token: ALLOW or BLOCK.

ALLOW when:
- It is directly about AWS, cloud architecture, DevOps, infrastructure,
  security, networking, deployment, monitoring, scaling, or cost.
- It is ambiguous but can reasonably be answered in AWS context.

BLOCK when:
- It is clearly unrelated to cloud/technical context.
- It is explicitly about non-AWS ecosystems only.
";

const DEFAULT_IN_SCOPE_KEYWORDS: &[&str] = &[
    "aws",
    "amazon web services",
    "s3",
    "ec2",
    "lambda",
    "cloudformation",
    "cloudwatch",
    "cloudfront",
    "dynamodb",
    "rds",
    "aurora",
    "iam",
    "vpc",
    "ecs",
    "eks",
    "fargate",
    "sqs",
    "sns",
    "route 53",
    "route53",
    "elastic beanstalk",
    "bedrock",
    "sagemaker",
    "redshift",
    "kinesis",
];

const DEFAULT_TECHNICAL_HINTS: &[&str] = &[
    "api",
    "server",
    "database",
    "network",
    "deploy",
    "kubernetes",
    "docker",
    "load balancer",
    "latency",
    "monitor",
    "security",
    "scaling",
    "infra",
    "cloud",
];

/// Shortest normalized text the fallback heuristic will ever allow.
const MIN_FALLBACK_LEN: usize = 8;

const DEFAULT_CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(5);

/// Guard settings. Defaults target the AWS domain.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Matched on word boundaries; a hit allows without a classifier call.
    pub in_scope_keywords: Vec<String>,
    /// Substring hints consulted only when classification fails.
    pub technical_hints: Vec<String>,
    pub classifier_instruction: String,
    pub block_message: String,
    pub cache_capacity: usize,
    /// Upper bound on one classification call; expiry takes the fallback.
    pub classifier_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            in_scope_keywords: DEFAULT_IN_SCOPE_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            technical_hints: DEFAULT_TECHNICAL_HINTS.iter().map(|s| s.to_string()).collect(),
            classifier_instruction: CLASSIFIER_INSTRUCTION.to_string(),
            block_message: BLOCK_MESSAGE.to_string(),
            cache_capacity: 2048,
            classifier_timeout: DEFAULT_CLASSIFIER_TIMEOUT,
        }
    }
}

impl GuardConfig {
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_classifier_timeout(mut self, timeout: Duration) -> Self {
        self.classifier_timeout = timeout;
        self
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Empty,
    Keyword,
    Cache,
    Classifier,
    Fallback,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Empty => "empty",
            DecisionSource::Keyword => "keyword",
            DecisionSource::Cache => "cache",
            DecisionSource::Classifier => "classifier",
            DecisionSource::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardDecision {
    pub allowed: bool,
    pub source: DecisionSource,
}

impl GuardDecision {
    fn new(allowed: bool, source: DecisionSource) -> Self {
        Self { allowed, source }
    }
}

/// In-scope / out-of-scope classifier for user input and assistant output.
pub struct IntentGuard {
    classifier: Arc<dyn CompletionSource>,
    config: GuardConfig,
    /// Keywords pre-tokenized as ` word word `.
    keyword_patterns: Vec<String>,
    cache: DashMap<String, bool>,
}

impl IntentGuard {
    pub fn new(classifier: Arc<dyn CompletionSource>, config: GuardConfig) -> Self {
        let keyword_patterns = config
            .in_scope_keywords
            .iter()
            .map(|k| word_pattern(&k.to_lowercase()))
            .filter(|p| !p.trim().is_empty())
            .collect();

        Self {
            classifier,
            keyword_patterns,
            cache: DashMap::with_capacity(config.cache_capacity.min(4096)),
            config,
        }
    }

    pub fn block_message(&self) -> &str {
        &self.config.block_message
    }

    /// Decide whether `text` is in scope.
    pub async fn classify(&self, text: &str) -> GuardDecision {
        let trimmed = text.trim();
        let normalized = trimmed.to_lowercase();

        if normalized.is_empty() {
            return GuardDecision::new(false, DecisionSource::Empty);
        }

        if self.matches_keyword(&normalized) {
            return GuardDecision::new(true, DecisionSource::Keyword);
        }

        if let Some(allowed) = self.cache.get(&normalized).map(|e| *e.value()) {
            return GuardDecision::new(allowed, DecisionSource::Cache);
        }

        let limit = self.config.classifier_timeout;
        let verdict = tokio::time::timeout(
            limit,
            self.classifier
                .classify(&self.config.classifier_instruction, trimmed),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout(limit.as_secs())));

        match verdict {
            Ok(reply) => {
                let allowed = reply.trim().to_uppercase().starts_with("ALLOW");
                self.remember(normalized, allowed);
                GuardDecision::new(allowed, DecisionSource::Classifier)
            }
            Err(e) => {
                let allowed = self.fallback(&normalized);
                tracing::warn!(
                    error = %e,
                    allowed,
                    "Intent classification failed, using heuristic fallback"
                );
                GuardDecision::new(allowed, DecisionSource::Fallback)
            }
        }
    }

    /// Number of cached classifier verdicts.
    pub fn cached_decisions(&self) -> usize {
        self.cache.len()
    }

    fn matches_keyword(&self, normalized: &str) -> bool {
        let haystack = word_pattern(normalized);
        self.keyword_patterns.iter().any(|k| haystack.contains(k))
    }

    fn fallback(&self, normalized: &str) -> bool {
        if normalized.chars().count() < MIN_FALLBACK_LEN {
            return false;
        }
        self.config
            .technical_hints
            .iter()
            .any(|hint| normalized.contains(hint.as_str()))
    }

    fn remember(&self, normalized: String, allowed: bool) {
        if self.config.cache_capacity == 0 {
            return;
        }
        if self.cache.len() >= self.config.cache_capacity && !self.cache.contains_key(&normalized)
        {
            let victim = self.cache.iter().next().map(|e| e.key().clone());
            if let Some(victim) = victim {
                self.cache.remove(&victim);
            }
        }
        self.cache.insert(normalized, allowed);
    }
}

/// Lowercased alphanumeric words joined by single spaces, padded with a
/// space on each side so that `contains` only matches whole words.
fn word_pattern(text: &str) -> String {
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    format!(" {} ", words.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::mock::MockCompletionSource;
    use crate::services::providers::ProviderError;

    fn guard_with(mock: MockCompletionSource) -> (IntentGuard, Arc<MockCompletionSource>) {
        let mock = Arc::new(mock);
        let guard = IntentGuard::new(mock.clone(), GuardConfig::default());
        (guard, mock)
    }

    fn failing_classifier() -> MockCompletionSource {
        MockCompletionSource::new(Vec::<String>::new())
            .with_classification(Err(ProviderError::NetworkError("down".to_string())))
    }

    #[tokio::test]
    async fn empty_text_is_blocked_without_classification() {
        let (guard, mock) = guard_with(MockCompletionSource::new(Vec::<String>::new()));

        let decision = guard.classify("   \n\t ").await;

        assert!(!decision.allowed);
        assert_eq!(decision.source, DecisionSource::Empty);
        assert_eq!(mock.classify_calls(), 0);
    }

    #[tokio::test]
    async fn keyword_fast_path_skips_classifier() {
        let (guard, mock) = guard_with(
            MockCompletionSource::new(Vec::<String>::new())
                .with_classification(Ok("BLOCK".to_string())),
        );

        assert!(guard.classify("What is S3?").await.allowed);
        assert!(guard.classify("  Explain Amazon Web Services pricing ").await.allowed);
        assert_eq!(mock.classify_calls(), 0);
    }

    #[tokio::test]
    async fn keywords_match_whole_words_only() {
        let (guard, mock) = guard_with(
            MockCompletionSource::new(Vec::<String>::new())
                .with_classification(Ok("BLOCK".to_string())),
        );

        // "iam" inside "william" must not hit the fast path.
        let decision = guard.classify("Who was William Shakespeare?").await;

        assert!(!decision.allowed);
        assert_eq!(decision.source, DecisionSource::Classifier);
        assert_eq!(mock.classify_calls(), 1);
    }

    #[tokio::test]
    async fn classifier_reply_must_start_with_allow() {
        let (guard, _) = guard_with(
            MockCompletionSource::new(Vec::<String>::new())
                .with_classification(Ok("  allow\n".to_string())),
        );
        assert!(guard.classify("How do I design a multi-region setup?").await.allowed);

        let (guard, _) = guard_with(
            MockCompletionSource::new(Vec::<String>::new())
                .with_classification(Ok("I think ALLOW".to_string())),
        );
        assert!(!guard.classify("How do I design a multi-region setup?").await.allowed);
    }

    #[tokio::test]
    async fn classifier_verdicts_are_cached_by_normalized_text() {
        let (guard, mock) = guard_with(
            MockCompletionSource::new(Vec::<String>::new())
                .with_classification(Ok("BLOCK".to_string())),
        );

        let first = guard.classify("What's the weather today?").await;
        let second = guard.classify("  WHAT'S THE WEATHER TODAY?").await;

        assert!(!first.allowed);
        assert!(!second.allowed);
        assert_eq!(second.source, DecisionSource::Cache);
        assert_eq!(mock.classify_calls(), 1);
    }

    #[tokio::test]
    async fn cache_never_exceeds_capacity() {
        let mock = Arc::new(MockCompletionSource::new(Vec::<String>::new()));
        let guard = IntentGuard::new(mock, GuardConfig::default().with_cache_capacity(3));

        for i in 0..10 {
            guard.classify(&format!("question number {}", i)).await;
        }

        assert_eq!(guard.cached_decisions(), 3);
    }

    #[tokio::test]
    async fn failure_blocks_short_text() {
        let (guard, _) = guard_with(failing_classifier());

        let decision = guard.classify("api?").await;

        assert!(!decision.allowed);
        assert_eq!(decision.source, DecisionSource::Fallback);
    }

    #[tokio::test]
    async fn failure_allows_technical_text_and_blocks_chatter() {
        let (guard, mock) = guard_with(failing_classifier());

        assert!(guard.classify("How should I deploy my service?").await.allowed);
        assert!(!guard.classify("Tell me a joke about cats").await.allowed);

        // Fallback verdicts are not cached.
        assert!(guard.classify("How should I deploy my service?").await.allowed);
        assert_eq!(mock.classify_calls(), 3);
        assert_eq!(guard.cached_decisions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_classifier_times_out_into_fallback() {
        let mock = Arc::new(
            MockCompletionSource::new(Vec::<String>::new())
                .with_classification(Ok("BLOCK".to_string()))
                .with_classify_delay(Duration::from_secs(3600)),
        );
        let config = GuardConfig::default().with_classifier_timeout(Duration::from_secs(2));
        let guard = IntentGuard::new(mock.clone(), config);
        let started = tokio::time::Instant::now();

        let decision = guard.classify("How should I deploy my service?").await;

        assert!(decision.allowed);
        assert_eq!(decision.source, DecisionSource::Fallback);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(guard.cached_decisions(), 0);
    }
}
