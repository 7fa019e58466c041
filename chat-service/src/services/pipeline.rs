//! Streaming response pipeline.
//!
//! One turn moves through
//! `GuardingInput -> Streaming -> GuardingOutput -> Committing -> Done`,
//! or ends in `Errored` when the completion source fails for a reason other
//! than quota. Each turn runs on its own task and pushes [`StreamEvent`]s
//! into a bounded channel; the consumer dropping the receiving end cancels
//! the turn without committing anything.

use crate::models::{Message, Role, StreamEvent};
use crate::services::guard::IntentGuard;
use crate::services::history_log::HistoryLog;
use crate::services::metrics;
use crate::services::providers::{CompletionSource, GenerationParams, ProviderError, StreamChunk};
use crate::services::quota;
use crate::services::session_store::{SessionStore, TurnLocks};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

/// Detail sent in the wire `error` event.
pub const STREAM_FAILED_MESSAGE: &str = "Streaming failed.";

const EVENT_BUFFER: usize = 32;

/// Events of one turn, in emission order.
pub type TurnStream = ReceiverStream<StreamEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    GuardingInput,
    Streaming,
    GuardingOutput,
    Committing,
    Done,
    Errored,
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    GuardBlocked,
    QuotaExceeded,
    StreamFailed,
    Cancelled,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Completed => "completed",
            TurnOutcome::GuardBlocked => "guard_blocked",
            TurnOutcome::QuotaExceeded => "quota_exceeded",
            TurnOutcome::StreamFailed => "stream_failed",
            TurnOutcome::Cancelled => "cancelled",
        }
    }
}

/// Failure of a turn driven to completion without streaming.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TurnError {
    #[error("{0}")]
    StreamFailed(String),

    #[error("Turn ended without a final event")]
    Aborted,
}

/// One inbound chat message.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub message: String,
    /// Overrides the configured streaming deadline.
    pub timeout: Option<Duration>,
    pub request_id: String,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            timeout: None,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub stream_timeout: Duration,
    pub serialize_session_turns: bool,
    pub generation: GenerationParams,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stream_timeout: Duration::from_secs(60),
            serialize_session_turns: false,
            generation: GenerationParams::default(),
        }
    }
}

/// Why the streaming phase stopped early.
enum StreamStop {
    Failed(ProviderError),
    Cancelled,
}

/// Sending half of a turn's event channel.
struct Emitter {
    tx: mpsc::Sender<StreamEvent>,
}

impl Emitter {
    /// Returns `false` once the consumer has gone away.
    async fn emit(&self, event: StreamEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    async fn closed(&self) {
        self.tx.closed().await
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Per-turn bookkeeping.
struct Turn {
    request: TurnRequest,
    state: TurnState,
    started: Instant,
}

impl Turn {
    fn advance(&mut self, next: TurnState) {
        tracing::debug!(from = ?self.state, to = ?next, "Turn state transition");
        self.state = next;
    }
}

/// Orchestrates guard, completion source, session store and history log.
#[derive(Clone)]
pub struct ChatPipeline {
    guard: Arc<IntentGuard>,
    source: Arc<dyn CompletionSource>,
    store: SessionStore,
    history: Arc<dyn HistoryLog>,
    turn_locks: TurnLocks,
    settings: PipelineSettings,
}

impl ChatPipeline {
    pub fn new(
        guard: Arc<IntentGuard>,
        source: Arc<dyn CompletionSource>,
        store: SessionStore,
        history: Arc<dyn HistoryLog>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            guard,
            source,
            store,
            history,
            turn_locks: TurnLocks::new(),
            settings,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Start a turn and return its event stream.
    ///
    /// Events are pushed as they are produced. Dropping the stream cancels
    /// the turn: no further fragments are pulled and nothing is committed.
    pub fn stream_turn(&self, request: TurnRequest) -> TurnStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = tracing::info_span!(
            "chat_turn",
            request_id = %request.request_id,
            session_id = %request.session_id,
        );

        let pipeline = self.clone();
        tokio::spawn(
            async move {
                metrics::inc_turns_in_flight();
                let outcome = pipeline.run_turn(request, Emitter { tx }).await;
                metrics::dec_turns_in_flight();
                metrics::record_turn(outcome.as_str());
                tracing::info!(outcome = outcome.as_str(), "Chat turn finished");
            }
            .instrument(span),
        );

        ReceiverStream::new(rx)
    }

    /// Run a turn and return only its final content.
    pub async fn run_to_completion(&self, request: TurnRequest) -> Result<String, TurnError> {
        let mut events = self.stream_turn(request);

        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Token { .. } => continue,
                StreamEvent::End { content } => return Ok(content),
                StreamEvent::Error { content } => return Err(TurnError::StreamFailed(content)),
            }
        }

        Err(TurnError::Aborted)
    }

    async fn run_turn(&self, request: TurnRequest, emitter: Emitter) -> TurnOutcome {
        let _session_turn = if self.settings.serialize_session_turns {
            Some(self.turn_locks.acquire(&request.session_id).await)
        } else {
            None
        };

        let mut turn = Turn {
            request,
            state: TurnState::GuardingInput,
            started: Instant::now(),
        };

        // GuardingInput
        let decision = self.guard.classify(&turn.request.message).await;
        metrics::record_guard_decision("input", decision.allowed, decision.source.as_str());

        if !decision.allowed {
            tracing::info!(source = decision.source.as_str(), "Input blocked by intent guard");
            let block = self.guard.block_message().to_string();
            return self
                .finish_degraded(&mut turn, &emitter, block, TurnOutcome::GuardBlocked)
                .await;
        }

        // Streaming
        turn.advance(TurnState::Streaming);

        let snapshot = match self.store.get_or_create(&turn.request.session_id).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load session");
                metrics::record_persistence_error("session_store");
                turn.advance(TurnState::Errored);
                emitter.emit(StreamEvent::error(STREAM_FAILED_MESSAGE)).await;
                return TurnOutcome::StreamFailed;
            }
        };

        let mut accumulated = String::new();
        let stream_started = Instant::now();
        let streamed = self
            .stream_fragments(&turn, &snapshot.history, &emitter, &mut accumulated)
            .await;
        metrics::record_provider_latency(
            self.source.name(),
            stream_started.elapsed().as_secs_f64(),
        );

        match streamed {
            Ok(()) => {}
            Err(StreamStop::Cancelled) => {
                tracing::info!("Client went away mid-stream, abandoning turn");
                return TurnOutcome::Cancelled;
            }
            Err(StreamStop::Failed(error)) => {
                metrics::record_provider_error(self.source.name(), error.kind());

                if let Some(exceeded) = quota::classify(&error) {
                    tracing::warn!(
                        error = %error,
                        retry_after_secs = ?exceeded.retry_after_secs,
                        "Completion source quota exceeded, degrading turn"
                    );
                    return self
                        .finish_degraded(
                            &mut turn,
                            &emitter,
                            exceeded.message(),
                            TurnOutcome::QuotaExceeded,
                        )
                        .await;
                }

                tracing::error!(error = %error, "Completion stream failed");
                turn.advance(TurnState::Errored);
                emitter.emit(StreamEvent::error(STREAM_FAILED_MESSAGE)).await;
                return TurnOutcome::StreamFailed;
            }
        }

        // GuardingOutput
        turn.advance(TurnState::GuardingOutput);

        let final_content = self.guard_output(accumulated.trim()).await;

        if emitter.is_closed() {
            tracing::info!("Client went away before commit, abandoning turn");
            return TurnOutcome::Cancelled;
        }

        // Committing: two independent side effects.
        turn.advance(TurnState::Committing);

        let updated = snapshot.with_turn(
            Message::user(turn.request.message.clone()),
            Message::assistant(final_content.clone()),
        );

        let (stored, _) = tokio::join!(
            self.store.replace(&turn.request.session_id, updated),
            self.log_exchange(&turn.request.session_id, &turn.request.message, &final_content),
        );

        if let Err(e) = stored {
            tracing::warn!(error = %e, "Failed to commit session history (non-critical)");
            metrics::record_persistence_error("session_store");
        }

        turn.advance(TurnState::Done);
        emitter.emit(StreamEvent::end(final_content)).await;

        TurnOutcome::Completed
    }

    /// Pull fragments until the source is exhausted, fails, times out, or
    /// the consumer disconnects. Non-empty fragments are forwarded as
    /// `Token` events and appended to `accumulated`.
    async fn stream_fragments(
        &self,
        turn: &Turn,
        history: &[Message],
        emitter: &Emitter,
        accumulated: &mut String,
    ) -> Result<(), StreamStop> {
        let timeout = turn.request.timeout.unwrap_or(self.settings.stream_timeout);
        let deadline = Instant::now() + timeout;
        let timed_out = || StreamStop::Failed(ProviderError::Timeout(timeout.as_secs()));

        let opened = tokio::select! {
            biased;
            _ = emitter.closed() => return Err(StreamStop::Cancelled),
            opened = timeout_at(
                deadline,
                self.source.stream(&turn.request.message, history, &self.settings.generation),
            ) => opened,
        };

        let mut fragments = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(StreamStop::Failed(e)),
            Err(_) => return Err(timed_out()),
        };

        let mut first_token = true;

        loop {
            let next = tokio::select! {
                biased;
                _ = emitter.closed() => return Err(StreamStop::Cancelled),
                next = timeout_at(deadline, fragments.next()) => next,
            };

            match next {
                Err(_) => return Err(timed_out()),
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(StreamStop::Failed(e)),
                Ok(Some(Ok(StreamChunk::Text(text)))) => {
                    if text.is_empty() {
                        continue;
                    }
                    if first_token {
                        first_token = false;
                        metrics::record_first_token(
                            self.source.name(),
                            turn.started.elapsed().as_secs_f64(),
                        );
                    }
                    accumulated.push_str(&text);
                    if !emitter.emit(StreamEvent::token(text)).await {
                        return Err(StreamStop::Cancelled);
                    }
                }
                Ok(Some(Ok(StreamChunk::Complete {
                    input_tokens,
                    output_tokens,
                    finish_reason,
                }))) => {
                    tracing::debug!(
                        input_tokens,
                        output_tokens,
                        finish_reason = finish_reason.as_str(),
                        "Completion stream finished"
                    );
                    metrics::record_tokens(self.source.name(), input_tokens, output_tokens);
                }
            }
        }
    }

    /// Final content for a streamed reply: the reply itself if in scope,
    /// the block message otherwise (including an empty reply).
    async fn guard_output(&self, reply: &str) -> String {
        if reply.is_empty() {
            tracing::info!("Completion produced no text, substituting block message");
            return self.guard.block_message().to_string();
        }

        let decision = self.guard.classify(reply).await;
        metrics::record_guard_decision("output", decision.allowed, decision.source.as_str());

        if decision.allowed {
            reply.to_string()
        } else {
            tracing::info!(
                source = decision.source.as_str(),
                "Output blocked by intent guard after streaming"
            );
            self.guard.block_message().to_string()
        }
    }

    /// Deliver `content` as the whole reply of a turn that never commits to
    /// the session store (guard block before streaming, quota exhaustion),
    /// then record the exchange in the history log.
    async fn finish_degraded(
        &self,
        turn: &mut Turn,
        emitter: &Emitter,
        content: String,
        outcome: TurnOutcome,
    ) -> TurnOutcome {
        let delivered = emitter.emit(StreamEvent::token(content.clone())).await
            && emitter.emit(StreamEvent::end(content.clone())).await;

        if !delivered {
            return TurnOutcome::Cancelled;
        }

        turn.advance(TurnState::Done);
        self.log_exchange(&turn.request.session_id, &turn.request.message, &content)
            .await;
        outcome
    }

    /// Append the user and assistant messages to the history log. The
    /// assistant message is skipped if the user message could not be
    /// written, so the log never holds an unpaired reply.
    async fn log_exchange(&self, session_id: &str, user: &str, assistant: &str) {
        let result = match self.history.append(session_id, Role::User, user).await {
            Ok(()) => self.history.append(session_id, Role::Assistant, assistant).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to append to history log (non-critical)");
            metrics::record_persistence_error("history_log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::guard::{GuardConfig, BLOCK_MESSAGE};
    use crate::services::history_log::{HistoryLogError, InMemoryHistoryLog};
    use crate::services::providers::mock::MockCompletionSource;
    use crate::services::quota::QUOTA_MESSAGE;
    use async_trait::async_trait;

    struct Harness {
        pipeline: ChatPipeline,
        source: Arc<MockCompletionSource>,
        history: Arc<InMemoryHistoryLog>,
    }

    fn harness(source: MockCompletionSource) -> Harness {
        harness_with(source, PipelineSettings::default())
    }

    fn harness_with(source: MockCompletionSource, settings: PipelineSettings) -> Harness {
        harness_with_guard(source, settings, GuardConfig::default())
    }

    fn harness_with_guard(
        source: MockCompletionSource,
        settings: PipelineSettings,
        guard_config: GuardConfig,
    ) -> Harness {
        let source = Arc::new(source);
        let history = Arc::new(InMemoryHistoryLog::new());
        let guard = Arc::new(IntentGuard::new(source.clone(), guard_config));
        let pipeline = ChatPipeline::new(
            guard,
            source.clone(),
            SessionStore::in_memory(),
            history.clone(),
            settings,
        );
        Harness {
            pipeline,
            source,
            history,
        }
    }

    async fn collect(pipeline: &ChatPipeline, request: TurnRequest) -> Vec<StreamEvent> {
        pipeline.stream_turn(request).collect().await
    }

    #[tokio::test]
    async fn in_scope_question_streams_tokens_then_end() {
        let h = harness(MockCompletionSource::new(["S3 ", "is an object store."]));

        let events = collect(&h.pipeline, TurnRequest::new("s-a", "What is S3?")).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::token("S3 "),
                StreamEvent::token("is an object store."),
                StreamEvent::end("S3 is an object store."),
            ]
        );
        // Both guard passes hit the keyword fast path.
        assert_eq!(h.source.classify_calls(), 0);
        assert_eq!(h.source.stream_calls(), 1);

        let session = h.pipeline.store().get_or_create("s-a").await.unwrap();
        assert_eq!(session.len(), 2);
        assert_eq!(session.history[0].content, "What is S3?");
        assert_eq!(session.history[1].content, "S3 is an object store.");

        let logged = h.history.messages("s-a").await;
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[0].role, Role::User);
        assert_eq!(logged[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn out_of_scope_input_is_blocked_before_streaming() {
        let h = harness(
            MockCompletionSource::new(["should never stream"])
                .with_classification(Ok("BLOCK".to_string())),
        );

        let events =
            collect(&h.pipeline, TurnRequest::new("s-b", "What's the weather today?")).await;

        assert_eq!(
            events,
            vec![StreamEvent::token(BLOCK_MESSAGE), StreamEvent::end(BLOCK_MESSAGE)]
        );
        assert_eq!(h.source.stream_calls(), 0);

        // Logged, but the in-memory session was never touched.
        let logged = h.history.messages("s-b").await;
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[1].content, BLOCK_MESSAGE);
        assert!(h.pipeline.store().get_or_create("s-b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn quota_failure_degrades_to_advisory_message() {
        let h = harness(MockCompletionSource::new(Vec::<String>::new()).with_start_error(
            ProviderError::ApiError(
                "RESOURCE_EXHAUSTED: You exceeded your current quota. Please retry in 12s."
                    .to_string(),
            ),
        ));

        let events = collect(&h.pipeline, TurnRequest::new("s-c", "Explain AWS IAM")).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::Token { content } if content.ends_with("~12s.")));
        assert!(matches!(&events[1], StreamEvent::End { content } if content.ends_with("~12s.")));
        assert!(events[1].content().starts_with(QUOTA_MESSAGE));

        let logged = h.history.messages("s-c").await;
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[1].content, events[1].content());
    }

    #[tokio::test]
    async fn quota_failure_mid_stream_still_ends_normally() {
        let h = harness(
            MockCompletionSource::new(["AWS "])
                .with_stream_error(ProviderError::RateLimited("slow down".to_string())),
        );

        let events = collect(&h.pipeline, TurnRequest::new("s", "Tell me about AWS")).await;

        assert_eq!(events[0], StreamEvent::token("AWS "));
        assert!(events.iter().all(|e| !matches!(e, StreamEvent::Error { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::End { .. })));
    }

    #[tokio::test]
    async fn generic_failure_emits_single_error_and_leaves_session_alone() {
        let h = harness(
            MockCompletionSource::new(["partial "])
                .with_stream_error(ProviderError::NetworkError("connection reset".to_string())),
        );

        let events = collect(&h.pipeline, TurnRequest::new("s-d", "What is EC2?")).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::token("partial "),
                StreamEvent::error(STREAM_FAILED_MESSAGE),
            ]
        );
        assert!(h.pipeline.store().get_or_create("s-d").await.unwrap().is_empty());
        assert!(h.history.messages("s-d").await.is_empty());
    }

    #[tokio::test]
    async fn connection_error_at_start_is_a_stream_failure() {
        let h = harness(
            MockCompletionSource::new(Vec::<String>::new())
                .with_start_error(ProviderError::NetworkError("connection refused".to_string())),
        );

        let events = collect(&h.pipeline, TurnRequest::new("s-d", "What is EC2?")).await;

        assert_eq!(events, vec![StreamEvent::error(STREAM_FAILED_MESSAGE)]);
    }

    #[tokio::test]
    async fn empty_reply_is_replaced_by_block_message() {
        let h = harness(MockCompletionSource::new(["", "   "]));

        let events = collect(&h.pipeline, TurnRequest::new("s", "What is S3?")).await;

        assert_eq!(events.last(), Some(&StreamEvent::end(BLOCK_MESSAGE)));
        let session = h.pipeline.store().get_or_create("s").await.unwrap();
        assert_eq!(session.history[1].content, BLOCK_MESSAGE);
    }

    #[tokio::test]
    async fn off_topic_reply_is_replaced_in_end_event_only() {
        // Input passes the keyword fast path; the reply needs the classifier.
        let h = harness(
            MockCompletionSource::new(["Here is a pasta recipe."])
                .with_classification(Ok("BLOCK".to_string())),
        );

        let events = collect(&h.pipeline, TurnRequest::new("s", "What is S3?")).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::token("Here is a pasta recipe."),
                StreamEvent::end(BLOCK_MESSAGE),
            ]
        );
        assert_eq!(h.source.classify_calls(), 1);
    }

    #[tokio::test]
    async fn history_grows_by_two_messages_per_turn() {
        let h = harness(MockCompletionSource::new(["AWS answer."]));

        for i in 0..3 {
            let events =
                collect(&h.pipeline, TurnRequest::new("s", format!("AWS question {}", i))).await;
            assert!(matches!(events.last(), Some(StreamEvent::End { .. })));
        }

        let session = h.pipeline.store().get_or_create("s").await.unwrap();
        assert_eq!(session.len(), 6);
        for (i, pair) in session.history.chunks(2).enumerate() {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[0].content, format!("AWS question {}", i));
            assert_eq!(pair[1].role, Role::Assistant);
        }
        assert!(session
            .history
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));

        // The last call saw the two earlier turns as context.
        assert_eq!(h.source.last_history().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out_as_stream_failure() {
        let h = harness(
            MockCompletionSource::new(["AWS ", "late"]).with_fragment_delay(Duration::from_secs(5)),
        );

        let request = TurnRequest::new("s", "What is AWS?").with_timeout(Duration::from_secs(7));
        let events = collect(&h.pipeline, request).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::token("AWS "),
                StreamEvent::error(STREAM_FAILED_MESSAGE),
            ]
        );
        assert!(h.pipeline.store().get_or_create("s").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_input_classifier_falls_back_and_still_streams() {
        let h = harness_with_guard(
            MockCompletionSource::new(["Deploy with EKS."])
                .with_classify_delay(Duration::from_secs(3600)),
            PipelineSettings::default(),
            GuardConfig::default().with_classifier_timeout(Duration::from_secs(1)),
        );
        let started = tokio::time::Instant::now();

        let events =
            collect(&h.pipeline, TurnRequest::new("s", "How do I deploy to kubernetes?")).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::token("Deploy with EKS."),
                StreamEvent::end("Deploy with EKS."),
            ]
        );
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(h.source.classify_calls(), 1);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_without_commit() {
        let h = harness(
            MockCompletionSource::new(["AWS ", "is ", "big ", "and ", "old."])
                .with_fragment_delay(Duration::from_millis(20)),
        );

        let mut events = h.pipeline.stream_turn(TurnRequest::new("s", "What is AWS?"));
        let first = events.next().await;
        assert_eq!(first, Some(StreamEvent::token("AWS ")));
        drop(events);

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(h.source.fragments_sent() < 5);
        assert!(h.pipeline.store().get_or_create("s").await.unwrap().is_empty());
        assert!(h.history.messages("s").await.is_empty());
    }

    struct FailingHistoryLog;

    #[async_trait]
    impl HistoryLog for FailingHistoryLog {
        async fn append(&self, _: &str, _: Role, _: &str) -> Result<(), HistoryLogError> {
            Err(HistoryLogError::WriteFailed("disk full".to_string()))
        }

        async fn health_check(&self) -> Result<(), HistoryLogError> {
            Err(HistoryLogError::Unavailable("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn history_log_failure_does_not_affect_turn_or_session() {
        let source = Arc::new(MockCompletionSource::new(["Use AWS Lambda."]));
        let guard = Arc::new(IntentGuard::new(source.clone(), GuardConfig::default()));
        let pipeline = ChatPipeline::new(
            guard,
            source,
            SessionStore::in_memory(),
            Arc::new(FailingHistoryLog),
            PipelineSettings::default(),
        );

        let events = collect(&pipeline, TurnRequest::new("s", "How do I run code on AWS?")).await;

        assert_eq!(events.last(), Some(&StreamEvent::end("Use AWS Lambda.")));
        assert_eq!(pipeline.store().get_or_create("s").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn run_to_completion_returns_final_content_or_error() {
        let ok = harness(MockCompletionSource::new(["S3 ", "stores objects."]));
        assert_eq!(
            ok.pipeline
                .run_to_completion(TurnRequest::new("s", "What is S3?"))
                .await,
            Ok("S3 stores objects.".to_string())
        );

        let failing = harness(
            MockCompletionSource::new(Vec::<String>::new())
                .with_start_error(ProviderError::NetworkError("down".to_string())),
        );
        assert_eq!(
            failing
                .pipeline
                .run_to_completion(TurnRequest::new("s", "What is S3?"))
                .await,
            Err(TurnError::StreamFailed(STREAM_FAILED_MESSAGE.to_string()))
        );
    }

    #[tokio::test]
    async fn serialized_turns_on_one_session_keep_every_exchange() {
        let settings = PipelineSettings {
            serialize_session_turns: true,
            ..PipelineSettings::default()
        };
        let h = harness_with(
            MockCompletionSource::new(["AWS ", "reply."])
                .with_fragment_delay(Duration::from_millis(10)),
            settings,
        );

        let turns: Vec<_> = (0..4)
            .map(|i| {
                let pipeline = h.pipeline.clone();
                tokio::spawn(async move {
                    pipeline
                        .run_to_completion(TurnRequest::new("shared", format!("AWS q{}", i)))
                        .await
                })
            })
            .collect();

        for turn in turns {
            assert!(turn.await.unwrap().is_ok());
        }

        let session = h.pipeline.store().get_or_create("shared").await.unwrap();
        assert_eq!(session.len(), 8);
    }
}
