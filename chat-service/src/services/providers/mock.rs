//! Mock completion source for tests and local development.

use super::{
    CompletionSource, FinishReason, FragmentStream, GenerationParams, ProviderError, StreamChunk,
};
use crate::models::Message;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Scripted completion source.
///
/// Replays a fixed list of fragments, optionally followed by a failure, and
/// answers classification calls with a fixed verdict. Call counts are
/// recorded so tests can assert which capabilities were used.
pub struct MockCompletionSource {
    fragments: Vec<String>,
    stream_error: Option<ProviderError>,
    start_error: Option<ProviderError>,
    classify_reply: Result<String, ProviderError>,
    fragment_delay: Option<Duration>,
    classify_delay: Option<Duration>,
    stream_calls: AtomicUsize,
    classify_calls: AtomicUsize,
    fragments_sent: Arc<AtomicUsize>,
    last_history: Mutex<Vec<Message>>,
}

impl MockCompletionSource {
    /// Streams `fragments` and classifies everything as `ALLOW`.
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            stream_error: None,
            start_error: None,
            classify_reply: Ok("ALLOW".to_string()),
            fragment_delay: None,
            classify_delay: None,
            stream_calls: AtomicUsize::new(0),
            classify_calls: AtomicUsize::new(0),
            fragments_sent: Arc::new(AtomicUsize::new(0)),
            last_history: Mutex::new(Vec::new()),
        }
    }

    /// Canned provider used when `CHAT_USE_MOCK_PROVIDER` is set.
    pub fn canned() -> Self {
        Self::new([
            "AWS ",
            "offers ",
            "managed ",
            "cloud ",
            "services.",
        ])
    }

    /// Fail the stream with `error` after all fragments were sent.
    pub fn with_stream_error(mut self, error: ProviderError) -> Self {
        self.stream_error = Some(error);
        self
    }

    /// Fail the stream request itself before any fragment.
    pub fn with_start_error(mut self, error: ProviderError) -> Self {
        self.start_error = Some(error);
        self
    }

    /// Answer classification calls with `reply`.
    pub fn with_classification(mut self, reply: Result<String, ProviderError>) -> Self {
        self.classify_reply = reply;
        self
    }

    /// Sleep before each fragment.
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = Some(delay);
        self
    }

    /// Sleep before answering each classification call.
    pub fn with_classify_delay(mut self, delay: Duration) -> Self {
        self.classify_delay = Some(delay);
        self
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }

    /// Fragments actually handed to a consumer.
    pub fn fragments_sent(&self) -> usize {
        self.fragments_sent.load(Ordering::SeqCst)
    }

    /// History passed to the most recent `stream` call.
    pub fn last_history(&self) -> Vec<Message> {
        self.last_history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CompletionSource for MockCompletionSource {
    async fn stream(
        &self,
        prompt: &str,
        history: &[Message],
        _params: &GenerationParams,
    ) -> Result<FragmentStream, ProviderError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_history.lock() {
            *last = history.to_vec();
        }

        if let Some(error) = &self.start_error {
            return Err(error.clone());
        }

        let input_tokens = prompt.len() as i32 / 4;
        let output_tokens = self.fragments.len() as i32;
        let fragments = self.fragments.clone();
        let stream_error = self.stream_error.clone();
        let delay = self.fragment_delay;
        let sent = self.fragments_sent.clone();

        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            for fragment in fragments {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(StreamChunk::Text(fragment))).await.is_err() {
                    return;
                }
                sent.fetch_add(1, Ordering::SeqCst);
            }

            let last = match stream_error {
                Some(error) => Err(error),
                None => Ok(StreamChunk::Complete {
                    input_tokens,
                    output_tokens,
                    finish_reason: FinishReason::Complete,
                }),
            };
            let _ = tx.send(last).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)) as FragmentStream)
    }

    async fn classify(&self, _instruction: &str, _text: &str) -> Result<String, ProviderError> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.classify_delay {
            tokio::time::sleep(delay).await;
        }
        self.classify_reply.clone()
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
