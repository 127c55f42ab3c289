//! A scripted in-process provider for tests and dry runs.
//!
//! The stub replays a queue of canned replies, or falls back to a fixed
//! reply when the queue is empty. It never touches the network, which makes
//! it suitable for exercising the whole pipeline in unit and integration
//! tests.

use std::collections::VecDeque;
use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use futures::stream;

use super::{
    ChatDelta, ChatDeltaStream, ChatOutcome, ChatProvider, ChatRequest, OcrProvider,
    ProviderError, TranscriptionProvider, VisionProvider,
};
use crate::{prelude::*, tokens::UsageTotals};

/// One canned reply.
#[derive(Debug, Clone)]
pub enum StubReply {
    /// A structured payload, returned whole.
    Value(Value),

    /// Progressive raw-text chunks; concatenated they form the final
    /// payload. Used to exercise partial streaming.
    Chunks(Vec<String>),

    /// A fatal provider failure.
    Fail(String),
}

/// Scripted provider.
pub struct StubProvider {
    script: Mutex<VecDeque<StubReply>>,
    fallback: StubReply,
    transcript: String,
    vision_markdown: String,
    ocr_text: String,
    chat_calls: AtomicUsize,
}

impl StubProvider {
    /// A stub that answers every chat request with the same payload.
    pub fn always(value: Value) -> Self {
        Self::new(Vec::new(), StubReply::Value(value))
    }

    /// A stub that replays `script` in order, then falls back to
    /// `fallback`.
    pub fn scripted(script: Vec<StubReply>, fallback: StubReply) -> Self {
        Self::new(script, fallback)
    }

    fn new(script: Vec<StubReply>, fallback: StubReply) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            transcript: "This is a stub transcript.".to_string(),
            vision_markdown: "# Stub document\n\nStub image description.".to_string(),
            ocr_text: "Stub OCR text.".to_string(),
            chat_calls: AtomicUsize::new(0),
        }
    }

    /// Override the canned transcript.
    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        self.transcript = transcript.into();
        self
    }

    /// Override the canned vision output.
    pub fn with_vision_markdown(mut self, markdown: impl Into<String>) -> Self {
        self.vision_markdown = markdown.into();
        self
    }

    /// How many chat completions (one-shot or streaming) have been
    /// requested. Cache tests assert on this.
    pub fn chat_call_count(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> StubReply {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().expect("stub script lock poisoned");
        script.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

/// Usage we report for a stub round trip. Non-zero so cache-hit assertions
/// can tell hits from misses.
fn stub_usage() -> UsageTotals {
    UsageTotals::for_request(100, 25)
}

#[async_trait]
impl ChatProvider for StubProvider {
    async fn complete(&self, _req: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
        match self.next_reply() {
            StubReply::Value(value) => Ok(ChatOutcome {
                content: value.to_string(),
                usage: stub_usage(),
            }),
            StubReply::Chunks(chunks) => Ok(ChatOutcome {
                content: chunks.concat(),
                usage: stub_usage(),
            }),
            StubReply::Fail(message) => Err(ProviderError::Api {
                status: None,
                message,
            }),
        }
    }

    async fn complete_stream(
        &self,
        _req: &ChatRequest,
    ) -> Result<ChatDeltaStream, ProviderError> {
        match self.next_reply() {
            StubReply::Value(value) => {
                let items = vec![
                    Ok(ChatDelta::Content(value.to_string())),
                    Ok(ChatDelta::Done {
                        usage: stub_usage(),
                    }),
                ];
                Ok(Box::pin(stream::iter(items)))
            }
            StubReply::Chunks(chunks) => {
                let mut items: Vec<Result<ChatDelta, ProviderError>> = chunks
                    .into_iter()
                    .map(|chunk| Ok(ChatDelta::Content(chunk)))
                    .collect();
                items.push(Ok(ChatDelta::Done {
                    usage: stub_usage(),
                }));
                Ok(Box::pin(stream::iter(items)))
            }
            StubReply::Fail(message) => Err(ProviderError::Api {
                status: None,
                message,
            }),
        }
    }
}

#[async_trait]
impl TranscriptionProvider for StubProvider {
    async fn transcribe(&self, _path: &Path) -> Result<String, ProviderError> {
        Ok(self.transcript.clone())
    }
}

#[async_trait]
impl VisionProvider for StubProvider {
    async fn to_markdown(
        &self,
        _path: &Path,
        _prompt: &str,
    ) -> Result<String, ProviderError> {
        Ok(self.vision_markdown.clone())
    }
}

#[async_trait]
impl OcrProvider for StubProvider {
    async fn ocr_pdf(&self, _path: &Path) -> Result<String, ProviderError> {
        Ok(self.ocr_text.clone())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;

    use super::*;

    #[tokio::test]
    async fn scripted_replies_play_in_order() {
        let stub = StubProvider::scripted(
            vec![
                StubReply::Value(json!({"a": 1})),
                StubReply::Fail("boom".to_string()),
            ],
            StubReply::Value(json!({"fallback": true})),
        );
        let req = ChatRequest::new("stub", "hello");

        let first = stub.complete(&req).await.unwrap();
        assert_eq!(first.content, r#"{"a":1}"#);
        assert!(stub.complete(&req).await.is_err());
        let third = stub.complete(&req).await.unwrap();
        assert!(third.content.contains("fallback"));
        assert_eq!(stub.chat_call_count(), 3);
    }

    #[tokio::test]
    async fn chunked_replies_stream_progressively() {
        let stub = StubProvider::scripted(
            vec![StubReply::Chunks(vec![
                r#"{"a""#.to_string(),
                r#": 1}"#.to_string(),
            ])],
            StubReply::Value(json!({})),
        );
        let req = ChatRequest::new("stub", "hello");
        let chunks: Vec<_> = stub
            .complete_stream(&req)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks.len(), 3);
        assert!(matches!(chunks.last().unwrap(), Ok(ChatDelta::Done { .. })));
    }
}
