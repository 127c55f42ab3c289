//! Model providers.
//!
//! Everything the engine needs from the outside world — chat completions,
//! speech-to-text, image description, document OCR — goes through the traits
//! here. The engine never talks to an SDK directly, so tests run against
//! [`stub::StubProvider`] and deployments pick a driver at startup.

pub mod openai;
pub mod stub;

use std::{error, fmt, sync::Arc};

use crate::{
    async_utils::BoxedStream,
    prelude::*,
    tokens::UsageTotals,
};

/// A chat completion request. Only the parameters the pipeline actually
/// varies are here; drivers fill in the rest.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model id, e.g. `gpt-4o`.
    pub model: String,

    /// Optional system message.
    pub system: Option<String>,

    /// The user message.
    pub user: String,

    /// JSON Schema the response must conform to, when structured output is
    /// wanted.
    pub response_schema: Option<Value>,

    /// Name for the response schema (some endpoints require one).
    pub schema_name: String,

    /// Sampling temperature, from per-model configuration.
    pub temperature: Option<f32>,

    /// Sampling seed, from per-model configuration.
    pub seed: Option<i64>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            user: user.into(),
            response_schema: None,
            schema_name: "Response".to_string(),
            temperature: None,
            seed: None,
        }
    }
}

/// A completed chat response.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// The raw response text. For structured requests this is a JSON
    /// document.
    pub content: String,

    /// Provider-reported usage.
    pub usage: UsageTotals,
}

/// One item of a streaming chat response.
#[derive(Debug, Clone)]
pub enum ChatDelta {
    /// More response text.
    Content(String),

    /// The stream is complete. Usage is only present if the provider
    /// reports it for streams.
    Done { usage: UsageTotals },
}

/// An error from a provider call.
///
/// This is deliberately not `anyhow`: retry classification needs to see the
/// shape of the failure.
#[derive(Debug)]
pub enum ProviderError {
    /// The provider's API returned an error.
    Api {
        status: Option<reqwest::StatusCode>,
        message: String,
    },

    /// The call ran out of time.
    Timeout,

    /// The driver doesn't implement this capability.
    Unsupported(String),

    /// Anything else.
    Other(anyhow::Error),
}

impl ProviderError {
    /// Is this error likely to be transient?
    ///
    /// By default, we assume errors are not transient, until they've been
    /// observed in the wild, investigated and determined to be transient.
    /// This prevents us from doing large numbers of retries with exponential
    /// backoff on errors that will never resolve.
    pub fn is_known_transient(&self) -> bool {
        match self {
            ProviderError::Api { status, .. } => match status {
                Some(status) => {
                    let transient_failures = [
                        reqwest::StatusCode::TOO_MANY_REQUESTS,
                        reqwest::StatusCode::BAD_GATEWAY,
                        reqwest::StatusCode::SERVICE_UNAVAILABLE,
                        reqwest::StatusCode::GATEWAY_TIMEOUT,
                    ];
                    transient_failures.contains(status)
                }
                // There are a lot of things that can go wrong at the HTTP
                // layer, and most SDKs don't expose them in enough detail to
                // be certain which are transient.
                None => true,
            },
            // Runaway responses and overloaded servers can be retried with
            // hope of a better result.
            ProviderError::Timeout => true,
            ProviderError::Unsupported(_) => false,
            ProviderError::Other(_) => false,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Api { status, message } => match status {
                Some(status) => write!(f, "provider API error ({status}): {message}"),
                None => write!(f, "provider API error: {message}"),
            },
            ProviderError::Timeout => write!(f, "provider request timed out"),
            ProviderError::Unsupported(what) => {
                write!(f, "provider does not support {what}")
            }
            ProviderError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl error::Error for ProviderError {}

/// A stream of chat deltas.
pub type ChatDeltaStream = BoxedStream<Result<ChatDelta, ProviderError>>;

/// Chat completions, one-shot and streaming.
#[async_trait]
pub trait ChatProvider: Send + Sync + 'static {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatOutcome, ProviderError>;

    async fn complete_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<ChatDeltaStream, ProviderError>;
}

/// Speech-to-text.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync + 'static {
    /// Transcribe an audio file to plain text.
    async fn transcribe(&self, path: &Path) -> Result<String, ProviderError>;
}

/// Image and office-document conversion to Markdown.
#[async_trait]
pub trait VisionProvider: Send + Sync + 'static {
    /// Describe an image (or convert an office document) as Markdown.
    async fn to_markdown(&self, path: &Path, prompt: &str)
    -> Result<String, ProviderError>;
}

/// OCR for scanned PDFs.
#[async_trait]
pub trait OcrProvider: Send + Sync + 'static {
    /// OCR a PDF to Markdown-ish text.
    async fn ocr_pdf(&self, path: &Path) -> Result<String, ProviderError>;
}

/// The bundle of provider adapters the engine runs against.
#[derive(Clone)]
pub struct Providers {
    pub chat: Arc<dyn ChatProvider>,
    pub transcription: Arc<dyn TranscriptionProvider>,
    pub vision: Arc<dyn VisionProvider>,
    /// OCR is optional; without it, scanned PDFs fail as `ocr_unavailable`.
    pub ocr: Option<Arc<dyn OcrProvider>>,
}

impl Providers {
    /// The default OpenAI-compatible driver for every capability it has.
    /// There is no OpenAI-compatible OCR endpoint, so OCR stays unset unless
    /// a dedicated provider is wired in.
    pub fn openai() -> Result<Self> {
        let driver = Arc::new(openai::OpenAiProvider::from_env()?);
        Ok(Self {
            chat: driver.clone(),
            transcription: driver.clone(),
            vision: driver,
            ocr: None,
        })
    }

    /// A scripted in-process provider for tests and dry runs.
    pub fn stubbed(stub: Arc<stub::StubProvider>) -> Self {
        Self {
            chat: stub.clone(),
            transcription: stub.clone(),
            vision: stub.clone(),
            ocr: Some(stub),
        }
    }
}
