//! The OpenAI-compatible driver (also works with LiteLLM, Ollama, and other
//! gateways speaking the same API).

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        AudioInput, ChatCompletionRequestMessage,
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs,
        ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, ChatCompletionStreamOptions,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
        CreateTranscriptionRequestArgs, ImageDetail, ImageUrlArgs, InputSource,
        ResponseFormat, ResponseFormatJsonSchema,
    },
};
use base64::Engine as _;
use futures::StreamExt as _;

use super::{
    ChatDelta, ChatDeltaStream, ChatOutcome, ChatProvider, ChatRequest, ProviderError,
    TranscriptionProvider, VisionProvider,
};
use crate::{prelude::*, tokens::UsageTotals};

/// OpenAI-compatible driver.
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiProvider {
    /// Create a driver from the standard environment variables
    /// (`OPENAI_API_KEY`, and optionally `OPENAI_API_BASE` to point at a
    /// gateway).
    pub fn from_env() -> Result<Self> {
        let mut client_config = OpenAIConfig::new();
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            client_config = client_config.with_api_key(api_key);
        }
        if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
            client_config = client_config.with_api_base(api_base);
        }
        Ok(Self {
            client: Client::with_config(client_config),
        })
    }

    fn build_request(
        &self,
        req: &ChatRequest,
        stream: bool,
    ) -> Result<CreateChatCompletionRequest, ProviderError> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();
        if let Some(system) = &req.system {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(ChatCompletionRequestSystemMessageContent::Text(
                        system.clone(),
                    ))
                    .build()
                    .map_err(ProviderError::from)?,
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(ChatCompletionRequestUserMessageContent::Text(
                    req.user.clone(),
                ))
                .build()
                .map_err(ProviderError::from)?,
        ));

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(req.model.clone()).messages(messages);
        // Keep the API from storing responses for later REST calls.
        builder.store(false);
        if let Some(schema) = &req.response_schema {
            builder.response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    name: req.schema_name.clone(),
                    schema: Some(schema.clone()),
                    strict: Some(true),
                    description: None,
                },
            });
        }
        if let Some(temperature) = req.temperature {
            builder.temperature(temperature);
        }
        if let Some(seed) = req.seed {
            builder.seed(seed);
        }
        if stream {
            builder.stream(true);
            builder.stream_options(ChatCompletionStreamOptions {
                include_usage: true,
            });
        }
        builder.build().map_err(ProviderError::from)
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    #[instrument(level = "debug", skip_all, fields(model = %req.model))]
    async fn complete(&self, req: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
        let request = self.build_request(req, false)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(ProviderError::from)?;

        let usage = response
            .usage
            .as_ref()
            .map(|usage| {
                UsageTotals::for_request(
                    u64::from(usage.prompt_tokens),
                    u64::from(usage.completion_tokens),
                )
            })
            .unwrap_or_else(|| UsageTotals {
                requests: 1,
                ..UsageTotals::default()
            });

        let choice = response.choices.into_iter().next().ok_or_else(|| {
            ProviderError::Api {
                status: None,
                message: "no choices in response".to_string(),
            }
        })?;
        if choice.finish_reason == Some(async_openai::types::FinishReason::ContentFilter)
        {
            return Err(ProviderError::Api {
                status: None,
                message: "content filter triggered".to_string(),
            });
        }
        Ok(ChatOutcome {
            content: choice.message.content.unwrap_or_default(),
            usage,
        })
    }

    #[instrument(level = "debug", skip_all, fields(model = %req.model))]
    async fn complete_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<ChatDeltaStream, ProviderError> {
        let request = self.build_request(req, true)?;
        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(ProviderError::from)?;

        let deltas = stream.map(|chunk| match chunk {
            Ok(chunk) => {
                // The usage-bearing chunk arrives last, with no choices.
                if let Some(usage) = chunk.usage {
                    return Ok(ChatDelta::Done {
                        usage: UsageTotals::for_request(
                            u64::from(usage.prompt_tokens),
                            u64::from(usage.completion_tokens),
                        ),
                    });
                }
                let content = chunk
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.clone())
                    .unwrap_or_default();
                Ok(ChatDelta::Content(content))
            }
            Err(err) => Err(ProviderError::from(err)),
        });
        Ok(Box::pin(deltas))
    }
}

#[async_trait]
impl TranscriptionProvider for OpenAiProvider {
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn transcribe(&self, path: &Path) -> Result<String, ProviderError> {
        let request = CreateTranscriptionRequestArgs::default()
            .file(AudioInput {
                source: InputSource::Path {
                    path: path.to_path_buf(),
                },
            })
            .model("whisper-1")
            .build()
            .map_err(ProviderError::from)?;
        let response = self
            .client
            .audio()
            .transcribe(request)
            .await
            .map_err(ProviderError::from)?;
        Ok(response.text)
    }
}

#[async_trait]
impl VisionProvider for OpenAiProvider {
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn to_markdown(
        &self,
        path: &Path,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {path:?}"))
            .map_err(ProviderError::Other)?;
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let data_url = format!(
            "data:{};base64,{}",
            mime.essence_str(),
            base64::engine::general_purpose::STANDARD.encode(&bytes)
        );

        let parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![
            ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartTextArgs::default()
                    .text(prompt.to_string())
                    .build()
                    .map_err(ProviderError::from)?,
            ),
            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImageArgs::default()
                    .image_url(
                        ImageUrlArgs::default()
                            .url(data_url)
                            .detail(ImageDetail::High)
                            .build()
                            .map_err(ProviderError::from)?,
                    )
                    .build()
                    .map_err(ProviderError::from)?,
            ),
        ];
        let messages = vec![ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(ChatCompletionRequestUserMessageContent::Array(parts))
                .build()
                .map_err(ProviderError::from)?,
        )];

        let request = CreateChatCompletionRequestArgs::default()
            .model("gpt-4o")
            .messages(messages)
            .build()
            .map_err(ProviderError::from)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(ProviderError::from)?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        Ok(content)
    }
}

impl From<OpenAIError> for ProviderError {
    fn from(err: OpenAIError) -> Self {
        match err {
            OpenAIError::Reqwest(reqwest_err) => ProviderError::Api {
                status: reqwest_err.status(),
                message: reqwest_err.to_string(),
            },
            OpenAIError::ApiError(api_err) => ProviderError::Api {
                status: None,
                message: api_err.message,
            },
            other => ProviderError::Other(anyhow!(other)),
        }
    }
}
