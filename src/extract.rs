//! Structured extraction.
//!
//! The extractor turns converted Markdown into a schema-conformant value by
//! prompting the chat provider with a JSON Schema response format. It is the
//! sole owner of provider retries: transient failures (and structurally
//! invalid responses, which usually mean a dodgy `response_format`
//! implementation at some gateway) back off exponentially and try again, up
//! to the configured attempt ceiling.
//!
//! Streaming mode forwards partially populated records as they arrive.
//! Partial payloads are recovered from incomplete JSON by closing open
//! strings and brackets; anything that still doesn't parse is dropped, per
//! the contract that partial events are best-effort.

use std::{fmt, sync::Arc};

use futures::StreamExt as _;
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use tokio::{sync::mpsc, time};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    async_utils::BoxedStream,
    config::{AiProcessingConfig, ModelParams},
    errors::{ErrorKind, HumanizedError, humanize_validation_errors, validation_failure_message},
    prelude::*,
    provider::{ChatDelta, ChatOutcome, ChatProvider, ChatRequest, ProviderError},
    retry::{IntoRetryResult as _, retry_result_ok, try_with_retry_result},
    schema::{Schema, validate::validate},
    tokens::UsageTotals,
};

/// The model to extract with, plus its configured parameters.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub id: String,
    pub params: ModelParams,
}

/// A successful final extraction.
#[derive(Debug, Clone)]
pub struct FinalExtraction {
    /// The schema-conformant value: a record, or for nested schemas the
    /// wrapper holding the `item` list.
    pub structured: Value,

    pub usage: UsageTotals,
}

/// A failed extraction, with a kind the pipeline can surface.
#[derive(Debug, Clone)]
pub struct ExtractionFailure {
    pub kind: ErrorKind,
    pub message: String,

    /// Present when the failure was schema validation.
    pub humanized: Option<HumanizedError>,
}

impl ExtractionFailure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            humanized: None,
        }
    }
}

/// One event from a streaming extraction. All but the last are `Partial`.
#[derive(Debug, Clone)]
pub enum ExtractionEvent {
    /// A partially populated record. May fail strict validation.
    Partial { structured: Value },

    /// The terminal outcome.
    Final(Result<FinalExtraction, ExtractionFailure>),
}

/// Internal error used for retry classification.
#[derive(Debug)]
enum AttemptError {
    Provider(ProviderError),
    Timeout,
    NonJson(String),
    Invalid {
        message: String,
        humanized: HumanizedError,
    },
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            AttemptError::Provider(err) => err.is_known_transient(),
            // Runaway responses and overloaded servers can be retried with
            // hope of a better result.
            AttemptError::Timeout => true,
            // Not JSON means the model didn't generate JSON. Give it
            // another chance.
            AttemptError::NonJson(_) => true,
            // Schema validation failure may be caused by a dodgy
            // `response_format` implementation at a specific endpoint.
            AttemptError::Invalid { .. } => true,
        }
    }

    fn into_failure(self) -> ExtractionFailure {
        match self {
            AttemptError::Provider(ProviderError::Timeout) | AttemptError::Timeout => {
                ExtractionFailure::new(ErrorKind::Timeout, "Extraction timed out")
            }
            AttemptError::Provider(err) => {
                ExtractionFailure::new(ErrorKind::Internal, err.to_string())
            }
            AttemptError::NonJson(message) => {
                ExtractionFailure::new(ErrorKind::ExtractionFailed, message)
            }
            AttemptError::Invalid { message, humanized } => ExtractionFailure {
                kind: ErrorKind::ExtractionFailed,
                message,
                humanized: Some(humanized),
            },
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Provider(err) => write!(f, "{err}"),
            AttemptError::Timeout => write!(f, "extraction timed out"),
            AttemptError::NonJson(message) => write!(f, "{message}"),
            AttemptError::Invalid { message, .. } => write!(f, "{message}"),
        }
    }
}

#[derive(Clone)]
pub struct Extractor {
    chat: Arc<dyn ChatProvider>,
    config: AiProcessingConfig,
    /// Handlebars template binding `schema_description`, `schema_name`,
    /// `instructions`, `content`. Empty means use the built-in fallback.
    template: String,
}

impl Extractor {
    pub fn new(
        chat: Arc<dyn ChatProvider>,
        config: AiProcessingConfig,
        template: String,
    ) -> Self {
        Self {
            chat,
            config,
            template,
        }
    }

    /// Assemble the extraction prompt.
    pub fn assemble_prompt(
        &self,
        schema: &Schema,
        instructions: &str,
        content: &str,
    ) -> Result<String> {
        if self.template.is_empty() {
            // The documented fallback.
            Ok(format!(
                "Analyze the following content.\n\n\
                 Task: {description}\n\n\
                 You should extract information according to the {name} schema.\n\
                 {instructions}\n\n\
                 Content to analyze:\n\n\
                 {content}\n",
                description = schema.description,
                name = schema.name,
            ))
        } else {
            let handlebars = handlebars::Handlebars::new();
            handlebars
                .render_template(
                    &self.template,
                    &json!({
                        "schema_description": schema.description,
                        "schema_name": schema.name,
                        "instructions": instructions,
                        "content": content,
                    }),
                )
                .context("failed to render analysis template")
        }
    }

    fn chat_request(
        &self,
        schema: &Schema,
        instructions: &str,
        content: &str,
        model: &ModelSpec,
    ) -> Result<ChatRequest> {
        let prompt = self.assemble_prompt(schema, instructions, content)?;
        let mut request = ChatRequest::new(&model.id, prompt);
        request.system = Some(format!(
            "You are a data extraction engine. Extract structured data from the \
             document exactly as described. {}",
            schema.description
        ));
        request.response_schema = Some(schema.to_json_schema());
        request.schema_name = schema.name.replace(' ', "");
        request.temperature = model.params.temperature;
        request.seed = model.params.seed;
        Ok(request)
    }

    /// One-shot extraction, retried as configured. The returned value has
    /// passed full schema validation.
    #[instrument(level = "debug", skip_all, fields(schema = %schema.key, model = %model.id))]
    pub async fn extract(
        &self,
        content: &str,
        schema: &Schema,
        instructions: &str,
        model: &ModelSpec,
    ) -> Result<FinalExtraction, ExtractionFailure> {
        let request = match self.chat_request(schema, instructions, content, model) {
            Ok(request) => request,
            Err(err) => {
                return Err(ExtractionFailure::new(ErrorKind::Internal, err.to_string()));
            }
        };

        // If we have a transient failure, back off exponentially.
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1..=30_000,
            re_attempts: self.config.retry_attempts.min(u8::MAX as usize) as u8,
            jitter_ratio: 0.2,
        };

        let result = self
            .attempt(schema, &request)
            .await
            .retry_with_async(|_| self.attempt(schema, &request))
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_fatal(|_, fatal_error| {
                error!("extraction failed with error {fatal_error:?}");
            })
            .inspect_recovered(|_, _, retry_errors| {
                warn!(
                    "extraction succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors.len(),
                    keen_retry::loggable_retry_errors(retry_errors),
                );
            })
            .inspect_given_up(|_, retry_errors, fatal_error| {
                error!(
                    "extraction failed after exhausting all {} retry attempts with \
                     error {fatal_error:?}. Previous transient failures: [{}]",
                    retry_errors.len(),
                    keen_retry::loggable_retry_errors(retry_errors),
                );
            });

        match result {
            ResolvedResult::Ok { output, .. }
            | ResolvedResult::Recovered { output, .. } => Ok(output),
            ResolvedResult::Fatal { error, .. } => Err(error.into_failure()),
            ResolvedResult::GivenUp { fatal_error, .. }
            | ResolvedResult::Unrecoverable { fatal_error, .. } => {
                Err(fatal_error.into_failure())
            }
        }
    }

    /// A single provider round trip: call, parse, validate.
    async fn attempt(
        &self,
        schema: &Schema,
        request: &ChatRequest,
    ) -> RetryResult<(), (), FinalExtraction, AttemptError> {
        let outcome: ChatOutcome = try_with_retry_result!(
            match time::timeout(
                self.config.extraction_timeout(),
                self.chat.complete(request)
            )
            .await
            {
                Ok(result) => result.map_err(AttemptError::Provider),
                Err(_) => Err(AttemptError::Timeout),
            }
            .into_retry_result(AttemptError::is_transient)
        );

        let structured: Value = try_with_retry_result!(
            serde_json::from_str(&outcome.content)
                .map_err(|err| {
                    AttemptError::NonJson(format!(
                        "provider returned non-JSON content: {err}"
                    ))
                })
                .into_transient()
        );

        let errors = validate(schema, &structured);
        if errors.is_empty() {
            retry_result_ok(FinalExtraction {
                structured,
                usage: outcome.usage,
            })
        } else {
            let message = validation_failure_message(&schema.name, &errors);
            RetryResult::Transient {
                input: (),
                error: AttemptError::Invalid {
                    message,
                    humanized: humanize_validation_errors(&errors),
                },
            }
        }
    }

    /// Streaming extraction. Yields zero or more `Partial` events followed
    /// by exactly one `Final`. Unlike [`Extractor::extract`], an invalid
    /// final payload is not retried; the partials have already been
    /// forwarded downstream.
    #[instrument(level = "debug", skip_all, fields(schema = %schema.key, model = %model.id))]
    pub fn extract_stream(
        &self,
        content: &str,
        schema: &Schema,
        instructions: &str,
        model: &ModelSpec,
    ) -> BoxedStream<ExtractionEvent> {
        let (tx, rx) = mpsc::channel::<ExtractionEvent>(16);
        let this = self.clone();
        let schema = schema.clone();
        let instructions = instructions.to_string();
        let content = content.to_string();
        let model = model.clone();

        tokio::spawn(async move {
            let final_event = this
                .run_stream(&tx, &content, &schema, &instructions, &model)
                .await;
            // The receiver may be gone (client disconnect); that's fine.
            let _ = tx.send(ExtractionEvent::Final(final_event)).await;
        });

        ReceiverStream::new(rx).boxed()
    }

    async fn run_stream(
        &self,
        tx: &mpsc::Sender<ExtractionEvent>,
        content: &str,
        schema: &Schema,
        instructions: &str,
        model: &ModelSpec,
    ) -> Result<FinalExtraction, ExtractionFailure> {
        let request = self
            .chat_request(schema, instructions, content, model)
            .map_err(|err| ExtractionFailure::new(ErrorKind::Internal, err.to_string()))?;

        let deadline = time::Instant::now() + self.config.extraction_timeout();
        let mut deltas = match self.chat.complete_stream(&request).await {
            Ok(deltas) => deltas,
            Err(err) if err.is_known_transient() => {
                // Establishing the stream failed transiently; fall back to
                // the retried one-shot path.
                debug!(%err, "stream setup failed, falling back to one-shot");
                return self.extract(content, schema, instructions, model).await;
            }
            Err(err) => {
                return Err(AttemptError::Provider(err).into_failure());
            }
        };

        let mut buffer = String::new();
        let mut usage = UsageTotals::default();
        let mut last_partial: Option<Value> = None;

        loop {
            let delta = match time::timeout_at(deadline, deltas.next()).await {
                Ok(Some(delta)) => delta,
                Ok(None) => break,
                Err(_) => {
                    return Err(ExtractionFailure::new(
                        ErrorKind::Timeout,
                        "Extraction timed out mid-stream",
                    ));
                }
            };
            match delta {
                Ok(ChatDelta::Content(chunk)) => {
                    buffer.push_str(&chunk);
                    if let Some(partial) = parse_partial_json(&buffer) {
                        // Don't resend identical snapshots.
                        if last_partial.as_ref() != Some(&partial) {
                            last_partial = Some(partial.clone());
                            let _ = tx
                                .send(ExtractionEvent::Partial { structured: partial })
                                .await;
                        }
                    }
                }
                Ok(ChatDelta::Done { usage: reported }) => {
                    usage += &reported;
                }
                Err(err) => {
                    return Err(AttemptError::Provider(err).into_failure());
                }
            }
        }
        if usage.requests == 0 {
            // The provider didn't report usage for the stream; count the
            // request itself.
            usage.requests = 1;
        }

        let structured: Value = serde_json::from_str(&buffer).map_err(|err| {
            ExtractionFailure::new(
                ErrorKind::ExtractionFailed,
                format!("provider returned non-JSON content: {err}"),
            )
        })?;
        let errors = validate(schema, &structured);
        if errors.is_empty() {
            Ok(FinalExtraction { structured, usage })
        } else {
            Err(ExtractionFailure {
                kind: ErrorKind::ExtractionFailed,
                message: validation_failure_message(&schema.name, &errors),
                humanized: Some(humanize_validation_errors(&errors)),
            })
        }
    }
}

/// Try to parse possibly-incomplete JSON by closing open strings and
/// brackets. Returns `None` when no reasonable completion parses.
pub fn parse_partial_json(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    let completed = complete_json(text)?;
    serde_json::from_str(&completed).ok()
}

/// Close open strings and brackets in a JSON prefix. Trailing separators
/// (`,` or `:`) are patched so the result stays parseable.
fn complete_json(text: &str) -> Option<String> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => stack.push(ch),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }
    if stack.is_empty() && !in_string {
        // Complete already (and presumably failed to parse for another
        // reason); nothing we can fix.
        return None;
    }

    let mut completed = text.to_string();
    if escaped {
        completed.pop();
    }
    if in_string {
        completed.push('"');
    }
    let trimmed = completed.trim_end().to_string();
    let mut completed = trimmed;
    match completed.chars().last() {
        Some(',') => {
            completed.pop();
        }
        Some(':') => completed.push_str(" null"),
        _ => {}
    }
    for open in stack.into_iter().rev() {
        completed.push(match open {
            '{' => '}',
            _ => ']',
        });
    }
    Some(completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        provider::stub::{StubProvider, StubReply},
        schema::SchemaRegistry,
    };

    fn extractor(stub: Arc<StubProvider>) -> Extractor {
        Extractor::new(
            stub,
            AiProcessingConfig {
                max_concurrent_items: 2,
                timeout_per_batch: 10.0,
                retry_attempts: 1,
            },
            String::new(),
        )
    }

    fn model() -> ModelSpec {
        ModelSpec {
            id: "stub".to_string(),
            params: ModelParams::default(),
        }
    }

    fn invoice() -> Arc<Schema> {
        SchemaRegistry::builtin().get("invoice").unwrap()
    }

    #[test]
    fn fallback_prompt_binds_all_parts() {
        let stub = Arc::new(StubProvider::always(json!({})));
        let extractor = extractor(stub);
        let schema = invoice();
        let prompt = extractor
            .assemble_prompt(&schema, "be careful", "# Document")
            .unwrap();
        assert!(prompt.contains(&schema.description));
        assert!(prompt.contains("Invoice schema"));
        assert!(prompt.contains("be careful"));
        assert!(prompt.contains("# Document"));
    }

    #[tokio::test]
    async fn valid_responses_extract_cleanly() {
        let stub = Arc::new(StubProvider::always(
            json!({"vendor": "Acme", "number": "42", "amount": 100.0}),
        ));
        let extractor = extractor(stub.clone());
        let result = extractor
            .extract("doc", &invoice(), "", &model())
            .await
            .unwrap();
        assert_eq!(result.structured["vendor"], "Acme");
        assert!(!result.usage.is_zero());
        assert_eq!(stub.chat_call_count(), 1);
    }

    #[tokio::test]
    async fn invalid_payloads_are_retried_then_fail_humanized() {
        // Every attempt returns a payload missing required fields.
        let stub = Arc::new(StubProvider::always(json!({"vendor": "Acme"})));
        let extractor = extractor(stub.clone());
        let err = extractor
            .extract("doc", &invoice(), "", &model())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExtractionFailed);
        assert!(err.humanized.is_some());
        // The initial attempt plus at least one retry.
        assert!(stub.chat_call_count() >= 2);
    }

    #[tokio::test]
    async fn transient_failure_then_success_recovers() {
        let stub = Arc::new(StubProvider::scripted(
            vec![StubReply::Chunks(vec!["not json".to_string()])],
            StubReply::Value(json!({"vendor": "A", "number": "1", "amount": 5})),
        ));
        let extractor = extractor(stub.clone());
        let result = extractor.extract("doc", &invoice(), "", &model()).await;
        assert!(result.is_ok());
        assert!(stub.chat_call_count() >= 2);
    }

    #[tokio::test]
    async fn streaming_yields_partials_then_final() {
        let stub = Arc::new(StubProvider::scripted(
            vec![StubReply::Chunks(vec![
                r#"{"vendor": "Acme""#.to_string(),
                r#", "number": "42""#.to_string(),
                r#", "amount": 100.0}"#.to_string(),
            ])],
            StubReply::Value(json!({})),
        ));
        let extractor = extractor(stub);
        let events: Vec<_> = extractor
            .extract_stream("doc", &invoice(), "", &model())
            .collect()
            .await;

        let partials = events
            .iter()
            .filter(|e| matches!(e, ExtractionEvent::Partial { .. }))
            .count();
        assert!(partials >= 2, "expected progressive partials, got {partials}");
        match events.last().unwrap() {
            ExtractionEvent::Final(Ok(result)) => {
                assert_eq!(result.structured["amount"], 100.0);
            }
            other => panic!("expected successful final event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn streaming_invalid_final_reports_extraction_failed() {
        let stub = Arc::new(StubProvider::scripted(
            vec![StubReply::Chunks(vec![r#"{"vendor": 7}"#.to_string()])],
            StubReply::Value(json!({})),
        ));
        let extractor = extractor(stub);
        let events: Vec<_> = extractor
            .extract_stream("doc", &invoice(), "", &model())
            .collect()
            .await;
        match events.last().unwrap() {
            ExtractionEvent::Final(Err(failure)) => {
                assert_eq!(failure.kind, ErrorKind::ExtractionFailed);
                assert!(failure.humanized.is_some());
            }
            other => panic!("expected failed final event, got {other:?}"),
        }
    }

    #[test]
    fn partial_json_completion_handles_open_structures() {
        assert_eq!(
            parse_partial_json(r#"{"vendor": "Acme""#),
            Some(json!({"vendor": "Acme"}))
        );
        assert_eq!(
            parse_partial_json(r#"{"vendor": "Ac"#),
            Some(json!({"vendor": "Ac"}))
        );
        assert_eq!(
            parse_partial_json(r#"{"items": [{"a": 1},"#),
            Some(json!({"items": [{"a": 1}]}))
        );
        assert_eq!(
            parse_partial_json(r#"{"vendor":"#),
            Some(json!({"vendor": null}))
        );
        assert_eq!(parse_partial_json("definitely not json"), None);
    }
}
