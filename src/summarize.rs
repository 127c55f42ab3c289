//! Long-document summarization.
//!
//! Documents whose Markdown exceeds the token threshold are condensed before
//! extraction, with an instruction to preserve everything relevant to the
//! target fields. The original Markdown is never mutated; the orchestrator
//! swaps the summary in for extractor input only.

use std::sync::Arc;

use crate::{
    config::SummarizationConfig,
    prelude::*,
    provider::{ChatProvider, ChatRequest},
    tokens::estimate_tokens,
};

/// The schema we ask the model to fill: a single `summary` string.
fn summary_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": {
                "type": "string",
                "description": "Condensed version of the document preserving all key data points.",
            }
        },
        "additionalProperties": false,
        "required": ["summary"],
    })
}

/// A successful summarization.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryOutcome {
    pub summary: String,
    pub original_length: usize,
    pub summary_length: usize,
    pub compression_ratio: f64,
}

pub struct Summarizer {
    chat: Arc<dyn ChatProvider>,
    config: SummarizationConfig,
    template: String,
}

impl Summarizer {
    /// `template` comes from `prompts.summarization_template`; empty means
    /// use the built-in fallback.
    pub fn new(
        chat: Arc<dyn ChatProvider>,
        config: SummarizationConfig,
        template: String,
    ) -> Self {
        Self {
            chat,
            config,
            template,
        }
    }

    pub fn token_threshold(&self) -> usize {
        self.config.token_threshold
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Does this content exceed the token threshold?
    pub fn should_summarize(&self, markdown: &str) -> bool {
        estimate_tokens(markdown) > self.config.token_threshold
    }

    /// Condense `markdown`, keeping everything relevant to `fields`.
    pub async fn summarize(
        &self,
        markdown: &str,
        fields: &[String],
        file_label: &str,
    ) -> Result<SummaryOutcome> {
        let fields_joined = fields.join(", ");
        let prompt = if self.template.is_empty() {
            format!(
                "Please summarize the following document content.\n\
                 Focus on preserving all information relevant to these fields: {fields_joined}.\n\n\
                 Document content:\n\n{markdown}\n"
            )
        } else {
            let handlebars = handlebars::Handlebars::new();
            handlebars
                .render_template(
                    &self.template,
                    &json!({ "fields": fields_joined, "content": markdown }),
                )
                .context("failed to render summarization template")?
        };

        let mut request = ChatRequest::new(&self.config.model, prompt);
        request.response_schema = Some(summary_schema());
        request.schema_name = "DocumentSummary".to_string();

        let outcome = self
            .chat
            .complete(&request)
            .await
            .map_err(|err| anyhow!("summarization failed for {file_label}: {err}"))?;
        let parsed: Value = serde_json::from_str(&outcome.content)
            .with_context(|| format!("summarizer returned non-JSON for {file_label}"))?;
        let summary = parsed
            .get("summary")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("summarizer response missing `summary` field"))?
            .to_string();

        let original_length = markdown.len();
        let summary_length = summary.len();
        let compression_ratio = if summary_length > 0 {
            original_length as f64 / summary_length as f64
        } else {
            0.0
        };
        info!(
            file = %file_label,
            original_length,
            summary_length,
            compression_ratio = format!("{compression_ratio:.1}"),
            "summarized document"
        );
        Ok(SummaryOutcome {
            summary,
            original_length,
            summary_length,
            compression_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::stub::StubProvider;

    fn summarizer(stub: Arc<StubProvider>, threshold: usize) -> Summarizer {
        Summarizer::new(
            stub,
            SummarizationConfig {
                token_threshold: threshold,
                model: "stub".to_string(),
            },
            String::new(),
        )
    }

    #[test]
    fn threshold_gates_summarization() {
        let stub = Arc::new(StubProvider::always(json!({})));
        let summarizer = summarizer(stub, 5);
        assert!(!summarizer.should_summarize("short"));
        let long = "many words ".repeat(50);
        assert!(summarizer.should_summarize(&long));
    }

    #[tokio::test]
    async fn summary_carries_compression_metrics() {
        let stub = Arc::new(StubProvider::always(json!({"summary": "tiny"})));
        let summarizer = summarizer(stub, 5);
        let original = "long document contents ".repeat(20);
        let outcome = summarizer
            .summarize(&original, &["vendor".to_string()], "doc.txt")
            .await
            .unwrap();
        assert_eq!(outcome.summary, "tiny");
        assert_eq!(outcome.original_length, original.len());
        assert!(outcome.compression_ratio > 1.0);
    }

    #[tokio::test]
    async fn provider_failure_surfaces_as_error() {
        let stub = Arc::new(StubProvider::scripted(
            vec![crate::provider::stub::StubReply::Fail("down".to_string())],
            crate::provider::stub::StubReply::Value(json!({})),
        ));
        let summarizer = summarizer(stub, 5);
        assert!(summarizer
            .summarize("content", &[], "doc.txt")
            .await
            .is_err());
    }
}
