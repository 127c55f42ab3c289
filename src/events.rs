//! The event vocabulary of a processing run.
//!
//! Every run emits a totally ordered stream of these events: `init` first,
//! then phase transitions interleaved with per-file progress and results,
//! and `complete` strictly last. Field names are a stable wire contract;
//! field presence is extensible.

use crate::{errors::ErrorKind, prelude::*, tokens::UsageTotals};

/// Pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    MarkdownConversion,
    Summarization,
    AiProcessing,
}

/// Phase transition direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Started,
    Completed,
}

/// Running progress counters, attached to every terminal `result`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Files with a terminal outcome so far.
    pub current: usize,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

/// Result status on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
}

/// Per-file summarization numbers, surfaced on results and in `complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizationMetrics {
    pub original_length: usize,
    pub summary_length: usize,
    pub compression_ratio: f64,
}

/// One event on a run's stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Init {
        run_id: String,
        start_timestamp: String,
        total_files: usize,
        schema_key: String,
        schema_name: String,
        schema_fields: Vec<String>,
        model_id: String,
        max_workers: usize,
        max_concurrent_items: usize,
    },

    Phase {
        phase: Phase,
        status: PhaseStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        files_per_second: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        files_to_summarize: Option<usize>,
    },

    ConversionProgress {
        current: usize,
        total: usize,
        filename: String,
        success: bool,
        files_per_second: f64,
    },

    ConversionSummary {
        successful: usize,
        failed: usize,
        failed_files: Vec<String>,
        password_required: Vec<String>,
    },

    /// A non-final extractor update. Never advances progress counters.
    Partial {
        filename: String,
        source_file: String,
        structured_data: Value,
    },

    Result {
        filename: String,
        status: ResultStatus,
        source_file: String,
        is_primary_result: bool,
        progress: Progress,
        #[serde(skip_serializing_if = "Option::is_none")]
        structured_data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_fields: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        markdown_content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        processing_time: Option<f64>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cached: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        was_summarized: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        summarization_metrics: Option<SummarizationMetrics>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_details: Option<Value>,
    },

    Complete {
        run_id: String,
        timestamps: Timestamps,
        total_files: usize,
        successful: usize,
        failed: usize,
        schema_used: String,
        model_id: String,
        token_usage: UsageTotals,
        summarization: SummarizationSummary,
        performance: PerformanceSummary,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Timestamps {
    pub start: String,
    pub end: String,
    pub duration: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummarizationSummary {
    pub files_summarized: usize,
    pub summarization_duration: f64,
    pub token_threshold: usize,
    pub summary_model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    pub total_duration: f64,
    pub conversion_duration: f64,
    pub summarization_duration: f64,
    pub ai_duration: f64,
    pub files_per_second: f64,
}

impl Event {
    /// The `type` tag, for tests and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Init { .. } => "init",
            Event::Phase { .. } => "phase",
            Event::ConversionProgress { .. } => "conversion_progress",
            Event::ConversionSummary { .. } => "conversion_summary",
            Event::Partial { .. } => "partial",
            Event::Result { .. } => "result",
            Event::Complete { .. } => "complete",
        }
    }
}
