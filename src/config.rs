//! Engine configuration.
//!
//! Loaded from a TOML file at startup; every knob has a default so an empty
//! file (or no file) gives a working engine. String values support
//! `${NAME}` and `${NAME:-default}` environment substitution, applied to the
//! raw file before parsing.

use std::sync::OnceLock;
use std::time::Duration;

use regex::{Captures, Regex};

use crate::prelude::*;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub markdown_conversion: MarkdownConversionConfig,
    pub ai_processing: AiProcessingConfig,
    pub structured_analysis: StructuredAnalysisConfig,
    pub summarization: SummarizationConfig,
    pub result_cache: ResultCacheConfig,
    pub file_management: FileManagementConfig,
    pub database: DatabaseConfig,
    pub pdf: PdfConfig,
    pub ocr: OcrConfig,
    pub paths: PathsConfig,
    pub prompts: PromptsConfig,
}

impl Config {
    /// Load configuration from a TOML file, substituting environment
    /// variables first.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        Self::parse(&raw)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw);
        toml::from_str(&substituted).context("failed to parse config")
    }

    /// Per-model chat parameters, if configured.
    pub fn model_params(&self, model_id: &str) -> ModelParams {
        self.structured_analysis
            .models
            .get(model_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Replace `${NAME}` and `${NAME:-default}` with environment values. An
/// unset variable without a default substitutes the empty string, matching
/// shell semantics closely enough for config files.
pub fn substitute_env_vars(raw: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env substitution pattern should be valid")
    });
    pattern
        .replace_all(raw, |caps: &Captures<'_>| {
            match std::env::var(&caps[1]) {
                Ok(value) => value,
                Err(_) => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Converter worker pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarkdownConversionConfig {
    /// Converter pool size.
    pub max_workers: usize,

    /// How conversion work is scheduled.
    pub worker_kind: WorkerKind,

    /// Per-file conversion timeout, seconds.
    pub timeout_per_file: f64,
}

impl Default for MarkdownConversionConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().min(10).max(1),
            worker_kind: WorkerKind::Thread,
            timeout_per_file: 30.0,
        }
    }
}

impl MarkdownConversionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_per_file)
    }
}

/// Worker scheduling for conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Run adapters on the blocking thread pool.
    Thread,
    /// Accepted for compatibility; the command-line converters already run
    /// in their own OS processes, so this schedules like `thread`.
    Process,
}

/// Extraction fan-out.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AiProcessingConfig {
    /// Ceiling on outstanding extractor calls.
    pub max_concurrent_items: usize,

    /// Per-extraction timeout, seconds. The name is historical; it applies
    /// to individual items.
    pub timeout_per_batch: f64,

    /// Provider retry ceiling for transient failures.
    pub retry_attempts: usize,
}

impl Default for AiProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_items: 10,
            timeout_per_batch: 300.0,
            retry_attempts: 3,
        }
    }
}

impl AiProcessingConfig {
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_per_batch)
    }
}

/// Structured extraction settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StructuredAnalysisConfig {
    /// Model used when the request doesn't name one.
    pub default_model: String,

    pub streaming: StreamingConfig,

    /// Per-model chat parameters, keyed by model id.
    pub models: std::collections::BTreeMap<String, ModelParams>,
}

impl Default for StructuredAnalysisConfig {
    fn default() -> Self {
        Self {
            default_model: "gpt-4o".to_string(),
            streaming: StreamingConfig::default(),
            models: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamingConfig {
    /// Forward partial structured output to the client as it arrives.
    pub enable_partial: bool,
}

/// The only model parameters we pass through.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelParams {
    pub temperature: Option<f32>,
    pub seed: Option<i64>,
}

/// Long-document summarization.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SummarizationConfig {
    /// Tokens above which a document is summarized before extraction.
    pub token_threshold: usize,

    /// Model used for summarization.
    pub model: String,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            token_threshold: 200_000,
            model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Result cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResultCacheConfig {
    pub enabled: bool,

    /// Entry lifetime in hours. `0` keeps entries effectively forever; turn
    /// the cache off with `enabled = false` instead.
    pub ttl_hours: f64,

    /// Oldest-first eviction trigger.
    pub max_entries: usize,

    /// Background sweep interval, hours.
    pub cleanup_interval_hours: f64,

    pub hash_algorithm: HashAlgorithm,

    /// Upper bound on a serialized cached value.
    pub max_entry_size_bytes: usize,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_hours: 24.0,
            max_entries: 10_000,
            cleanup_interval_hours: 6.0,
            hash_algorithm: HashAlgorithm::Sha256,
            max_entry_size_bytes: 1_048_576,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha1,
    Md5,
}

/// Upload retention.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileManagementConfig {
    pub cleanup_strategy: CleanupStrategy,

    /// Max age in seconds before a file becomes eligible for deletion.
    pub max_file_retention: f64,

    /// Sweep interval, seconds.
    pub cleanup_check_interval: f64,
}

impl Default for FileManagementConfig {
    fn default() -> Self {
        Self {
            cleanup_strategy: CleanupStrategy::StreamComplete,
            max_file_retention: 300.0,
            cleanup_check_interval: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStrategy {
    /// Delete as soon as the reference count drops to zero.
    ReferenceCounting,
    /// Let files age out after streaming completes, so review sessions can
    /// still copy them.
    StreamComplete,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub processing_logs: ProcessingLogsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingLogsConfig {
    pub enabled: bool,

    /// SQLite file holding the run ledger (and, by default, the result
    /// cache).
    pub path: PathBuf,
}

impl Default for ProcessingLogsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("data/processing_logs.db"),
        }
    }
}

/// PDF routing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PdfConfig {
    pub detection: PdfDetectionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PdfDetectionConfig {
    /// Non-whitespace characters a page needs to count as a text page.
    pub min_chars_per_page: usize,

    /// Share of text pages (percent) at or above which we use plain text
    /// extraction instead of OCR.
    pub text_page_threshold_percent: f64,
}

impl Default for PdfDetectionConfig {
    fn default() -> Self {
        Self {
            min_chars_per_page: 50,
            text_page_threshold_percent: 70.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OcrConfig {
    /// Whether scanned PDFs may be routed to the OCR provider.
    pub enabled: bool,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// On-disk layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Raw client uploads.
    pub uploads_dir: PathBuf,

    /// ZIP expansion roots.
    pub temp_extract_dir: PathBuf,

    /// Extra schema TOML files.
    pub schemas_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("data/uploads"),
            temp_extract_dir: PathBuf::from("data/temp_extract"),
            schemas_dir: PathBuf::from("schemas"),
        }
    }
}

/// Prompt templates. Handlebars syntax; empty string means "use the built-in
/// fallback".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PromptsConfig {
    /// Binds `schema_description`, `schema_name`, `instructions`, `content`.
    pub analysis_template: String,

    /// Binds `fields` and `content`.
    pub summarization_template: String,

    /// Sent to the vision provider alongside images.
    pub vision_prompt: String,
}
