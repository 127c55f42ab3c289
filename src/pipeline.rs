//! The streaming orchestrator.
//!
//! One call to [`Engine::process`] runs the whole pipeline for a batch of
//! files and yields the run's event stream: archive expansion, parallel
//! conversion, summarization where needed, bounded-concurrency extraction
//! with optional partial forwarding, nested-schema expansion, and
//! finalization. The stream is totally ordered; `init` is first and
//! `complete` is strictly last.
//!
//! If the consumer goes away mid-run, upstream work is abandoned
//! cooperatively, but the ledger still gets a terminal `failed` row and the
//! upload files are still handed to the lifecycle manager for aged cleanup.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt as _;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::{
    archive,
    async_utils::BoxedStream,
    convert::{ConversionResult, FileEntry},
    dispatch::{DispatchEvent, ExtractionTask},
    engine::Engine,
    errors::ErrorKind,
    events::{
        Event, Phase, PhaseStatus, PerformanceSummary, Progress, ResultStatus,
        SummarizationMetrics, SummarizationSummary, Timestamps,
    },
    extract::ModelSpec,
    ledger::{RunCompletion, RunStart, RunStatus},
    prelude::*,
    schema::{OutputShape, Schema},
    tokens::UsageTracker,
};

/// A request to process one batch of files.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub files: Vec<FileEntry>,
    pub schema_key: String,
    pub instructions: String,
    /// Model override; defaults to `structured_analysis.default_model`.
    pub model_id: Option<String>,
    /// Run id override; defaults to a fresh UUIDv4.
    pub run_id: Option<String>,
}

/// Why a process call was rejected before any work started.
#[derive(Debug)]
pub struct ProcessRejected {
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for ProcessRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProcessRejected {}

/// Raised (as a value) when the event consumer goes away.
struct Disconnected;

type EmitResult = std::result::Result<(), Disconnected>;

struct Emitter {
    tx: mpsc::Sender<Event>,
}

impl Emitter {
    async fn send(&self, event: Event) -> EmitResult {
        self.tx.send(event).await.map_err(|_| Disconnected)
    }
}

impl Engine {
    /// Run the pipeline, returning the run's event stream.
    ///
    /// Schema and model resolution happen before any work starts, so an
    /// unknown schema key fails the call instead of producing a broken
    /// stream.
    pub fn process(
        self: &Arc<Self>,
        request: ProcessRequest,
    ) -> std::result::Result<BoxedStream<Event>, ProcessRejected> {
        let schema = self.registry.get(&request.schema_key).ok_or_else(|| {
            ProcessRejected {
                kind: ErrorKind::InvalidSchemaKey,
                message: format!(
                    "Schema '{}' not found. Available schemas: {}",
                    request.schema_key,
                    self.registry
                        .list()
                        .iter()
                        .map(|s| s.key.clone())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            }
        })?;
        let model_id = request
            .model_id
            .clone()
            .unwrap_or_else(|| self.config.structured_analysis.default_model.clone());
        let model = ModelSpec {
            params: self.config.model_params(&model_id),
            id: model_id,
        };

        let (tx, rx) = mpsc::channel::<Event>(64);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let run = PipelineRun {
                engine,
                schema,
                model,
                instructions: request.instructions.clone(),
                run_id: request
                    .run_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            };
            run.execute(request.files, Emitter { tx }).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

struct PipelineRun {
    engine: Arc<Engine>,
    schema: Arc<Schema>,
    model: ModelSpec,
    instructions: String,
    run_id: String,
}

impl PipelineRun {
    async fn execute(self, input_files: Vec<FileEntry>, emitter: Emitter) {
        let started_at = Instant::now();
        let start_timestamp = Utc::now();

        // Expand archives before anything else; the ZIP itself contributes
        // no entries of its own.
        let mut files: Vec<FileEntry> = Vec::new();
        let mut extract_roots = Vec::new();
        for entry in input_files.iter() {
            if archive::is_zip_file(&entry.file_name()) {
                let expanded = archive::expand_zip(
                    &entry.path,
                    &entry.display_name,
                    &self.engine.config.paths.temp_extract_dir,
                )
                .await;
                files.extend(expanded.entries);
                extract_roots.extend(expanded.temp_dirs);
            } else {
                files.push(entry.clone());
            }
        }
        let total_files = files.len();
        info!(
            run_id = %self.run_id,
            total_files,
            schema = %self.schema.key,
            model = %self.model.id,
            "starting processing run"
        );

        self.engine
            .ledger
            .insert_run_start(RunStart {
                run_id: self.run_id.clone(),
                start_timestamp,
                total_files,
                schema_key: self.schema.key.clone(),
                schema_name: self.schema.name.clone(),
                model_id: self.model.id.clone(),
                instructions: if self.instructions.is_empty() {
                    None
                } else {
                    Some(self.instructions.clone())
                },
            })
            .await;

        // Track every file for the run; uploads stay tracked for aged
        // cleanup after the stream ends.
        let upload_paths: Vec<PathBuf> =
            input_files.iter().map(|entry| entry.path.clone()).collect();
        let all_paths: Vec<PathBuf> = upload_paths
            .iter()
            .cloned()
            .chain(files.iter().map(|entry| entry.path.clone()))
            .collect();
        let batch_guard = self.engine.lifecycle.batch_guard(all_paths);

        let usage = Arc::new(UsageTracker::new());
        let finalized = Arc::new(AtomicBool::new(false));
        let guard = RunGuard {
            engine: self.engine.clone(),
            run_id: self.run_id.clone(),
            started_at,
            upload_paths: upload_paths.clone(),
            usage: usage.clone(),
            finalized: finalized.clone(),
        };

        match self
            .run_phases(files, total_files, start_timestamp, started_at, &usage, &emitter)
            .await
        {
            Ok(()) => {
                finalized.store(true, Ordering::SeqCst);
                self.engine.lifecycle.mark_stream_complete(&upload_paths);
            }
            Err(Disconnected) => {
                warn!(run_id = %self.run_id, "client disconnected mid-run");
                // RunGuard writes the failed ledger row on drop.
            }
        }
        drop(guard);
        drop(batch_guard);
        drop(extract_roots);
    }

    async fn run_phases(
        &self,
        files: Vec<FileEntry>,
        total_files: usize,
        start_timestamp: chrono::DateTime<Utc>,
        started_at: Instant,
        usage: &Arc<UsageTracker>,
        emitter: &Emitter,
    ) -> EmitResult {
        emitter
            .send(Event::Init {
                run_id: self.run_id.clone(),
                start_timestamp: start_timestamp.to_rfc3339(),
                total_files,
                schema_key: self.schema.key.clone(),
                schema_name: self.schema.name.clone(),
                schema_fields: self.schema.field_names(),
                model_id: self.model.id.clone(),
                max_workers: self.engine.config.markdown_conversion.max_workers,
                max_concurrent_items: self
                    .engine
                    .config
                    .ai_processing
                    .max_concurrent_items,
            })
            .await?;

        if total_files == 0 {
            return self
                .finish(
                    total_files,
                    0,
                    0,
                    0,
                    0.0,
                    0.0,
                    0.0,
                    start_timestamp,
                    started_at,
                    usage,
                    emitter,
                )
                .await;
        }

        // Phase 1: parallel conversion, progress in completion order.
        let conversion_started = Instant::now();
        emitter
            .send(Event::Phase {
                phase: Phase::MarkdownConversion,
                status: PhaseStatus::Started,
                duration: None,
                files_per_second: None,
                files_to_summarize: None,
            })
            .await?;

        let mut results: Vec<Option<ConversionResult>> =
            (0..total_files).map(|_| None).collect();
        {
            let mut conversion_stream = self.engine.converter.convert_stream(files);
            let mut completed = 0usize;
            while let Some((index, result)) = conversion_stream.next().await {
                completed += 1;
                let elapsed = conversion_started.elapsed().as_secs_f64();
                emitter
                    .send(Event::ConversionProgress {
                        current: completed,
                        total: total_files,
                        filename: result.file_entry.display_name.clone(),
                        success: result.is_ok(),
                        files_per_second: if elapsed > 0.0 {
                            (completed as f64 / elapsed * 100.0).round() / 100.0
                        } else {
                            0.0
                        },
                    })
                    .await?;
                results[index] = Some(result);
            }
        }
        let conversion_duration = conversion_started.elapsed().as_secs_f64();
        emitter
            .send(Event::Phase {
                phase: Phase::MarkdownConversion,
                status: PhaseStatus::Completed,
                duration: Some(conversion_duration),
                files_per_second: Some(if conversion_duration > 0.0 {
                    total_files as f64 / conversion_duration
                } else {
                    0.0
                }),
                files_to_summarize: None,
            })
            .await?;

        // Partition conversions.
        let mut converted: Vec<ConvertedItem> = Vec::new();
        let mut failed_conversions: Vec<ConversionResult> = Vec::new();
        for result in results.into_iter().flatten() {
            match &result.outcome {
                Ok(markdown) if !markdown.is_empty() => converted.push(ConvertedItem {
                    file_entry: result.file_entry.clone(),
                    original_markdown: markdown.clone(),
                    extractor_input: markdown.clone(),
                    was_summarized: false,
                    summarization_metrics: None,
                }),
                Ok(_) => failed_conversions.push(ConversionResult::failed(
                    result.file_entry.clone(),
                    crate::convert::ConversionError::internal(
                        "Conversion produced no content",
                    ),
                )),
                Err(_) => failed_conversions.push(result),
            }
        }

        let password_required: Vec<String> = failed_conversions
            .iter()
            .filter(|result| result.error_kind() == Some(ErrorKind::PasswordRequired))
            .map(|result| result.file_entry.display_name.clone())
            .collect();
        emitter
            .send(Event::ConversionSummary {
                successful: converted.len(),
                failed: failed_conversions.len(),
                failed_files: failed_conversions
                    .iter()
                    .map(|result| result.file_entry.display_name.clone())
                    .collect(),
                password_required,
            })
            .await?;

        // Phase 2: summarization, only when something crossed the threshold.
        let mut summarization_duration = 0.0;
        let mut files_summarized = 0usize;
        let needing_summary: Vec<usize> = converted
            .iter()
            .enumerate()
            .filter(|(_, item)| {
                self.engine.summarizer.should_summarize(&item.original_markdown)
            })
            .map(|(index, _)| index)
            .collect();
        if !needing_summary.is_empty() {
            let summarization_started = Instant::now();
            emitter
                .send(Event::Phase {
                    phase: Phase::Summarization,
                    status: PhaseStatus::Started,
                    duration: None,
                    files_per_second: None,
                    files_to_summarize: Some(needing_summary.len()),
                })
                .await?;
            let field_names = self.schema.field_names();
            for index in needing_summary {
                let item = &mut converted[index];
                match self
                    .engine
                    .summarizer
                    .summarize(
                        &item.original_markdown,
                        &field_names,
                        &item.file_entry.display_name,
                    )
                    .await
                {
                    Ok(outcome) => {
                        item.extractor_input = outcome.summary.clone();
                        item.was_summarized = true;
                        item.summarization_metrics = Some(SummarizationMetrics {
                            original_length: outcome.original_length,
                            summary_length: outcome.summary_length,
                            compression_ratio: outcome.compression_ratio,
                        });
                        files_summarized += 1;
                    }
                    Err(err) => {
                        // Fall back to the original content.
                        warn!(
                            file = %item.file_entry.display_name,
                            %err,
                            "summarization failed, using original content"
                        );
                    }
                }
            }
            summarization_duration = summarization_started.elapsed().as_secs_f64();
            emitter
                .send(Event::Phase {
                    phase: Phase::Summarization,
                    status: PhaseStatus::Completed,
                    duration: Some(summarization_duration),
                    files_per_second: None,
                    files_to_summarize: None,
                })
                .await?;
        }

        // Phase 3: extraction. The phase pair is emitted even when nothing
        // converted, so clients always see the full phase sequence.
        let ai_started = Instant::now();
        emitter
            .send(Event::Phase {
                phase: Phase::AiProcessing,
                status: PhaseStatus::Started,
                duration: None,
                files_per_second: None,
                files_to_summarize: None,
            })
            .await?;

        let mut terminal_files = 0usize;
        let mut successful_files = 0usize;
        let mut failed_files = 0usize;

        if !converted.is_empty() {
            let tasks: Vec<ExtractionTask> = converted
                .iter()
                .enumerate()
                .map(|(index, item)| ExtractionTask {
                    task_index: index,
                    file_entry: item.file_entry.clone(),
                    content: item.extractor_input.clone(),
                    schema: self.schema.clone(),
                    instructions: self.instructions.clone(),
                    model: self.model.clone(),
                })
                .collect();

            let mut dispatch_stream =
                self.engine.dispatcher.dispatch_stream(tasks, usage.clone());
            while let Some(event) = dispatch_stream.next().await {
                match event {
                    DispatchEvent::Partial {
                        task_index,
                        structured,
                    } => {
                        let item = &converted[task_index];
                        emitter
                            .send(Event::Partial {
                                filename: item.file_entry.display_name.clone(),
                                source_file: item.file_entry.display_name.clone(),
                                structured_data: structured,
                            })
                            .await?;
                    }
                    DispatchEvent::Final {
                        task_index,
                        outcome,
                        processing_time,
                        cached,
                    } => {
                        terminal_files += 1;
                        let item = &converted[task_index];
                        match outcome {
                            Ok(outcome) => {
                                successful_files += 1;
                                self.emit_success(
                                    item,
                                    outcome.structured,
                                    processing_time,
                                    cached,
                                    Progress {
                                        current: terminal_files,
                                        total: total_files,
                                        successful: successful_files,
                                        failed: failed_files
                                            + failed_conversions.len(),
                                    },
                                    emitter,
                                )
                                .await?;
                            }
                            Err(failure) => {
                                failed_files += 1;
                                emitter
                                    .send(Event::Result {
                                        filename: item
                                            .file_entry
                                            .display_name
                                            .clone(),
                                        status: ResultStatus::Error,
                                        source_file: item
                                            .file_entry
                                            .display_name
                                            .clone(),
                                        is_primary_result: true,
                                        progress: Progress {
                                            current: terminal_files,
                                            total: total_files,
                                            successful: successful_files,
                                            failed: failed_files
                                                + failed_conversions.len(),
                                        },
                                        structured_data: None,
                                        model_fields: None,
                                        markdown_content: Some(
                                            item.original_markdown.clone(),
                                        ),
                                        processing_time: Some(processing_time),
                                        cached: false,
                                        was_summarized: item.was_summarized,
                                        summarization_metrics: item
                                            .summarization_metrics
                                            .clone(),
                                        error: Some(failure.message.clone()),
                                        error_kind: Some(failure.kind),
                                        error_details: failure
                                            .humanized
                                            .as_ref()
                                            .map(|h| {
                                                serde_json::to_value(h)
                                                    .unwrap_or(Value::Null)
                                            }),
                                    })
                                    .await?;
                            }
                        }
                    }
                }
            }
        }
        let ai_duration = ai_started.elapsed().as_secs_f64();
        emitter
            .send(Event::Phase {
                phase: Phase::AiProcessing,
                status: PhaseStatus::Completed,
                duration: Some(ai_duration),
                files_per_second: Some(if ai_duration > 0.0 {
                    converted.len() as f64 / ai_duration
                } else {
                    0.0
                }),
                files_to_summarize: None,
            })
            .await?;

        // Terminal results for conversion failures flush after the AI phase.
        let failed_total = failed_files + failed_conversions.len();
        for result in &failed_conversions {
            terminal_files += 1;
            let error = result
                .outcome
                .as_ref()
                .err()
                .cloned()
                .unwrap_or_else(|| {
                    crate::convert::ConversionError::internal("unknown error")
                });
            emitter
                .send(Event::Result {
                    filename: result.file_entry.display_name.clone(),
                    status: ResultStatus::Error,
                    source_file: result.file_entry.display_name.clone(),
                    is_primary_result: true,
                    progress: Progress {
                        current: terminal_files,
                        total: total_files,
                        successful: successful_files,
                        failed: failed_total,
                    },
                    structured_data: None,
                    model_fields: None,
                    markdown_content: None,
                    processing_time: None,
                    cached: false,
                    was_summarized: false,
                    summarization_metrics: None,
                    error: Some(error.message.clone()),
                    error_kind: Some(error.kind),
                    error_details: None,
                })
                .await?;
        }

        self.finish(
            total_files,
            successful_files,
            failed_total,
            files_summarized,
            conversion_duration,
            summarization_duration,
            ai_duration,
            start_timestamp,
            started_at,
            usage,
            emitter,
        )
        .await
    }

    /// Emit the terminal `result` event(s) for a successful extraction,
    /// expanding nested schemas into one event per item. Progress counters
    /// advance once per source file, not per expanded row.
    async fn emit_success(
        &self,
        item: &ConvertedItem,
        structured: Value,
        processing_time: f64,
        cached: bool,
        progress: Progress,
        emitter: &Emitter,
    ) -> EmitResult {
        let rows: Vec<(Value, bool)> = match self.schema.output_shape() {
            OutputShape::Nested => match structured.get("item").and_then(Value::as_array)
            {
                Some(items) if !items.is_empty() => items
                    .iter()
                    .enumerate()
                    .map(|(index, row)| (row.clone(), index == 0))
                    .collect(),
                // An empty item list still produces the file's one primary
                // result, carrying the empty wrapper.
                _ => vec![(structured.clone(), true)],
            },
            OutputShape::Flat => vec![(structured, true)],
        };

        for (row, is_primary) in rows {
            let model_fields: Vec<String> = match row.as_object() {
                Some(object) => object.keys().cloned().collect(),
                None => Vec::new(),
            };
            emitter
                .send(Event::Result {
                    filename: item.file_entry.display_name.clone(),
                    status: ResultStatus::Success,
                    source_file: item.file_entry.display_name.clone(),
                    is_primary_result: is_primary,
                    progress: progress.clone(),
                    structured_data: Some(row),
                    model_fields: Some(model_fields),
                    markdown_content: Some(item.original_markdown.clone()),
                    processing_time: Some(processing_time),
                    cached,
                    was_summarized: item.was_summarized,
                    summarization_metrics: item.summarization_metrics.clone(),
                    error: None,
                    error_kind: None,
                    error_details: None,
                })
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        total_files: usize,
        successful: usize,
        failed: usize,
        files_summarized: usize,
        conversion_duration: f64,
        summarization_duration: f64,
        ai_duration: f64,
        start_timestamp: chrono::DateTime<Utc>,
        started_at: Instant,
        usage: &Arc<UsageTracker>,
        emitter: &Emitter,
    ) -> EmitResult {
        let end_timestamp = Utc::now();
        let total_duration = started_at.elapsed().as_secs_f64();
        let usage = usage.totals();

        emitter
            .send(Event::Complete {
                run_id: self.run_id.clone(),
                timestamps: Timestamps {
                    start: start_timestamp.to_rfc3339(),
                    end: end_timestamp.to_rfc3339(),
                    duration: total_duration,
                },
                total_files,
                successful,
                failed,
                schema_used: self.schema.key.clone(),
                model_id: self.model.id.clone(),
                token_usage: usage.clone(),
                summarization: SummarizationSummary {
                    files_summarized,
                    summarization_duration,
                    token_threshold: self.engine.summarizer.token_threshold(),
                    summary_model: self.engine.summarizer.model().to_string(),
                },
                performance: PerformanceSummary {
                    total_duration,
                    conversion_duration,
                    summarization_duration,
                    ai_duration,
                    files_per_second: if total_duration > 0.0 {
                        total_files as f64 / total_duration
                    } else {
                        0.0
                    },
                },
            })
            .await?;

        self.engine
            .ledger
            .update_run_complete(RunCompletion {
                run_id: self.run_id.clone(),
                end_timestamp,
                duration_seconds: total_duration,
                successful_files: successful,
                failed_files: failed,
                usage,
                status: RunStatus::Completed,
            })
            .await;
        info!(
            run_id = %self.run_id,
            total_files,
            successful,
            failed,
            duration = format!("{total_duration:.2}s"),
            "run complete"
        );
        Ok(())
    }
}

/// One successfully converted file, carrying both the display Markdown and
/// the (possibly summarized) extractor input.
struct ConvertedItem {
    file_entry: FileEntry,
    original_markdown: String,
    extractor_input: String,
    was_summarized: bool,
    summarization_metrics: Option<SummarizationMetrics>,
}

/// Ensures the ledger reaches a terminal state even when the consumer goes
/// away mid-run.
struct RunGuard {
    engine: Arc<Engine>,
    run_id: String,
    started_at: Instant,
    upload_paths: Vec<PathBuf>,
    usage: Arc<UsageTracker>,
    finalized: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.finalized.load(Ordering::SeqCst) {
            return;
        }
        let engine = self.engine.clone();
        let run_id = self.run_id.clone();
        let duration = self.started_at.elapsed().as_secs_f64();
        let upload_paths = self.upload_paths.clone();
        engine.lifecycle.mark_stream_complete(&upload_paths);
        let usage = self.usage.totals();
        tokio::spawn(async move {
            engine
                .ledger
                .update_run_complete(RunCompletion {
                    run_id,
                    end_timestamp: Utc::now(),
                    duration_seconds: duration,
                    successful_files: 0,
                    failed_files: 0,
                    usage,
                    status: RunStatus::Failed,
                })
                .await;
        });
    }
}
