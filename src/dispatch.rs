//! Direct item dispatch: semaphore-bounded extraction fan-out.
//!
//! Items are processed immediately as they become available instead of being
//! collected into batches; the semaphore bounds outstanding extractor calls,
//! not worker tasks. Each item checks the result cache first, records its
//! token estimate, runs the (possibly streaming) extractor, caches a
//! successful final value, and folds usage into the run totals. Whatever
//! happens, exactly one terminal event comes out per task.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt as _;
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    async_utils::BoxedStream,
    cache::ResultCache,
    convert::FileEntry,
    errors::ErrorKind,
    extract::{ExtractionEvent, ExtractionFailure, Extractor, ModelSpec},
    prelude::*,
    schema::Schema,
    tokens::{UsageTracker, UsageTotals},
};

/// One unit of extraction work.
#[derive(Clone)]
pub struct ExtractionTask {
    /// Index into the run's task list, for correlating events.
    pub task_index: usize,

    pub file_entry: FileEntry,

    /// Extractor input: the converted Markdown, or its summary.
    pub content: String,

    pub schema: Arc<Schema>,
    pub instructions: String,
    pub model: ModelSpec,
}

/// The terminal payload of a dispatched task.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub structured: Value,
    pub usage: UsageTotals,
}

/// Events from the dispatcher, correlated by task index.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// A partial update; never advances counters.
    Partial { task_index: usize, structured: Value },

    /// The terminal outcome for one task.
    Final {
        task_index: usize,
        outcome: Result<DispatchOutcome, ExtractionFailure>,
        processing_time: f64,
        cached: bool,
    },
}

pub struct Dispatcher {
    semaphore: Arc<Semaphore>,
    extractor: Extractor,
    cache: Arc<ResultCache>,
    enable_partial: bool,
}

impl Dispatcher {
    pub fn new(
        max_concurrent_items: usize,
        extractor: Extractor,
        cache: Arc<ResultCache>,
        enable_partial: bool,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_items.max(1))),
            extractor,
            cache,
            enable_partial,
        }
    }

    /// Fan the tasks out and stream events back in completion order. Partial
    /// events for a task always precede its terminal event. Usage folds into
    /// `usage`, which belongs to the run, not the dispatcher; the semaphore
    /// is shared across runs.
    pub fn dispatch_stream(
        self: &Arc<Self>,
        tasks: Vec<ExtractionTask>,
        usage: Arc<UsageTracker>,
    ) -> BoxedStream<DispatchEvent> {
        let (tx, rx) = mpsc::channel::<DispatchEvent>(32);
        for task in tasks {
            let dispatcher = Arc::clone(self);
            let tx = tx.clone();
            let usage = usage.clone();
            tokio::spawn(async move {
                dispatcher.run_task(task, tx, usage).await;
            });
        }
        // Dropping the last sender closes the stream once all tasks finish.
        drop(tx);
        ReceiverStream::new(rx).boxed()
    }

    async fn run_task(
        &self,
        task: ExtractionTask,
        tx: mpsc::Sender<DispatchEvent>,
        usage: Arc<UsageTracker>,
    ) {
        let task_index = task.task_index;
        let started = Instant::now();

        // A closed semaphore can't happen here; coerce anyway rather than
        // panic across the boundary.
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let _ = tx
                    .send(DispatchEvent::Final {
                        task_index,
                        outcome: Err(ExtractionFailure {
                            kind: ErrorKind::Internal,
                            message: "dispatcher is shutting down".to_string(),
                            humanized: None,
                        }),
                        processing_time: started.elapsed().as_secs_f64(),
                        cached: false,
                    })
                    .await;
                return;
            }
        };
        debug!(
            file = %task.file_entry.display_name,
            available = self.semaphore.available_permits(),
            "acquired extraction permit"
        );

        // Cache first: a hit costs no tokens and returns immediately.
        if let Some(cached) = self
            .cache
            .get(&task.content, &task.schema.key, &task.model.id)
            .await
        {
            info!(file = %task.file_entry.display_name, "cache hit");
            usage.record_usage(&UsageTotals::for_cache_hit());
            let _ = tx
                .send(DispatchEvent::Final {
                    task_index,
                    outcome: Ok(DispatchOutcome {
                        structured: cached,
                        usage: UsageTotals::default(),
                    }),
                    processing_time: started.elapsed().as_secs_f64(),
                    cached: true,
                })
                .await;
            return;
        }

        usage.record_estimate(&task.file_entry.display_name, &task.content);

        let outcome = if self.enable_partial {
            self.run_streaming(&task, &tx).await
        } else {
            self.extractor
                .extract(&task.content, &task.schema, &task.instructions, &task.model)
                .await
                .map(|final_extraction| DispatchOutcome {
                    structured: final_extraction.structured,
                    usage: final_extraction.usage,
                })
        };

        let processing_time = started.elapsed().as_secs_f64();
        if let Ok(outcome) = &outcome {
            usage.record_usage(&outcome.usage);
            self.cache
                .set(
                    &task.content,
                    &task.schema.key,
                    &task.model.id,
                    &outcome.structured,
                    processing_time,
                )
                .await;
        }
        let _ = tx
            .send(DispatchEvent::Final {
                task_index,
                outcome,
                processing_time,
                cached: false,
            })
            .await;
    }

    /// Consume the extractor's stream, forwarding partials.
    async fn run_streaming(
        &self,
        task: &ExtractionTask,
        tx: &mpsc::Sender<DispatchEvent>,
    ) -> Result<DispatchOutcome, ExtractionFailure> {
        let mut events = self.extractor.extract_stream(
            &task.content,
            &task.schema,
            &task.instructions,
            &task.model,
        );
        while let Some(event) = events.next().await {
            match event {
                ExtractionEvent::Partial { structured } => {
                    let _ = tx
                        .send(DispatchEvent::Partial {
                            task_index: task.task_index,
                            structured,
                        })
                        .await;
                }
                ExtractionEvent::Final(result) => {
                    return result.map(|final_extraction| DispatchOutcome {
                        structured: final_extraction.structured,
                        usage: final_extraction.usage,
                    });
                }
            }
        }
        // The extractor stream always ends with a final event; an empty
        // stream means the task died.
        Err(ExtractionFailure {
            kind: ErrorKind::Internal,
            message: "extractor stream ended without a final event".to_string(),
            humanized: None,
        })
    }
}
