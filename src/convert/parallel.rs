//! Parallel Markdown conversion over a bounded work queue.

use std::sync::Arc;

use futures::{FutureExt as _, StreamExt as _, stream};
use tokio::time;

use super::{ConversionError, ConversionResult, ConverterSet, FileEntry};
use crate::{
    async_utils::{
        BoxedStream, JoinWorker,
        work::{WorkFn, WorkQueue, WorkQueueHandle},
    },
    config::MarkdownConversionConfig,
    errors::ErrorKind,
    prelude::*,
};

/// Converts batches of files concurrently, preserving ordering metadata.
///
/// The worker-pool size bounds how many conversions run at once; the
/// per-file timeout trips a `timeout` failure for that file without
/// touching the others.
pub struct ParallelConverter {
    handle: WorkQueueHandle<FileEntry, ConversionResult>,
    // Keep the queue alive for as long as the converter exists.
    _queue: WorkQueue<FileEntry, ConversionResult>,
    worker: JoinWorker,
    max_workers: usize,
}

impl ParallelConverter {
    pub fn new(config: &MarkdownConversionConfig, converters: Arc<ConverterSet>) -> Self {
        let timeout = config.timeout();
        let work_fn: WorkFn<FileEntry, ConversionResult> = Arc::new(move |entry| {
            let converters = converters.clone();
            async move {
                match time::timeout(timeout, converters.convert_entry(&entry)).await {
                    Ok(result) => Ok(result),
                    Err(_) => Ok(ConversionResult::failed(
                        entry.clone(),
                        ConversionError::new(
                            ErrorKind::Timeout,
                            format!("Timeout after {} seconds", timeout.as_secs_f64()),
                        ),
                    )),
                }
            }
            .boxed()
        });
        let (queue, worker) = WorkQueue::new(config.max_workers.max(1), work_fn);
        let handle = queue.handle();
        Self {
            handle,
            _queue: queue,
            worker,
            max_workers: config.max_workers.max(1),
        }
    }

    /// Convert entries, yielding `(original_index, result)` in completion
    /// order.
    pub fn convert_stream(
        &self,
        entries: Vec<FileEntry>,
    ) -> BoxedStream<(usize, ConversionResult)> {
        let handle = self.handle.clone();
        stream::iter(entries.into_iter().enumerate())
            .map(move |(index, entry)| {
                let handle = handle.clone();
                async move {
                    let fallback = entry.clone();
                    let result =
                        handle.process_blocking(entry).await.unwrap_or_else(|err| {
                            ConversionResult::failed(
                                fallback,
                                ConversionError::internal(err.to_string()),
                            )
                        });
                    (index, result)
                }
            })
            // The queue enforces the real concurrency limit; this just keeps
            // enough submissions in flight to saturate it.
            .buffer_unordered(self.max_workers * 2)
            .boxed()
    }

    /// Convert entries and return results reordered to the original index.
    pub async fn convert_all(&self, entries: Vec<FileEntry>) -> Vec<ConversionResult> {
        let count = entries.len();
        let mut slots: Vec<Option<ConversionResult>> = (0..count).map(|_| None).collect();
        let mut stream = self.convert_stream(entries);
        while let Some((index, result)) = stream.next().await {
            slots[index] = Some(result);
        }
        slots
            .into_iter()
            .map(|slot| slot.expect("every entry yields exactly one result"))
            .collect()
    }

    /// Shut the pool down and wait for the drainer task.
    pub async fn close(self) -> Result<()> {
        let Self {
            handle,
            _queue,
            worker,
            ..
        } = self;
        drop(handle);
        drop(_queue);
        worker.join().await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::{
        config::Config,
        convert::{audio, pdf, vision},
        provider::stub::StubProvider,
    };

    fn converter(config: &Config) -> ParallelConverter {
        let stub = Arc::new(StubProvider::always(json!({})));
        let set = Arc::new(ConverterSet::new(
            pdf::PdfConverter::new(config.pdf.detection.clone(), Some(stub.clone()), true),
            audio::AudioConverter::new(stub.clone()),
            vision::VisionConverter::new(stub, String::new()),
        ));
        ParallelConverter::new(&config.markdown_conversion, set)
    }

    fn temp_text_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::with_suffix(".txt").unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[tokio::test]
    async fn convert_all_reorders_to_input_order() {
        let config = Config::default();
        let converter = converter(&config);
        let files: Vec<_> = (0..5).map(|i| temp_text_file(&format!("doc {i}"))).collect();
        let entries: Vec<_> = files.iter().map(|f| FileEntry::direct(f.path())).collect();

        let results = converter.convert_all(entries).await;
        assert_eq!(results.len(), 5);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.markdown(), Some(format!("doc {i}").as_str()));
        }
    }

    #[tokio::test]
    async fn failures_do_not_disturb_other_files() {
        let config = Config::default();
        let converter = converter(&config);
        let good = temp_text_file("fine");
        let entries = vec![
            FileEntry::direct(good.path()),
            FileEntry::direct("/nonexistent/data.xyz"),
        ];
        let results = converter.convert_all(entries).await;
        assert!(results[0].is_ok());
        assert_eq!(results[1].error_kind(), Some(ErrorKind::Unsupported));
    }

    #[tokio::test]
    async fn stream_yields_one_item_per_entry() {
        let config = Config::default();
        let converter = converter(&config);
        let files: Vec<_> = (0..3).map(|i| temp_text_file(&format!("n{i}"))).collect();
        let entries: Vec<_> = files.iter().map(|f| FileEntry::direct(f.path())).collect();

        let mut seen = std::collections::BTreeSet::new();
        let mut stream = converter.convert_stream(entries);
        while let Some((index, _result)) = stream.next().await {
            assert!(seen.insert(index));
        }
        assert_eq!(seen.len(), 3);
    }
}
