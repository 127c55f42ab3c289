//! The engine: every long-lived component, constructed once at startup and
//! passed around explicitly. `start` owns the background sweepers; `stop`
//! shuts them down.

use std::sync::{Arc, Mutex};

use crate::{
    async_utils::JoinWorker,
    cache::ResultCache,
    config::Config,
    convert::{ConverterSet, audio, parallel::ParallelConverter, pdf, vision},
    dispatch::Dispatcher,
    extract::Extractor,
    ledger::RunLedger,
    lifecycle::FileLifecycleManager,
    prelude::*,
    provider::Providers,
    schema::SchemaRegistry,
    summarize::Summarizer,
};

pub struct Engine {
    pub config: Config,
    pub registry: SchemaRegistry,
    pub cache: Arc<ResultCache>,
    pub ledger: Arc<RunLedger>,
    pub lifecycle: Arc<FileLifecycleManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub summarizer: Arc<Summarizer>,
    pub converter: Arc<ParallelConverter>,
    workers: Mutex<Vec<JoinWorker>>,
}

impl Engine {
    /// Wire the engine together. No I/O happens here; `start` does that.
    pub fn new(config: Config, providers: Providers) -> Result<Arc<Self>> {
        let mut registry = SchemaRegistry::builtin();
        let loaded = registry.load_dir(&config.paths.schemas_dir)?;
        if loaded > 0 {
            info!(loaded, dir = %config.paths.schemas_dir.display(), "loaded schema files");
        }

        let cache = Arc::new(ResultCache::new(
            config.result_cache.clone(),
            config.database.processing_logs.path.clone(),
        ));
        let ledger = Arc::new(RunLedger::new(&config.database.processing_logs));
        let lifecycle = Arc::new(FileLifecycleManager::new(config.file_management.clone()));

        let converter_set = Arc::new(ConverterSet::new(
            pdf::PdfConverter::new(
                config.pdf.detection.clone(),
                providers.ocr.clone(),
                config.ocr.enabled,
            ),
            audio::AudioConverter::new(providers.transcription.clone()),
            vision::VisionConverter::new(
                providers.vision.clone(),
                config.prompts.vision_prompt.clone(),
            ),
        ));
        let converter = Arc::new(ParallelConverter::new(
            &config.markdown_conversion,
            converter_set,
        ));

        let extractor = Extractor::new(
            providers.chat.clone(),
            config.ai_processing.clone(),
            config.prompts.analysis_template.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            config.ai_processing.max_concurrent_items,
            extractor,
            cache.clone(),
            config.structured_analysis.streaming.enable_partial,
        ));
        let summarizer = Arc::new(Summarizer::new(
            providers.chat.clone(),
            config.summarization.clone(),
            config.prompts.summarization_template.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            registry,
            cache,
            ledger,
            lifecycle,
            dispatcher,
            summarizer,
            converter,
            workers: Mutex::new(Vec::new()),
        }))
    }

    /// Initialize storage and start the background sweepers.
    pub async fn start(&self) -> Result<()> {
        self.ledger.start().await;
        let cache_worker = self.cache.start().await?;
        let lifecycle_worker = self.lifecycle.start();
        let mut workers = self.workers.lock().expect("engine workers lock poisoned");
        workers.push(cache_worker);
        workers.push(lifecycle_worker);
        info!("engine started");
        Ok(())
    }

    /// Stop the background sweepers.
    pub async fn stop(&self) {
        let workers: Vec<JoinWorker> = {
            let mut guard = self.workers.lock().expect("engine workers lock poisoned");
            std::mem::take(&mut *guard)
        };
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            if let Err(err) = worker.join().await {
                warn!(%err, "worker shut down uncleanly");
            }
        }
        info!("engine stopped");
    }
}
