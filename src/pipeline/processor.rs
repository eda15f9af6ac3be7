//! Document processing orchestrator.
//!
//! Single entry point that drives the full pipeline:
//! chunk cache → partition → concurrent two-stage extraction → merge →
//! optional evaluation.
//!
//! Every external service is injected (`LlmClient`, `DocumentParser`, the
//! stores), so the orchestrator is fully testable with fakes.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use crate::pipeline::chunks::{
    CacheKeyStrategy, ChunkCache, ChunkError, ChunkStore, DocumentParser, HttpDocumentParser,
    SqliteCacheStore, StructureStore,
};
use crate::pipeline::evaluation::{EvaluationError, QualityEvaluator, WeightTable};
use crate::pipeline::extraction::{
    ExtractionKernel, ExtractionReport, KernelOptions, SectionScheduler,
};
use crate::pipeline::grounding::{open_rasterizer, GroundingExtractor};
use crate::pipeline::llm::{LlmClient, LlmError, OllamaClient};
use crate::pipeline::sections::SectionPartitioner;
use crate::pipeline_config::{ConfigError, PipelineConfig};

/// Timeout for the document parsing service, which is slower than generation.
const PARSER_TIMEOUT_SECS: u64 = 600;

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

/// Run-level failures. Section-level failures never surface here; they are
/// recorded in the report trace.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Chunk retrieval failed: {0}")]
    Chunks(#[from] ChunkError),

    #[error("Text generation service error: {0}")]
    Llm(#[from] LlmError),

    #[error("Evaluation setup failed: {0}")]
    Evaluation(#[from] EvaluationError),
}

// ═══════════════════════════════════════════════════════════
// Processor
// ═══════════════════════════════════════════════════════════

pub struct DocumentProcessor {
    llm: Arc<dyn LlmClient>,
    cache: ChunkCache,
    structures: Option<Arc<dyn StructureStore>>,
    weights: WeightTable,
    config: PipelineConfig,
}

impl DocumentProcessor {
    pub fn new(llm: Arc<dyn LlmClient>, cache: ChunkCache, config: PipelineConfig) -> Self {
        Self {
            llm,
            cache,
            structures: None,
            weights: WeightTable::new(),
            config,
        }
    }

    pub fn with_structure_store(mut self, store: Arc<dyn StructureStore>) -> Self {
        self.structures = Some(store);
        self
    }

    pub fn with_weights(mut self, weights: WeightTable) -> Self {
        self.weights = weights;
        self
    }

    /// Wire the production services described by `config`: Ollama for
    /// generation, the HTTP parsing service, and the SQLite cache file.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let llm: Arc<dyn LlmClient> =
            Arc::new(OllamaClient::new(&config.ollama_url, config.timeout_secs)?);
        let parser: Box<dyn DocumentParser> = Box::new(HttpDocumentParser::from_env(
            &config.parser_url,
            &config.parser_api_key_env,
            PARSER_TIMEOUT_SECS,
        )?);
        let store = Arc::new(SqliteCacheStore::open(&config.cache_path)?);
        let weights = match &config.weights_path {
            Some(path) => WeightTable::load(path)?,
            None => WeightTable::new(),
        };

        let chunk_store: Arc<dyn ChunkStore> = store.clone();
        let cache = ChunkCache::new(parser, chunk_store, config.cache_key);
        Ok(Self::new(llm, cache, config)
            .with_structure_store(store)
            .with_weights(weights))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache_key_strategy(&self) -> CacheKeyStrategy {
        self.config.cache_key
    }

    /// Process one document against one transcript.
    pub fn process(&self, document: &Path, transcript: &str) -> Result<ExtractionReport, PipelineError> {
        let scheduler = SectionScheduler::new(self.config.max_workers);
        self.process_with_scheduler(document, transcript, &scheduler)
    }

    /// Same as `process`, with a caller-configured scheduler (progress
    /// reporting, cancellation).
    pub fn process_with_scheduler(
        &self,
        document: &Path,
        transcript: &str,
        scheduler: &SectionScheduler,
    ) -> Result<ExtractionReport, PipelineError> {
        let started_at = Utc::now();
        let _span = tracing::info_span!("process_document", document = %document.display()).entered();

        if transcript.trim().is_empty() {
            tracing::warn!("Transcript is empty; every field will be null");
        }

        let cached = self.cache.fetch(document)?;
        tracing::info!(
            doc_key = %cached.key,
            chunk_count = cached.chunks.len(),
            cache_hit = cached.hit,
            "Chunks ready"
        );

        let grounding = self.grounding_for(document);

        let mut partitioner = SectionPartitioner::new(Arc::clone(&self.llm), &self.config.model);
        if let (true, Some(g)) = (self.config.partition_with_images, &grounding) {
            partitioner = partitioner.with_images(Arc::clone(g), self.config.vision_model());
        }
        let partition = partitioner.partition_detailed(&cached.chunks);

        let mut kernel = ExtractionKernel::new(
            Arc::clone(&self.llm),
            KernelOptions {
                model: self.config.model.clone(),
                vision_model: self.config.vision_model().to_string(),
                include_images: self.config.include_images,
            },
        );
        if let Some(g) = &grounding {
            kernel = kernel.with_grounding(Arc::clone(g));
        }
        if let (true, Some(store)) = (self.config.reuse_structures, &self.structures) {
            kernel = kernel.with_structure_reuse(Arc::clone(store), &cached.key);
        }

        let results = scheduler.run_all(&kernel, &partition.sections, &cached.chunks, transcript);
        let mut report = ExtractionReport::assemble(&cached.key, started_at, &partition, results);

        if self.config.evaluate && !report.document.is_empty() {
            let evaluator = QualityEvaluator::new(Arc::clone(&self.llm), &self.config.model);
            report.evaluation =
                Some(evaluator.evaluate(&report.document_value(), transcript, &self.weights));
            report.finished_at = Utc::now();
        }

        tracing::info!(
            run_id = %report.run_id,
            succeeded = report.succeeded,
            failed = report.failed,
            status = ?report.status(),
            "Document processed"
        );
        Ok(report)
    }

    /// Grounding is optional: when the document cannot be rasterized the
    /// run continues text-only.
    fn grounding_for(&self, document: &Path) -> Option<Arc<GroundingExtractor>> {
        if !(self.config.include_images || self.config.partition_with_images) {
            return None;
        }
        match open_rasterizer(document) {
            Ok(rasterizer) => Some(Arc::new(GroundingExtractor::new(
                rasterizer,
                self.config.grounding_padding_px,
                self.config.grounding_scale,
            ))),
            Err(e) => {
                tracing::warn!(error = %e, "Document cannot be rasterized, continuing without images");
                None
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
