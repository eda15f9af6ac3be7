//! Pipeline configuration.
//!
//! One `PipelineConfig` drives every stage: which model answers which call,
//! how many sections run at once, how grounding crops are produced, and where
//! the chunk cache lives. Values come from an optional JSON file; every field
//! has a default so a partial file (or none) is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config;
use crate::pipeline::chunks::CacheKeyStrategy;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Base URL of the Ollama instance serving text generation.
    pub ollama_url: String,
    /// Model used for partitioning, synthesis, fill and scoring.
    pub model: String,
    /// Model used when a call carries grounding images. `None` = `model`.
    pub vision_model: Option<String>,
    /// Per-request timeout for the text-generation service.
    pub timeout_secs: u64,
    /// Upper bound on concurrently running section kernels.
    pub max_workers: usize,
    /// Context added around each grounding box, in page units (PDF points for
    /// PDFs, pixels for image scans). Applied before `grounding_scale`.
    pub grounding_padding_px: f32,
    /// Upscaling factor applied when rendering grounding crops.
    pub grounding_scale: f32,
    /// Attach grounding crops to structure synthesis.
    pub include_images: bool,
    /// Attach one grounding crop per chunk to the partition request.
    pub partition_with_images: bool,
    /// SQLite file holding cached chunk lists and synthesized structures.
    pub cache_path: PathBuf,
    /// How a document maps to its cache key.
    pub cache_key: CacheKeyStrategy,
    /// Reuse stage-1 structures across transcripts for the same layout.
    pub reuse_structures: bool,
    /// Score the merged result against the transcript after extraction.
    pub evaluate: bool,
    /// JSON weight table (`{"path": weight}`) for the evaluator.
    pub weights_path: Option<PathBuf>,
    /// Endpoint of the document parsing service.
    pub parser_url: String,
    /// Environment variable holding the parsing service API key.
    pub parser_api_key_env: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model: "medgemma:4b".to_string(),
            vision_model: None,
            timeout_secs: 300,
            max_workers: 4,
            grounding_padding_px: 10.0,
            grounding_scale: 3.0,
            include_images: true,
            partition_with_images: false,
            cache_path: config::default_cache_path(),
            cache_key: CacheKeyStrategy::FileStem,
            reuse_structures: true,
            evaluate: false,
            weights_path: None,
            parser_url: "https://api.va.landing.ai/v1/tools/agentic-document-analysis".to_string(),
            parser_api_key_env: "INTAKE_PARSER_API_KEY".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════════════════════

impl PipelineConfig {
    /// Load from a JSON file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: PipelineConfig =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Model name for calls that carry images.
    pub fn vision_model(&self) -> &str {
        self.vision_model.as_deref().unwrap_or(&self.model)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if !(self.grounding_scale.is_finite() && self.grounding_scale > 0.0) {
            return Err(ConfigError::Invalid("grounding_scale must be positive".into()));
        }
        if !(self.grounding_padding_px.is_finite() && self.grounding_padding_px >= 0.0) {
            return Err(ConfigError::Invalid(
                "grounding_padding_px must be zero or positive".into(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
