use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNK_TABLE: &str = "document_chunk_embeddings";
pub const DEFAULT_MERGED_TABLE: &str = "document_embeddings";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("embedgen").join("config.toml"))
    }

    /// Path of the local run-history database.
    pub fn runlog_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|p| p.join("embedgen").join("runs.sqlite"))
    }

    pub fn load() -> Result<Self, crate::error::ConfigError> {
        if let Some(path) = Self::config_path()
            && path.exists()
        {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            return Ok(config);
        }
        Ok(Self::default())
    }

    pub fn save(&self) -> Result<(), crate::error::ConfigError> {
        let path = Self::config_path().ok_or_else(|| {
            crate::error::ConfigError::PathError("could not determine config directory".to_string())
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Directory containing `model.onnx` and `tokenizer.json`.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Hidden size of the model; fixes the vector column width.
    #[serde(default = "default_dimension")]
    pub dimension: u32,

    /// The encoder's context length in tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_model_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("embedgen")
        .join("model")
}

fn default_dimension() -> u32 {
    384
}

fn default_max_tokens() -> u32 {
    256
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            dimension: default_dimension(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Tokens shared between consecutive chunks.
    #[serde(default = "default_overlap")]
    pub overlap: u32,

    /// Extra tokens held back from the window on top of the model's
    /// framing tokens.
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: u32,
}

fn default_overlap() -> u32 {
    50
}

fn default_safety_buffer() -> u32 {
    15
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            overlap: default_overlap(),
            safety_buffer: default_safety_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection string. Normally supplied via DATABASE_URL rather than
    /// written to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default = "default_chunk_table")]
    pub chunk_table: String,

    #[serde(default = "default_merged_table")]
    pub merged_table: String,

    #[serde(default = "default_pool_max")]
    pub pool_max: u32,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

fn default_chunk_table() -> String {
    DEFAULT_CHUNK_TABLE.to_string()
}

fn default_merged_table() -> String {
    DEFAULT_MERGED_TABLE.to_string()
}

fn default_pool_max() -> u32 {
    4
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_statement_timeout() -> u64 {
    300
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            chunk_table: default_chunk_table(),
            merged_table: default_merged_table(),
            pool_max: default_pool_max(),
            acquire_timeout_secs: default_acquire_timeout(),
            statement_timeout_secs: default_statement_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Chunks per model forward pass.
    #[serde(default = "default_encode_batch")]
    pub encode_batch: usize,

    /// Rows per database transaction.
    #[serde(default = "default_sink_batch")]
    pub sink_batch: usize,

    /// Concurrent reader tasks; 0 means one per CPU.
    #[serde(default)]
    pub workers: usize,

    /// Load the processed set at startup and skip already-stored chunks.
    #[serde(default = "default_resume")]
    pub resume: bool,
}

fn default_encode_batch() -> usize {
    512
}

fn default_sink_batch() -> usize {
    100
}

fn default_resume() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            encode_batch: default_encode_batch(),
            sink_batch: default_sink_batch(),
            workers: 0,
            resume: default_resume(),
        }
    }
}

impl PipelineConfig {
    /// Effective reader-pool size.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.store.chunk_table, DEFAULT_CHUNK_TABLE);
        assert_eq!(config.store.merged_table, DEFAULT_MERGED_TABLE);
        assert_eq!(config.embedding.max_tokens, 256);
        assert_eq!(config.chunking.overlap, 50);
        assert!(config.pipeline.resume);
    }

    #[test]
    fn test_worker_count_auto() {
        let config = PipelineConfig::default();
        assert!(config.worker_count() >= 1);

        let fixed = PipelineConfig {
            workers: 3,
            ..Default::default()
        };
        assert_eq!(fixed.worker_count(), 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("[pipeline]\nencode_batch = 64\n").unwrap();
        assert_eq!(config.pipeline.encode_batch, 64);
        assert_eq!(config.pipeline.sink_batch, 100);
        assert_eq!(config.embedding.dimension, 384);
    }
}
