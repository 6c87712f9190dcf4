pub mod config;
pub mod record;

pub use config::{ChunkingConfig, Config, EmbeddingConfig, PipelineConfig, StoreConfig};
pub use record::{ChunkItem, ChunkKey, CrawlRecord, EmbeddingRow, MetaTag};
