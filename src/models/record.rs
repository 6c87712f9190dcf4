//! Data model for crawl records and the units flowing through the pipeline.

use serde::Deserialize;

/// One crawled document, parsed from a JSONL line. Unknown fields are
/// ignored; everything except `url` is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlRecord {
    pub url: String,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub content_text: Option<String>,

    #[serde(default)]
    pub meta_tags: Vec<MetaTag>,
}

/// A single `<meta>` tag from the crawled page.
#[derive(Debug, Clone, Deserialize)]
pub struct MetaTag {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub content: Option<String>,
}

/// Identity of one embedded chunk: mirrors the chunk table's primary key.
pub type ChunkKey = (String, i32);

/// A chunk of document text on its way to the encoder.
#[derive(Debug, Clone)]
pub struct ChunkItem {
    pub url: String,
    pub chunk_id: i32,
    pub text: String,
}

impl ChunkItem {
    pub fn key(&self) -> ChunkKey {
        (self.url.clone(), self.chunk_id)
    }
}

/// One row destined for the chunk table.
#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub url: String,
    pub chunk_id: i32,
    pub embedding: Vec<f32>,
}
