//! Corpus sources: filesystem globs and S3 prefixes over JSONL partitions.

pub mod local;
pub mod s3;

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::SourceError;
use crate::models::{ChunkItem, CrawlRecord};
use crate::services::extract_text;

/// Where the corpus lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorpusLocation {
    /// A glob pattern over local JSONL files, e.g. `analyses/partition=*/*.jsonl`.
    Glob(String),
    /// An S3 bucket + key prefix, e.g. `s3://crawl-archive/analyses/`.
    S3 { bucket: String, prefix: String },
}

impl CorpusLocation {
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        if let Some(rest) = raw.strip_prefix("s3://") {
            let (bucket, prefix) = match rest.split_once('/') {
                Some((bucket, prefix)) => (bucket, prefix),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(SourceError::InvalidLocation(format!(
                    "missing bucket name in '{raw}'"
                )));
            }
            return Ok(CorpusLocation::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            });
        }
        if raw.is_empty() {
            return Err(SourceError::InvalidLocation("empty corpus location".to_string()));
        }
        Ok(CorpusLocation::Glob(raw.to_string()))
    }
}

impl std::fmt::Display for CorpusLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorpusLocation::Glob(pattern) => write!(f, "{pattern}"),
            CorpusLocation::S3 { bucket, prefix } => write!(f, "s3://{bucket}/{prefix}"),
        }
    }
}

/// One discovered source: a local file or an S3 object key.
#[derive(Debug, Clone)]
pub enum SourceHandle {
    File(PathBuf),
    Object(String),
}

/// Per-source outcome counters, folded into the run summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceStats {
    pub records_processed: u64,
    pub records_empty: u64,
    pub lines_failed: u64,
}

/// Parse, extract, and chunk every line of one source, sending
/// `(url, chunk_id, text)` triples into the pipeline channel.
///
/// Chunk ids are contiguous per url across the whole source pass, so a url
/// appearing on two lines keeps numbering where the first left off.
/// Per-line failures are logged and skipped; they never abort the source.
/// Must run on a blocking thread: channel backpressure uses `blocking_send`.
pub fn process_source_lines<I, C>(
    source: &str,
    lines: I,
    chunk: C,
    tx: &mpsc::Sender<ChunkItem>,
) -> SourceStats
where
    I: Iterator<Item = std::io::Result<String>>,
    C: Fn(&str) -> Vec<String>,
{
    let mut next_ids: HashMap<String, i32> = HashMap::new();
    let mut stats = SourceStats::default();

    for (line_no, line) in lines.enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("read error at line {} in {}: {}", line_no + 1, source, e);
                stats.lines_failed += 1;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let record: CrawlRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!("skipping invalid JSON on line {} in {}: {}", line_no + 1, source, e);
                stats.lines_failed += 1;
                continue;
            }
        };
        if record.url.is_empty() {
            stats.records_empty += 1;
            continue;
        }

        let text = extract_text(&record);
        if text.is_empty() {
            stats.records_empty += 1;
            continue;
        }

        let chunks = chunk(&text);
        if chunks.is_empty() {
            stats.records_empty += 1;
            continue;
        }

        let next_id = next_ids.entry(record.url.clone()).or_insert(0);
        for text in chunks {
            let item = ChunkItem {
                url: record.url.clone(),
                chunk_id: *next_id,
                text,
            };
            *next_id += 1;
            if tx.blocking_send(item).is_err() {
                // Receiver gone: the run is shutting down.
                return stats;
            }
        }
        stats.records_processed += 1;
    }

    stats
}
