//! Embed command: the chunking-and-checkpointed-ingestion pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use tracing::warn;

use crate::models::Config;
use crate::pipeline::{Pipeline, RunOutcome};
use crate::services::{ChunkStore, OnnxEncoder, RunLog, RunRecord, TokenChunker};
use crate::sources::CorpusLocation;

#[derive(Debug, Args)]
pub struct EmbedArgs {
    /// Corpus location: a glob over JSONL files, or s3://bucket/prefix
    #[arg(env = "EMBEDGEN_CORPUS")]
    pub corpus: String,

    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Directory containing model.onnx and tokenizer.json
    #[arg(long, env = "EMBEDGEN_MODEL_DIR")]
    pub model_dir: Option<PathBuf>,

    /// Encoder context length in tokens
    #[arg(long, env = "EMBEDGEN_MAX_TOKENS")]
    pub max_tokens: Option<u32>,

    /// Tokens shared between consecutive chunks
    #[arg(long, env = "EMBEDGEN_OVERLAP")]
    pub overlap: Option<u32>,

    /// Chunks per model forward pass
    #[arg(long, env = "EMBEDGEN_ENCODE_BATCH")]
    pub encode_batch: Option<usize>,

    /// Rows per database transaction
    #[arg(long, env = "EMBEDGEN_SINK_BATCH")]
    pub sink_batch: Option<usize>,

    /// Concurrent reader tasks (default: one per CPU)
    #[arg(long, env = "EMBEDGEN_WORKERS")]
    pub workers: Option<usize>,

    /// Ignore the processed-set checkpoint and re-embed everything
    #[arg(long)]
    pub no_resume: bool,
}

pub async fn handle_embed(args: EmbedArgs, _verbose: bool) -> Result<()> {
    let started_at = chrono::Utc::now().to_rfc3339();
    let mut config = Config::load()?;

    if args.database_url.is_some() {
        config.store.database_url = args.database_url.clone();
    }
    if let Some(model_dir) = args.model_dir {
        config.embedding.model_dir = model_dir;
    }
    if let Some(max_tokens) = args.max_tokens {
        config.embedding.max_tokens = max_tokens;
    }
    if let Some(overlap) = args.overlap {
        config.chunking.overlap = overlap;
    }
    if let Some(encode_batch) = args.encode_batch {
        config.pipeline.encode_batch = encode_batch;
    }
    if let Some(sink_batch) = args.sink_batch {
        config.pipeline.sink_batch = sink_batch;
    }
    if let Some(workers) = args.workers {
        config.pipeline.workers = workers;
    }
    if args.no_resume {
        config.pipeline.resume = false;
    }

    let corpus = CorpusLocation::parse(&args.corpus)?;

    // INIT: model, tokenizer, store, schema. Any failure here terminates
    // before the main loop starts.
    let chunker = Arc::new(
        TokenChunker::load(&config.embedding, &config.chunking)
            .context("failed to load tokenizer")?,
    );
    let encoder = Arc::new(
        OnnxEncoder::load(&config.embedding).context("failed to load embedding model")?,
    );
    let store = Arc::new(
        ChunkStore::connect(&config.store, config.embedding.dimension)
            .await
            .context("failed to connect to database")?,
    );
    store.ensure_schema().await?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nreceived interrupt, flushing committed work...");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    let pipeline = Pipeline::new(
        config.pipeline.clone(),
        encoder,
        store.clone(),
        shutdown.clone(),
    );
    let outcome = pipeline.run(&corpus, chunker).await?;

    print_summary(&outcome);

    if let Some(path) = Config::runlog_path() {
        match RunLog::open(&path) {
            Ok(log) => log.record(&RunRecord {
                started_at,
                corpus: args.corpus.clone(),
                chunks_embedded: outcome.summary.chunks_embedded,
                chunks_skipped: outcome.summary.chunks_skipped,
                records_skipped: outcome.summary.records_empty + outcome.summary.lines_failed,
                failed_batches: outcome.summary.failed_batches,
                duration_ms: (outcome.summary.elapsed_secs * 1000.0) as u64,
            }),
            Err(e) => warn!("could not open run log: {}", e),
        }
    }

    store.close().await;

    if let Some(fatal) = outcome.fatal {
        return Err(fatal.into());
    }
    Ok(())
}

fn print_summary(outcome: &RunOutcome) {
    let s = &outcome.summary;
    println!(
        "{} {} chunks from {} sources in {:.1}s ({:.1} chunks/s)",
        style("Embedded").green().bold(),
        s.chunks_embedded,
        s.sources,
        s.elapsed_secs,
        s.throughput(),
    );
    println!("  records processed:      {}", s.records_processed);
    println!("  skipped (checkpointed): {}", s.chunks_skipped);
    println!("  empty records:          {}", s.records_empty);
    println!("  malformed lines:        {}", s.lines_failed);
    if s.failed_batches > 0 {
        println!(
            "  {} {}",
            style("failed sink batches:   ").red(),
            s.failed_batches
        );
    }
    if s.dropped_encode_batches > 0 {
        println!(
            "  {} {}",
            style("dropped encode batches:").red(),
            s.dropped_encode_batches
        );
    }
}
