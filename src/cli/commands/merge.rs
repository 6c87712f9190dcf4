//! Merge command: derive per-document vectors by averaging chunk vectors.

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::error;

use crate::models::Config;
use crate::services::{ChunkStore, mean_vectors};

/// Urls fetched per chunk-vector query.
const URL_FETCH_BATCH: usize = 1000;
/// Merged rows per insert transaction.
const INSERT_BATCH: usize = 5000;

#[derive(Debug, Args)]
pub struct MergeArgs {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,
}

pub async fn handle_merge(args: MergeArgs, _verbose: bool) -> Result<()> {
    let mut config = Config::load()?;
    if args.database_url.is_some() {
        config.store.database_url = args.database_url;
    }

    let store = ChunkStore::connect(&config.store, config.embedding.dimension)
        .await
        .context("failed to connect to database")?;

    // The merged table's width comes from the data, not from config.
    let Some(dimension) = store.stored_dimension().await? else {
        println!("No chunk embeddings to merge.");
        return Ok(());
    };
    store.ensure_merged_schema(dimension).await?;

    let urls = store.unmerged_urls().await?;
    if urls.is_empty() {
        println!("Merged table is up to date.");
        return Ok(());
    }

    let pb = ProgressBar::new(urls.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap()
            .progress_chars("#>-"),
    );

    let mut batch: Vec<(String, Vec<f32>)> = Vec::new();
    let mut merged = 0u64;
    let mut failed = 0u64;

    for url_batch in urls.chunks(URL_FETCH_BATCH) {
        let rows = store.chunk_vectors(url_batch).await?;

        let mut groups: HashMap<String, Vec<Vec<f32>>> = HashMap::new();
        for (url, vector) in rows {
            groups.entry(url).or_default().push(vector);
        }
        for (url, vectors) in groups {
            batch.push((url, mean_vectors(&vectors)));
        }

        if batch.len() >= INSERT_BATCH {
            match store.upsert_merged(&batch).await {
                Ok(n) => merged += n as u64,
                Err(e) => {
                    failed += batch.len() as u64;
                    error!("merged batch of {} rows failed: {}", batch.len(), e);
                }
            }
            batch.clear();
        }
        pb.inc(url_batch.len() as u64);
    }

    if !batch.is_empty() {
        match store.upsert_merged(&batch).await {
            Ok(n) => merged += n as u64,
            Err(e) => {
                failed += batch.len() as u64;
                error!("merged batch of {} rows failed: {}", batch.len(), e);
            }
        }
    }

    pb.finish_and_clear();
    store.close().await;

    println!(
        "{} {} document embeddings ({} urls pending before the run)",
        style("Merged").green().bold(),
        merged,
        urls.len(),
    );
    if failed > 0 {
        println!("  {} {}", style("failed rows:").red(), failed);
    }
    Ok(())
}
