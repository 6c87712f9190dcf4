//! Status command: database health, table counts, recent run history.

use anyhow::{Context, Result};
use clap::Args;
use console::style;

use crate::models::Config;
use crate::services::{ChunkStore, RunLog};

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,
}

pub async fn handle_status(args: StatusArgs, _verbose: bool) -> Result<()> {
    let mut config = Config::load()?;
    if args.database_url.is_some() {
        config.store.database_url = args.database_url;
    }

    let store = ChunkStore::connect(&config.store, config.embedding.dimension)
        .await
        .context("failed to connect to database")?;

    let healthy = store.health_check().await.unwrap_or(false);
    println!(
        "database:       {}",
        if healthy {
            style("ok").green().to_string()
        } else {
            style("unreachable").red().to_string()
        }
    );

    match store.chunk_count().await {
        Ok(count) => println!("chunk rows:     {count}"),
        Err(_) => println!("chunk rows:     (table missing)"),
    }
    match store.merged_count().await {
        Ok(count) => println!("merged rows:    {count}"),
        Err(_) => println!("merged rows:    (table missing)"),
    }
    store.close().await;

    if let Some(path) = Config::runlog_path()
        && path.exists()
        && let Ok(log) = RunLog::open(&path)
    {
        let recent = log.recent(5);
        if !recent.is_empty() {
            println!("\nrecent runs:");
            for run in recent {
                println!(
                    "  {}  {}  embedded={} skipped={} failed_batches={} ({:.1}s)",
                    run.started_at,
                    run.corpus,
                    run.chunks_embedded,
                    run.chunks_skipped,
                    run.failed_batches,
                    run.duration_ms as f64 / 1000.0,
                );
            }
        }
    }

    Ok(())
}
