//! CLI module for the embedding pipeline.

pub mod commands;

use clap::{Parser, Subcommand};

/// Batch embedding pipeline for crawled web documents.
#[derive(Debug, Parser)]
#[command(name = "embedgen")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[arg(long, short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Chunk and embed a corpus into the chunk-embedding table
    Embed(commands::EmbedArgs),

    /// Derive per-document embeddings by averaging chunk vectors
    Merge(commands::MergeArgs),

    /// Report database health, table counts, and recent runs
    Status(commands::StatusArgs),
}
