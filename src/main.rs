use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use embedgen::cli::commands::{handle_embed, handle_merge, handle_status};
use embedgen::cli::{Cli, Commands};

/// Detect ONNX Runtime library path and set ORT_DYLIB_PATH if not already set.
/// Must be called before any ort code runs.
fn detect_and_set_ort_path() {
    // Skip if user has already set a valid ORT_DYLIB_PATH
    if std::env::var("ORT_DYLIB_PATH")
        .map(|p| Path::new(&p).exists())
        .unwrap_or(false)
    {
        return;
    }

    let home = std::env::var("HOME").unwrap_or_default();

    // Find first existing path
    let found = if cfg!(target_os = "macos") {
        [
            format!("{home}/.local/lib/embedgen/libonnxruntime.dylib"),
            "/opt/homebrew/opt/onnxruntime/lib/libonnxruntime.dylib".into(),
            "/usr/local/opt/onnxruntime/lib/libonnxruntime.dylib".into(),
        ]
        .into_iter()
        .find(|p| Path::new(p).exists())
    } else if cfg!(target_os = "linux") {
        [
            format!("{home}/.local/lib/embedgen/libonnxruntime.so"),
            "/usr/lib/libonnxruntime.so".into(),
            "/usr/local/lib/libonnxruntime.so".into(),
            "/usr/lib/x86_64-linux-gnu/libonnxruntime.so".into(),
            "/usr/lib/aarch64-linux-gnu/libonnxruntime.so".into(),
        ]
        .into_iter()
        .find(|p| Path::new(p).exists())
    } else {
        None
    };

    if let Some(path) = found {
        // SAFETY: Called at program start before any threads are spawned.
        unsafe {
            std::env::set_var("ORT_DYLIB_PATH", path);
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("embedgen=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    detect_and_set_ort_path();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Embed(args) => handle_embed(args, cli.verbose).await?,
        Commands::Merge(args) => handle_merge(args, cli.verbose).await?,
        Commands::Status(args) => handle_status(args, cli.verbose).await?,
    }

    Ok(())
}
