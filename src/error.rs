//! Error types for the embedding pipeline.

use thiserror::Error;

use crate::utils::retry::Retryable;

/// Errors related to configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("path error: {0}")]
    PathError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Errors related to corpus sources (filesystem globs, S3 prefixes).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open source: {0}")]
    OpenError(String),

    #[error("object storage request failed: {0}")]
    FetchError(String),

    #[error("object listing failed: {0}")]
    ListError(String),

    #[error("invalid corpus location: {0}")]
    InvalidLocation(String),

    #[error("missing credentials: {0}")]
    CredentialsError(String),
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        match self {
            // Network fetches and listings can hit transient failures
            SourceError::FetchError(msg) | SourceError::ListError(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("connection")
                    || msg.contains("503")
                    || msg.contains("500")
                    || msg.contains("slowdown")
            }
            // Local opens and bad configuration never heal on retry
            SourceError::OpenError(_)
            | SourceError::InvalidLocation(_)
            | SourceError::CredentialsError(_) => false,
        }
    }
}

/// Errors related to the embedding model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model not found: {0}")]
    NotFound(String),

    #[error("failed to load model: {0}")]
    LoadError(String),

    #[error("tokenizer error: {0}")]
    TokenizerError(String),

    #[error("inference error: {0}")]
    InferenceError(String),
}

/// Errors related to the vector store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to database: {0}")]
    ConnectionError(String),

    #[error("schema error: {0}")]
    SchemaError(String),

    #[error("upsert error: {0}")]
    UpsertError(String),

    #[error("query error: {0}")]
    QueryError(String),

    #[error("pgvector extension is not installed; run: CREATE EXTENSION vector")]
    ExtensionMissing,
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::ConnectionError(_) => true,
            StoreError::UpsertError(msg) | StoreError::QueryError(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout")
                    || msg.contains("connection")
                    || msg.contains("too many clients")
            }
            StoreError::SchemaError(_) | StoreError::ExtensionMissing => false,
        }
    }
}

/// Errors surfaced by the pipeline coordinator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("encoder failed {0} consecutive times, aborting run")]
    EncoderFailing(u32),

    #[error("no input sources found for corpus '{0}'")]
    NoSources(String),
}
