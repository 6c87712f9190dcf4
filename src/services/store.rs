//! pgvector-backed chunk store: schema bootstrap, idempotent upserts, and
//! the processed-set checkpoint that makes re-runs resumable.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{ChunkKey, EmbeddingRow, StoreConfig};

/// Destination for embedded chunks. Upserts are transactional per batch;
/// a batch either commits whole or rolls back whole.
#[async_trait]
pub trait EmbeddingSink: Send + Sync {
    /// Keys of every chunk already committed, loaded once at startup.
    async fn load_processed(&self) -> Result<HashSet<ChunkKey>, StoreError>;

    /// Insert-or-overwrite a batch of rows; returns the count committed.
    async fn upsert(&self, rows: &[EmbeddingRow]) -> Result<usize, StoreError>;
}

pub struct ChunkStore {
    pool: PgPool,
    chunk_table: String,
    merged_table: String,
    dimension: u32,
}

impl ChunkStore {
    /// Connect and apply the per-connection statement timeout.
    pub async fn connect(config: &StoreConfig, dimension: u32) -> Result<Self, StoreError> {
        let url = config.database_url.as_deref().ok_or_else(|| {
            StoreError::ConnectionError(
                "database URL not configured (set DATABASE_URL)".to_string(),
            )
        })?;

        let statement_timeout =
            format!("SET statement_timeout = '{}s'", config.statement_timeout_secs);

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .after_connect(move |conn, _meta| {
                let stmt = statement_timeout.clone();
                Box::pin(async move {
                    sqlx::query(&stmt).execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(url)
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;

        info!("connected to database");

        Ok(Self {
            pool,
            chunk_table: config.chunk_table.clone(),
            merged_table: config.merged_table.clone(),
            dimension,
        })
    }

    pub async fn health_check(&self) -> Result<bool, StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| true)
            .map_err(|e| StoreError::ConnectionError(e.to_string()))
    }

    async fn ensure_extension(&self) -> Result<(), StoreError> {
        if sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await
            .is_ok()
        {
            return Ok(());
        }

        // No privilege to create it; accept a pre-installed extension.
        let installed: Option<(String,)> =
            sqlx::query_as("SELECT extname FROM pg_extension WHERE extname = 'vector'")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::SchemaError(e.to_string()))?;

        if installed.is_none() {
            return Err(StoreError::ExtensionMissing);
        }
        Ok(())
    }

    /// Idempotently create the chunk table.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.ensure_extension().await?;

        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                url TEXT NOT NULL,
                chunk_id INTEGER NOT NULL,
                embedding VECTOR({}),
                PRIMARY KEY (url, chunk_id)
            )
            "#,
            self.chunk_table, self.dimension
        );

        sqlx::query(&create_table)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::SchemaError(e.to_string()))?;

        debug!(
            "ensured table '{}' with vector dimension {}",
            self.chunk_table, self.dimension
        );
        Ok(())
    }

    /// Idempotently create the merged-document table and its similarity
    /// index, with the given vector width.
    pub async fn ensure_merged_schema(&self, dimension: usize) -> Result<(), StoreError> {
        self.ensure_extension().await?;

        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                url TEXT PRIMARY KEY,
                embedding VECTOR({})
            )
            "#,
            self.merged_table, dimension
        );
        sqlx::query(&create_table)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::SchemaError(e.to_string()))?;

        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_embedding ON {} USING hnsw (embedding vector_l2_ops)",
            self.merged_table, self.merged_table
        );
        sqlx::query(&create_index)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::SchemaError(e.to_string()))?;

        Ok(())
    }

    /// Vector width of existing chunk rows, if any. The merge path uses
    /// this instead of trusting configuration.
    pub async fn stored_dimension(&self) -> Result<Option<usize>, StoreError> {
        let query = format!("SELECT embedding FROM {} LIMIT 1", self.chunk_table);
        let row: Option<(Vector,)> = sqlx::query_as(&query)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryError(e.to_string()))?;
        Ok(row.map(|(v,)| v.as_slice().len()))
    }

    pub async fn chunk_count(&self) -> Result<i64, StoreError> {
        let query = format!("SELECT COUNT(*) FROM {}", self.chunk_table);
        sqlx::query_scalar(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::QueryError(e.to_string()))
    }

    pub async fn merged_count(&self) -> Result<i64, StoreError> {
        let query = format!("SELECT COUNT(*) FROM {}", self.merged_table);
        sqlx::query_scalar(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::QueryError(e.to_string()))
    }

    /// Urls with chunk rows but no merged row yet (anti-join).
    pub async fn unmerged_urls(&self) -> Result<Vec<String>, StoreError> {
        let query = format!(
            r#"
            SELECT DISTINCT s.url
            FROM {} s
            LEFT JOIN {} t ON s.url = t.url
            WHERE t.url IS NULL
            "#,
            self.chunk_table, self.merged_table
        );
        sqlx::query_scalar(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryError(e.to_string()))
    }

    /// All chunk vectors for the given urls.
    pub async fn chunk_vectors(&self, urls: &[String]) -> Result<Vec<(String, Vec<f32>)>, StoreError> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT url, embedding FROM {} WHERE url = ANY($1)",
            self.chunk_table
        );
        let rows: Vec<(String, Vector)> = sqlx::query_as(&query)
            .bind(urls)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryError(e.to_string()))?;
        Ok(rows.into_iter().map(|(url, v)| (url, v.to_vec())).collect())
    }

    /// Upsert merged-document rows; same transaction semantics as chunks.
    pub async fn upsert_merged(&self, rows: &[(String, Vec<f32>)]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let query = format!(
            r#"
            INSERT INTO {} (url, embedding) VALUES ($1, $2)
            ON CONFLICT (url) DO UPDATE SET embedding = EXCLUDED.embedding
            "#,
            self.merged_table
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::UpsertError(e.to_string()))?;

        for (url, embedding) in rows {
            sqlx::query(&query)
                .bind(url)
                .bind(Vector::from(embedding.clone()))
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::UpsertError(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::UpsertError(e.to_string()))?;

        Ok(rows.len())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl EmbeddingSink for ChunkStore {
    async fn load_processed(&self) -> Result<HashSet<ChunkKey>, StoreError> {
        let query = format!("SELECT url, chunk_id FROM {}", self.chunk_table);
        let rows: Vec<(String, i32)> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryError(e.to_string()))?;

        info!("loaded {} already-embedded chunk keys", rows.len());
        Ok(rows.into_iter().collect())
    }

    async fn upsert(&self, rows: &[EmbeddingRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let query = format!(
            r#"
            INSERT INTO {} (url, chunk_id, embedding) VALUES ($1, $2, $3)
            ON CONFLICT (url, chunk_id) DO UPDATE SET embedding = EXCLUDED.embedding
            "#,
            self.chunk_table
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::UpsertError(e.to_string()))?;

        for row in rows {
            sqlx::query(&query)
                .bind(&row.url)
                .bind(row.chunk_id)
                .bind(Vector::from(row.embedding.clone()))
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::UpsertError(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::UpsertError(e.to_string()))?;

        Ok(rows.len())
    }
}

/// Element-wise mean of a url's chunk vectors; the merged-document row.
pub fn mean_vectors(vectors: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let mut sums = vec![0f32; first.len()];
    for vector in vectors {
        for (sum, value) in sums.iter_mut().zip(vector.iter()) {
            *sum += value;
        }
    }
    let count = vectors.len() as f32;
    for sum in sums.iter_mut() {
        *sum /= count;
    }
    sums
}
