//! Local run history, kept in a small SQLite file.

use std::path::Path;

use rusqlite::{Connection, params};
use serde::Serialize;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS run_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    corpus TEXT NOT NULL,
    chunks_embedded INTEGER NOT NULL,
    chunks_skipped INTEGER NOT NULL,
    records_skipped INTEGER NOT NULL,
    failed_batches INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_log_started_at ON run_log(started_at);
"#;

pub struct RunLog {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub started_at: String,
    pub corpus: String,
    pub chunks_embedded: u64,
    pub chunks_skipped: u64,
    pub records_skipped: u64,
    pub failed_batches: u64,
    pub duration_ms: u64,
}

impl RunLog {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn record(&self, record: &RunRecord) {
        let _ = self.conn.execute(
            "INSERT INTO run_log (started_at, corpus, chunks_embedded, chunks_skipped,
                                  records_skipped, failed_batches, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.started_at,
                record.corpus,
                record.chunks_embedded as i64,
                record.chunks_skipped as i64,
                record.records_skipped as i64,
                record.failed_batches as i64,
                record.duration_ms as i64,
            ],
        );
    }

    pub fn recent(&self, limit: u32) -> Vec<RunRecord> {
        let mut stmt = match self.conn.prepare(
            "SELECT started_at, corpus, chunks_embedded, chunks_skipped,
                    records_skipped, failed_batches, duration_ms
             FROM run_log ORDER BY id DESC LIMIT ?1",
        ) {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };

        let rows = stmt.query_map(params![limit], |row| {
            Ok(RunRecord {
                started_at: row.get(0)?,
                corpus: row.get(1)?,
                chunks_embedded: row.get::<_, i64>(2)? as u64,
                chunks_skipped: row.get::<_, i64>(3)? as u64,
                records_skipped: row.get::<_, i64>(4)? as u64,
                failed_batches: row.get::<_, i64>(5)? as u64,
                duration_ms: row.get::<_, i64>(6)? as u64,
            })
        });

        match rows {
            Ok(rows) => rows.filter_map(Result::ok).collect(),
            Err(_) => Vec::new(),
        }
    }
}
