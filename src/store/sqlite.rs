//! SQLite-backed result store.
//!
//! Layout:
//! - `results`: one row per record with summary and failure as JSON
//! - `result_analyses`: one JSON blob per analysis, keyed by (result_id, task_name)

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::domain::{Analysis, FinalRecord, RecordStatus};

use super::{RecordFilter, ResultStore, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS results (
    id          TEXT PRIMARY KEY,
    file_name   TEXT NOT NULL,
    blob_path   TEXT NOT NULL,
    analyzed_at TEXT NOT NULL,
    status      TEXT NOT NULL,
    summary     TEXT,
    failure     TEXT
);
CREATE INDEX IF NOT EXISTS idx_results_analyzed_at ON results (analyzed_at);
CREATE TABLE IF NOT EXISTS result_analyses (
    result_id TEXT NOT NULL REFERENCES results (id) ON DELETE CASCADE,
    task_name TEXT NOT NULL,
    position  INTEGER NOT NULL,
    blob      TEXT NOT NULL,
    PRIMARY KEY (result_id, task_name)
);
";

/// Result store in a single SQLite database file
#[derive(Clone)]
pub struct SqliteResultStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteResultStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "Opened result store");

        Ok(Self {
            path: path.to_path_buf(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Database(format!("store task panicked: {}", e)))?
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    // Fixed width so lexical order matches time order
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn upsert(conn: &mut Connection, key: &str, record: &FinalRecord) -> Result<(), StoreError> {
    let summary = record.summary.as_ref().map(serde_json::to_string).transpose()?;
    let failure = record.failure.as_ref().map(serde_json::to_string).transpose()?;

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO results (id, file_name, blob_path, analyzed_at, status, summary, failure)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (id) DO UPDATE SET
            file_name = excluded.file_name,
            blob_path = excluded.blob_path,
            analyzed_at = excluded.analyzed_at,
            status = excluded.status,
            summary = excluded.summary,
            failure = excluded.failure",
        params![
            key,
            record.file_name,
            record.blob_path,
            timestamp(&record.analyzed_at),
            record.status.as_str(),
            summary,
            failure,
        ],
    )?;

    tx.execute("DELETE FROM result_analyses WHERE result_id = ?1", params![key])?;
    for (position, analysis) in record.analyses.iter().enumerate() {
        tx.execute(
            "INSERT INTO result_analyses (result_id, task_name, position, blob)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key,
                analysis.key(),
                position as i64,
                serde_json::to_string(analysis)?
            ],
        )?;
    }

    tx.commit()?;
    Ok(())
}

/// Columns of `results` as read back, before JSON decoding
struct ResultRow {
    id: String,
    file_name: String,
    blob_path: String,
    analyzed_at: String,
    status: String,
    summary: Option<String>,
    failure: Option<String>,
}

impl ResultRow {
    const COLUMNS: &'static str =
        "id, file_name, blob_path, analyzed_at, status, summary, failure";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            file_name: row.get(1)?,
            blob_path: row.get(2)?,
            analyzed_at: row.get(3)?,
            status: row.get(4)?,
            summary: row.get(5)?,
            failure: row.get(6)?,
        })
    }

    fn into_record(self, conn: &Connection) -> Result<FinalRecord, StoreError> {
        let analyzed_at = DateTime::parse_from_rfc3339(&self.analyzed_at)
            .map_err(|e| StoreError::Database(format!("bad analyzed_at '{}': {}", self.analyzed_at, e)))?
            .with_timezone(&Utc);
        let status = RecordStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Database(format!("bad status '{}'", self.status)))?;

        let mut stmt = conn.prepare(
            "SELECT blob FROM result_analyses WHERE result_id = ?1 ORDER BY position",
        )?;
        let mut rows = stmt.query(params![self.id])?;
        let mut analyses = Vec::new();
        while let Some(row) = rows.next()? {
            let blob: String = row.get(0)?;
            analyses.push(serde_json::from_str::<Analysis>(&blob)?);
        }

        Ok(FinalRecord {
            id: self.id,
            file_name: self.file_name,
            blob_path: self.blob_path,
            analyzed_at,
            status,
            summary: self.summary.as_deref().map(serde_json::from_str).transpose()?,
            analyses,
            failure: self.failure.as_deref().map(serde_json::from_str).transpose()?,
        })
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn put(&self, key: &str, record: &FinalRecord) -> Result<(), StoreError> {
        let owned_key = key.to_string();
        let record = record.clone();
        self.with_conn(move |conn| upsert(conn, &owned_key, &record))
            .await?;
        debug!(record_id = %key, "Record upserted");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<FinalRecord, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM results WHERE id = ?1", ResultRow::COLUMNS);
            let row = conn
                .query_row(&sql, params![key], ResultRow::from_row)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            row.into_record(conn)
        })
        .await
    }

    async fn query(
        &self,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<FinalRecord>, StoreError> {
        let status = filter.status.map(|s| s.as_str());
        let file_name = filter.file_name.clone();
        let limit = limit as i64;

        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM results
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR file_name = ?2)
                 ORDER BY analyzed_at DESC, id
                 LIMIT ?3",
                ResultRow::COLUMNS
            );
            let rows: Vec<ResultRow> = {
                let mut stmt = conn.prepare(&sql)?;
                let mapped = stmt.query_map(params![status, file_name, limit], ResultRow::from_row)?;
                mapped.collect::<rusqlite::Result<_>>()?
            };
            rows.into_iter().map(|row| row.into_record(conn)).collect()
        })
        .await
    }
}
