//! Result store: key/value persistence of final records plus a read API.
//!
//! `put` is an upsert keyed by record id, so re-running the store step
//! never duplicates a record.

mod memory;
mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{FinalRecord, RecordStatus};

pub use memory::InMemoryResultStore;
pub use sqlite::SqliteResultStore;

/// Errors raised by result store implementations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Result not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Optional filters for [`ResultStore::query`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub status: Option<RecordStatus>,
    pub file_name: Option<String>,
}

impl RecordFilter {
    pub fn matches(&self, record: &FinalRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self
                .file_name
                .as_deref()
                .map_or(true, |f| record.file_name == f)
    }
}

/// Persistence of final records
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert or replace the record stored under `key`
    async fn put(&self, key: &str, record: &FinalRecord) -> Result<(), StoreError>;

    /// Fetch one record
    async fn get(&self, key: &str) -> Result<FinalRecord, StoreError>;

    /// Most recent matching records, newest `analyzed_at` first
    async fn query(&self, filter: &RecordFilter, limit: usize)
        -> Result<Vec<FinalRecord>, StoreError>;
}
