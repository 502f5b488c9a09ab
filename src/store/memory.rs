use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::domain::FinalRecord;

use super::{RecordFilter, ResultStore, StoreError};

/// Result store held in memory; counts `put` calls for tests
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    records: Mutex<HashMap<String, FinalRecord>>,
    puts: AtomicUsize,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put` calls so far, including overwrites
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of distinct stored records
    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, FinalRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, key: &str, record: &FinalRecord) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.records().insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<FinalRecord, StoreError> {
        self.records()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn query(
        &self,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<FinalRecord>, StoreError> {
        let mut matching: Vec<FinalRecord> = self
            .records()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.analyzed_at.cmp(&a.analyzed_at).then(a.id.cmp(&b.id)));
        matching.truncate(limit);
        Ok(matching)
    }
}
