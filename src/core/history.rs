//! Append-only, crash-durable history log.
//!
//! Each instance owns a directory with an `instance.json` header and an
//! `events.jsonl` journal (newline-delimited JSON). Appends are gap-free:
//! an event is accepted only when its `seq` equals the current length.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fs2::FileExt;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::domain::{CorrelationId, HistoryEvent, InstanceId, InstanceRecord, InvalidInstanceId};

const INSTANCE_FILE: &str = "instance.json";
const EVENTS_FILE: &str = "events.jsonl";

/// Errors raised by history log operations
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Instance not found: {0}")]
    NotFound(InstanceId),

    #[error("Instance already exists: {0}")]
    AlreadyExists(InstanceId),

    #[error("Out-of-order append for {instance}: expected seq {expected}, got {actual}")]
    SequenceMismatch {
        instance: InstanceId,
        expected: u64,
        actual: u64,
    },

    #[error("No TaskScheduled event for {task} {correlation_id} in {instance}")]
    OrphanCompletion {
        instance: InstanceId,
        correlation_id: CorrelationId,
        task: String,
    },

    #[error(transparent)]
    InvalidId(#[from] InvalidInstanceId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Durable per-instance history storage
#[async_trait]
pub trait HistoryLog: Send + Sync {
    /// Register a new instance with an empty history
    async fn create(&self, record: &InstanceRecord) -> Result<(), HistoryError>;

    /// Load the creation record of an instance
    async fn instance(&self, id: &InstanceId) -> Result<InstanceRecord, HistoryError>;

    /// Append one event; fails unless `event.seq == len(history)`
    async fn append(&self, id: &InstanceId, event: &HistoryEvent) -> Result<(), HistoryError>;

    /// Read the full ordered history
    async fn read(&self, id: &InstanceId) -> Result<Vec<HistoryEvent>, HistoryError>;

    /// List all known instances
    async fn list(&self) -> Result<Vec<InstanceId>, HistoryError>;
}

/// File-backed history log using JSONL journals
pub struct JsonlHistoryLog {
    /// Directory containing one subdirectory per instance
    base_dir: PathBuf,
}

impl JsonlHistoryLog {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Open the log under `<home>/instances`
    pub fn open_default() -> anyhow::Result<Self> {
        Ok(Self::new(crate::config::instances_dir()?))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory of one instance; ids that could escape `base_dir` are refused
    fn instance_dir(&self, id: &InstanceId) -> Result<PathBuf, HistoryError> {
        if !id.is_well_formed() {
            return Err(InvalidInstanceId(id.to_string()).into());
        }
        Ok(self.base_dir.join(id.as_str()))
    }
}

#[async_trait]
impl HistoryLog for JsonlHistoryLog {
    async fn create(&self, record: &InstanceRecord) -> Result<(), HistoryError> {
        let dir = self.instance_dir(&record.id)?;
        let header = dir.join(INSTANCE_FILE);

        if header.exists() {
            return Err(HistoryError::AlreadyExists(record.id.clone()));
        }

        fs::create_dir_all(&dir).await?;

        // Header goes through a temp file so a crash never leaves half a record
        let tmp = dir.join(format!("{}.tmp", INSTANCE_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        fs::rename(&tmp, &header).await?;

        debug!(instance_id = %record.id, "Instance created");
        Ok(())
    }

    async fn instance(&self, id: &InstanceId) -> Result<InstanceRecord, HistoryError> {
        let header = self.instance_dir(id)?.join(INSTANCE_FILE);
        if !header.exists() {
            return Err(HistoryError::NotFound(id.clone()));
        }

        let content = fs::read(&header).await?;
        Ok(serde_json::from_slice(&content)?)
    }

    async fn append(&self, id: &InstanceId, event: &HistoryEvent) -> Result<(), HistoryError> {
        let dir = self.instance_dir(id)?;
        if !dir.join(INSTANCE_FILE).exists() {
            return Err(HistoryError::NotFound(id.clone()));
        }

        let path = dir.join(EVENTS_FILE);
        let instance = id.clone();
        let event = event.clone();

        tokio::task::spawn_blocking(move || append_locked(&path, &instance, &event)).await?
    }

    async fn read(&self, id: &InstanceId) -> Result<Vec<HistoryEvent>, HistoryError> {
        let dir = self.instance_dir(id)?;
        if !dir.join(INSTANCE_FILE).exists() {
            return Err(HistoryError::NotFound(id.clone()));
        }

        let path = dir.join(EVENTS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path).await?;
        let (events, _) = parse_journal(&content)?;
        Ok(events)
    }

    async fn list(&self) -> Result<Vec<InstanceId>, HistoryError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() && entry.path().join(INSTANCE_FILE).exists() {
                match entry.file_name().to_str().map(str::parse::<InstanceId>) {
                    Some(Ok(id)) => ids.push(id),
                    _ => debug!(path = %entry.path().display(), "Skipping foreign directory"),
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

/// Append under an exclusive file lock, fsync before returning
fn append_locked(path: &Path, instance: &InstanceId, event: &HistoryEvent) -> Result<(), HistoryError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;

    file.lock_exclusive()?;
    let result = append_to_open_file(&mut file, instance, event);
    let unlock = file.unlock();

    result?;
    unlock?;
    Ok(())
}

fn append_to_open_file(
    file: &mut std::fs::File,
    instance: &InstanceId,
    event: &HistoryEvent,
) -> Result<(), HistoryError> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut content)?;

    let (events, valid_len) = parse_journal(&content)?;

    let expected = events.len() as u64;
    if event.seq != expected {
        return Err(HistoryError::SequenceMismatch {
            instance: instance.clone(),
            expected,
            actual: event.seq,
        });
    }

    if valid_len < content.len() {
        warn!(%instance, dropped = content.len() - valid_len, "Truncating torn journal tail");
        file.set_len(valid_len as u64)?;
    }

    let mut line = serde_json::to_string(event)?;
    line.push('\n');

    file.seek(SeekFrom::Start(valid_len as u64))?;
    file.write_all(line.as_bytes())?;
    file.flush()?;
    file.sync_data()?;

    debug!(%instance, seq = event.seq, kind = event.label(), "History event appended");
    Ok(())
}

/// Parse a journal, returning the events and the byte length they occupy.
///
/// A final line without a newline that fails to parse is a torn write and
/// is excluded; any other malformed line is an error.
fn parse_journal(content: &str) -> Result<(Vec<HistoryEvent>, usize), HistoryError> {
    let mut events = Vec::new();
    let mut offset = 0usize;

    for raw in content.split_inclusive('\n') {
        let complete = raw.ends_with('\n');
        let line = raw.trim();

        if line.is_empty() {
            offset += raw.len();
            continue;
        }

        match serde_json::from_str::<HistoryEvent>(line) {
            Ok(event) if complete => {
                events.push(event);
                offset += raw.len();
            }
            // Parsed but unterminated: the newline never made it to disk
            Ok(_) => break,
            Err(_) if !complete => break,
            Err(e) => return Err(HistoryError::Serialization(e)),
        }
    }

    Ok((events, offset))
}

/// In-memory history log with the same append semantics
#[derive(Default)]
pub struct InMemoryHistoryLog {
    instances: Mutex<HashMap<InstanceId, (InstanceRecord, Vec<HistoryEvent>)>>,
}

impl InMemoryHistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<InstanceId, (InstanceRecord, Vec<HistoryEvent>)>> {
        // A poisoned map still holds consistent data: every mutation is a single push
        self.instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl HistoryLog for InMemoryHistoryLog {
    async fn create(&self, record: &InstanceRecord) -> Result<(), HistoryError> {
        let mut instances = self.lock();
        if instances.contains_key(&record.id) {
            return Err(HistoryError::AlreadyExists(record.id.clone()));
        }
        instances.insert(record.id.clone(), (record.clone(), Vec::new()));
        Ok(())
    }

    async fn instance(&self, id: &InstanceId) -> Result<InstanceRecord, HistoryError> {
        self.lock()
            .get(id)
            .map(|(record, _)| record.clone())
            .ok_or_else(|| HistoryError::NotFound(id.clone()))
    }

    async fn append(&self, id: &InstanceId, event: &HistoryEvent) -> Result<(), HistoryError> {
        let mut instances = self.lock();
        let (_, events) = instances
            .get_mut(id)
            .ok_or_else(|| HistoryError::NotFound(id.clone()))?;

        let expected = events.len() as u64;
        if event.seq != expected {
            return Err(HistoryError::SequenceMismatch {
                instance: id.clone(),
                expected,
                actual: event.seq,
            });
        }

        events.push(event.clone());
        Ok(())
    }

    async fn read(&self, id: &InstanceId) -> Result<Vec<HistoryEvent>, HistoryError> {
        self.lock()
            .get(id)
            .map(|(_, events)| events.clone())
            .ok_or_else(|| HistoryError::NotFound(id.clone()))
    }

    async fn list(&self) -> Result<Vec<InstanceId>, HistoryError> {
        let mut ids: Vec<InstanceId> = self.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
