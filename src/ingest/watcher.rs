//! Image directory watcher.
//!
//! Watches a directory for new image files and emits an event once a file
//! has stopped changing. Each distinct file content is emitted once per
//! process.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::WatchSettings;

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Invalid extension pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub watch_path: PathBuf,

    /// How long a file must be stable before it is emitted (seconds)
    pub stability_delay_secs: u64,

    /// Accepted extensions, without the dot
    pub extensions: Vec<String>,
}

impl WatcherConfig {
    pub fn new(watch_path: impl Into<PathBuf>, settings: &WatchSettings) -> Self {
        Self {
            watch_path: watch_path.into(),
            stability_delay_secs: settings.stability_delay_secs,
            extensions: settings.extensions.clone(),
        }
    }

    /// Check if the watch path exists
    pub fn validate(&self) -> Result<(), WatcherError> {
        if !self.watch_path.is_dir() {
            return Err(WatcherError::DirectoryNotFound(self.watch_path.clone()));
        }
        Ok(())
    }
}

/// A new image file that has settled
#[derive(Debug, Clone)]
pub struct ImageFileEvent {
    pub path: PathBuf,

    /// SHA256 of the content (12 hex chars)
    pub hash: String,

    pub size: u64,

    pub detected_at: DateTime<Utc>,
}

/// File name filter built from extension globs (`*.png`, ...)
#[derive(Debug, Clone)]
pub struct ImageFilter {
    patterns: Vec<Pattern>,
}

impl ImageFilter {
    pub fn new(extensions: &[String]) -> Result<Self, WatcherError> {
        let patterns = extensions
            .iter()
            .map(|ext| Pattern::new(&format!("*.{}", ext.trim_start_matches('.'))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, path: &Path) -> bool {
        let options = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::new()
        };

        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| self.patterns.iter().any(|p| p.matches_with(name, options)))
            .unwrap_or(false)
    }
}

/// Watches one directory for image files
pub struct ImageWatcher {
    config: WatcherConfig,
    filter: ImageFilter,
}

impl ImageWatcher {
    pub fn new(config: WatcherConfig) -> Result<Self, WatcherError> {
        let filter = ImageFilter::new(&config.extensions)?;
        Ok(Self { config, filter })
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Matching files already present, sorted by path
    pub async fn scan_once(&self) -> Result<Vec<PathBuf>> {
        self.config.validate()?;

        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.watch_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !self.filter.matches(&path) {
                continue;
            }
            match entry.metadata().await {
                Ok(m) if m.is_file() && m.len() > 0 => found.push(path),
                _ => continue,
            }
        }

        found.sort();
        Ok(found)
    }

    /// Watch the directory and emit events for new stable files.
    /// Runs until stopped through the returned handle.
    pub fn watch(&self) -> Result<(mpsc::Receiver<ImageFileEvent>, WatchHandle)> {
        self.config.validate()?;

        let (event_tx, event_rx) = mpsc::channel::<ImageFileEvent>(100);
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);

        let config = self.config.clone();
        let filter = self.filter.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_watcher(config, filter, event_tx, stop_rx).await {
                tracing::error!(error = %e, "Watcher error");
            }
        });

        Ok((
            event_rx,
            WatchHandle {
                stop_tx,
                task: handle,
            },
        ))
    }
}

/// Handle to control the watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}

/// SHA256 of a file's content, first 12 hex chars
pub async fn compute_file_hash(path: &Path) -> Result<String, std::io::Error> {
    let content = tokio::fs::read(path).await?;
    let digest = Sha256::digest(&content);
    Ok(hex::encode(digest)[..12].to_string())
}

/// Internal watcher loop
async fn run_watcher(
    config: WatcherConfig,
    filter: ImageFilter,
    event_tx: mpsc::Sender<ImageFileEvent>,
    mut stop_rx: mpsc::Receiver<()>,
) -> Result<()> {
    // path -> (size, last change seen)
    let mut pending: HashMap<PathBuf, (u64, Instant)> = HashMap::new();
    let mut emitted: HashSet<String> = HashSet::new();

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_millis(500), tx)?;
    debouncer
        .watcher()
        .watch(&config.watch_path, RecursiveMode::NonRecursive)?;

    let stability_delay = Duration::from_secs(config.stability_delay_secs);
    tracing::info!(path = %config.watch_path.display(), "Watching for images");

    loop {
        if stop_rx.try_recv().is_ok() {
            tracing::info!("Watcher stopping");
            break;
        }

        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(Ok(events)) => {
                for event in events {
                    if !filter.matches(&event.path) {
                        continue;
                    }
                    if let Ok(metadata) = std::fs::metadata(&event.path) {
                        if metadata.is_file() {
                            pending.insert(event.path, (metadata.len(), Instant::now()));
                        }
                    }
                }
            }
            Ok(Err(e)) => tracing::warn!(error = ?e, "Watch backend error"),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                tracing::error!("Watcher channel disconnected");
                break;
            }
        }

        let now = Instant::now();
        let mut stable = Vec::new();
        for (path, (last_size, last_seen)) in pending.iter_mut() {
            if now.duration_since(*last_seen) < stability_delay {
                continue;
            }
            match std::fs::metadata(path) {
                Ok(m) if m.len() == *last_size && m.len() > 0 => stable.push((path.clone(), m.len())),
                // Still being written; restart the clock
                Ok(m) => {
                    *last_size = m.len();
                    *last_seen = now;
                }
                Err(_) => stable.push((path.clone(), 0)),
            }
        }

        for (path, size) in stable {
            pending.remove(&path);
            if size == 0 {
                continue;
            }

            match compute_file_hash(&path).await {
                Ok(hash) if emitted.insert(hash.clone()) => {
                    tracing::info!(path = %path.display(), %hash, "New image detected");
                    let event = ImageFileEvent {
                        path,
                        hash,
                        size,
                        detected_at: Utc::now(),
                    };
                    if event_tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(_) => tracing::debug!(path = %path.display(), "Image content already submitted"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to hash image"),
            }
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}
