//! Image ingestion.
//!
//! The watcher monitors a directory and emits one event per new, settled
//! image file. The `watch` command turns each event into a workflow
//! instance.

pub mod watcher;

pub use watcher::{ImageFileEvent, ImageFilter, ImageWatcher, WatchHandle, WatcherConfig, WatcherError};
