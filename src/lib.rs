//! imgflow - Durable fan-out/fan-in image analysis
//!
//! A replay-driven workflow coordinator. Workflows are ordinary procedures
//! written against a `schedule` primitive; every decision they make is
//! rebuilt from an append-only history, so an instance survives crashes and
//! restarts without re-running completed work.
//!
//! # Architecture
//!
//! - All facts about an instance are recorded as immutable history events
//! - Each turn replays the workflow from the start against that history
//! - Outstanding tasks run on a bounded worker pool; their results are
//!   appended (first writer wins) and trigger the next turn
//!
//! # Modules
//!
//! - `core`: History log, replay, fan-in barrier, worker pool, coordinator
//! - `domain`: Events, instances, task descriptors, analysis records
//! - `tasks`: Image analysis tasks and the task registry
//! - `store`: Result store (SQLite and in-memory)
//! - `workflow`: The `image_analyzer` workflow definition
//! - `ingest`: Directory watcher trigger
//! - `harness`: In-memory doubles for tests
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Analyze one image
//! imgflow submit photo.png
//!
//! # Analyze every new image dropped into a directory
//! imgflow watch ./inbox
//!
//! # Finish instances interrupted by a crash
//! imgflow resume
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod harness;
pub mod ingest;
pub mod store;
pub mod tasks;
pub mod workflow;

// Re-export main types at crate root for convenience
pub use core::{Coordinator, RunOutcome, Workflow, WorkflowContext, WorkflowError};
pub use domain::{EventKind, FinalRecord, HistoryEvent, ImageInput, InstanceId};
pub use ingest::{ImageFileEvent, ImageWatcher, WatcherConfig};
pub use store::{InMemoryResultStore, ResultStore, SqliteResultStore};
pub use workflow::ImageAnalyzerWorkflow;
