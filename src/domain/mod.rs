//! Domain types for the imgflow coordinator.
//!
//! This module contains the core data structures:
//! - Events: Immutable history entries
//! - Instance: Workflow instances and their status projection
//! - Task: Task calls, descriptors and correlation ids
//! - Artifact: Trigger input
//! - Record: Typed analyses and the final persisted record

pub mod artifact;
pub mod events;
pub mod instance;
pub mod record;
pub mod task;

// Re-export commonly used types
pub use artifact::{file_name_of, round_to, ImageInput};
pub use events::{EventKind, FailureKind, HistoryEvent, WorkflowFailure};
pub use instance::{
    InstanceId, InstanceRecord, InstanceStatus, InvalidInstanceId, WorkflowInstance,
};
pub use record::{
    Analyses, Analysis, ColorAnalysis, DetectedObject, DominantColor, FinalRecord,
    MetadataAnalysis, ObjectAnalysis, ReceiptStatus, RecordStatus, Rgb, StoreReceipt, Summary,
    TextAnalysis,
};
pub use task::{hash_input, CorrelationId, TaskCall, TaskDescriptor};
