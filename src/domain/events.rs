//! History events for the replay-driven coordinator.
//!
//! Every fact about a workflow instance is recorded as an immutable event in
//! an append-only log. Sequence numbers are dense and gap-free per instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::task::CorrelationId;

/// A single entry in an instance's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Position in the instance history (0-based, gap-free)
    pub seq: u64,

    /// When the event was recorded (informational only, never replayed)
    pub timestamp: DateTime<Utc>,

    /// What happened
    pub kind: EventKind,
}

impl HistoryEvent {
    /// Create an event at the given position with the current timestamp
    pub fn new(seq: u64, kind: EventKind) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Correlation id of the task this event refers to, if any
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match &self.kind {
            EventKind::TaskScheduled { correlation_id, .. }
            | EventKind::TaskCompleted { correlation_id, .. }
            | EventKind::TaskFailed { correlation_id, .. } => Some(*correlation_id),
            EventKind::WorkflowCompleted { .. } | EventKind::WorkflowFailed { .. } => None,
        }
    }

    /// Whether this event resolves a task (completion or failure)
    pub fn is_task_outcome(&self) -> bool {
        matches!(
            self.kind,
            EventKind::TaskCompleted { .. } | EventKind::TaskFailed { .. }
        )
    }

    /// Whether this event ends the instance
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::WorkflowCompleted { .. } | EventKind::WorkflowFailed { .. }
        )
    }

    /// Short label for logs and CLI output
    pub fn label(&self) -> &'static str {
        match self.kind {
            EventKind::TaskScheduled { .. } => "task_scheduled",
            EventKind::TaskCompleted { .. } => "task_completed",
            EventKind::TaskFailed { .. } => "task_failed",
            EventKind::WorkflowCompleted { .. } => "workflow_completed",
            EventKind::WorkflowFailed { .. } => "workflow_failed",
        }
    }
}

/// Kinds of history events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A task was handed to the dispatcher
    TaskScheduled {
        correlation_id: CorrelationId,
        task_name: String,
        /// Hash of the serialized task input, checked on every replay
        input_hash: String,
    },

    /// A worker reported success
    TaskCompleted {
        correlation_id: CorrelationId,
        task_name: String,
        output: Value,
    },

    /// A worker reported a permanent failure
    TaskFailed {
        correlation_id: CorrelationId,
        task_name: String,
        error: String,
    },

    /// The workflow procedure returned a value
    WorkflowCompleted { output: Value },

    /// The workflow failed (task error, nondeterminism or malformed payload)
    WorkflowFailed { failure: WorkflowFailure },
}

/// Why an instance failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    /// Category of the failure
    pub kind: FailureKind,

    /// Task responsible, when the failure came from a task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    /// Human-readable reason
    pub message: String,
}

impl WorkflowFailure {
    pub fn task(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Task,
            task: Some(task.into()),
            message: message.into(),
        }
    }

    pub fn nondeterminism(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Nondeterminism,
            task: None,
            message: message.into(),
        }
    }

    pub fn workflow(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Workflow,
            task: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.task {
            Some(task) => write!(f, "task '{}' failed: {}", task, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// Failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A task reported a permanent error
    Task,

    /// Replay diverged from recorded history
    Nondeterminism,

    /// The workflow procedure itself returned an error
    Workflow,
}
