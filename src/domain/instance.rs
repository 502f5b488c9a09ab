//! Workflow instances and their state projection.
//!
//! An instance's status is never stored on its own: it is derived by
//! folding the instance history, the same way on every read.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::events::{EventKind, HistoryEvent, WorkflowFailure};

/// Opaque instance identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a fresh random id (trigger side only, never inside a workflow)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id can name a directory on its own: non-empty and made
    /// of ASCII letters, digits, `-` and `_` only
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_ID_LEN
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }
}

const MAX_ID_LEN: usize = 128;

/// Rejected instance id from outside the process
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid instance id '{0}': expected letters, digits, '-' or '_'")]
pub struct InvalidInstanceId(pub String);

impl FromStr for InstanceId {
    type Err = InvalidInstanceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Self(s.to_string());
        if id.is_well_formed() {
            Ok(id)
        } else {
            Err(InvalidInstanceId(s.to_string()))
        }
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable creation-time facts about an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,

    /// Name of the workflow definition that runs this instance
    pub workflow: String,

    /// Trigger payload, handed unmodified to the workflow procedure
    pub input: Value,

    pub created_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(id: InstanceId, workflow: impl Into<String>, input: Value) -> Self {
        Self {
            id,
            workflow: workflow.into(),
            input,
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle status of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum InstanceStatus {
    Running,
    Completed { output: Value },
    Failed { failure: WorkflowFailure },
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self::Running
    }
}

/// An instance with its history and derived status
#[derive(Debug, Clone)]
pub struct WorkflowInstance {
    pub record: InstanceRecord,
    pub status: InstanceStatus,
    pub history: Vec<HistoryEvent>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Project the instance state from its history
    pub fn from_history(record: InstanceRecord, history: Vec<HistoryEvent>) -> Self {
        let mut instance = Self {
            record,
            status: InstanceStatus::Running,
            history: Vec::new(),
            completed_at: None,
        };

        for event in &history {
            instance.apply_event(event);
        }
        instance.history = history;

        instance
    }

    fn apply_event(&mut self, event: &HistoryEvent) {
        // Terminal status is sticky; late task outcomes never reopen it
        if !self.is_running() {
            return;
        }

        match &event.kind {
            EventKind::WorkflowCompleted { output } => {
                self.status = InstanceStatus::Completed {
                    output: output.clone(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventKind::WorkflowFailed { failure } => {
                self.status = InstanceStatus::Failed {
                    failure: failure.clone(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventKind::TaskScheduled { .. }
            | EventKind::TaskCompleted { .. }
            | EventKind::TaskFailed { .. } => {}
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.record.id
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, InstanceStatus::Running)
    }

    /// Number of tasks scheduled so far
    pub fn scheduled_count(&self) -> usize {
        self.history
            .iter()
            .filter(|e| matches!(e.kind, EventKind::TaskScheduled { .. }))
            .count()
    }

    /// Number of tasks that have a recorded outcome
    pub fn resolved_count(&self) -> usize {
        self.history.iter().filter(|e| e.is_task_outcome()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::CorrelationId;
    use serde_json::json;

    fn record() -> InstanceRecord {
        InstanceRecord::new(InstanceId::from("inst-1"), "image_analyzer", json!({}))
    }

    #[test]
    fn test_instance_id_parsing() {
        let generated = InstanceId::generate();
        assert!(generated.is_well_formed());
        assert_eq!(generated.as_str().parse::<InstanceId>(), Ok(generated.clone()));
        assert!("inst_1-a".parse::<InstanceId>().is_ok());

        for bad in ["", "..", "../etc", "a/b", "a\\b", "/tmp/x", "inst 1", "caf\u{e9}"] {
            assert_eq!(
                bad.parse::<InstanceId>(),
                Err(InvalidInstanceId(bad.to_string())),
                "{:?} should be rejected",
                bad
            );
        }
        assert!("x".repeat(129).parse::<InstanceId>().is_err());
    }

    #[test]
    fn test_instance_from_empty_history() {
        let instance = WorkflowInstance::from_history(record(), Vec::new());
        assert!(instance.is_running());
        assert_eq!(instance.scheduled_count(), 0);
    }

    #[test]
    fn test_instance_from_history() {
        let history = vec![
            HistoryEvent::new(
                0,
                EventKind::TaskScheduled {
                    correlation_id: CorrelationId(0),
                    task_name: "a".to_string(),
                    input_hash: "h".to_string(),
                },
            ),
            HistoryEvent::new(
                1,
                EventKind::TaskCompleted {
                    correlation_id: CorrelationId(0),
                    task_name: "a".to_string(),
                    output: json!(1),
                },
            ),
            HistoryEvent::new(2, EventKind::WorkflowCompleted { output: json!(1) }),
        ];

        let instance = WorkflowInstance::from_history(record(), history);
        assert_eq!(instance.status, InstanceStatus::Completed { output: json!(1) });
        assert_eq!(instance.scheduled_count(), 1);
        assert_eq!(instance.resolved_count(), 1);
        assert!(instance.completed_at.is_some());
    }

    #[test]
    fn test_late_outcome_does_not_reopen() {
        let failure = WorkflowFailure::task("a", "bad");
        let history = vec![
            HistoryEvent::new(0, EventKind::WorkflowFailed { failure: failure.clone() }),
            HistoryEvent::new(
                1,
                EventKind::TaskCompleted {
                    correlation_id: CorrelationId(1),
                    task_name: "b".to_string(),
                    output: json!(null),
                },
            ),
        ];

        let instance = WorkflowInstance::from_history(record(), history);
        assert_eq!(instance.status, InstanceStatus::Failed { failure });
    }
}
