//! The workflow-facing side of replay.
//!
//! A workflow procedure talks to the outside world only through
//! [`WorkflowContext::schedule`] and [`WorkflowContext::schedule_all`].
//! Both consult the recorded history first; when an outcome is missing they
//! return [`WorkflowError::Suspend`], which the procedure propagates with
//! `?` so execution unwinds back to the coordinator.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{
    hash_input, CorrelationId, EventKind, FinalRecord, HistoryEvent, InstanceId, InstanceRecord,
    TaskCall, TaskDescriptor, WorkflowFailure,
};

use super::barrier::{BarrierState, PendingBarrier, Slot};

/// Errors that unwind a workflow procedure
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Not an error: an outcome the procedure needs is not recorded yet
    #[error("Workflow suspended awaiting {pending} task(s)")]
    Suspend { pending: usize },

    #[error("Task '{task}' failed: {error}")]
    TaskFailed { task: String, error: String },

    #[error("Nondeterministic replay: {0}")]
    Nondeterminism(String),

    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

/// A deterministic workflow definition.
///
/// `execute` runs from the top on every invocation. It must not read the
/// clock, draw random numbers, or perform I/O; all of that goes through a
/// scheduled task whose recorded result is replayed.
pub trait Workflow: Send + Sync {
    /// Registered name of the workflow
    fn name(&self) -> &str;

    /// The workflow procedure
    fn execute(&self, ctx: &mut WorkflowContext<'_>, input: &Value) -> Result<Value, WorkflowError>;

    /// Record to publish when an instance of this workflow fails
    fn failure_record(
        &self,
        _instance: &InstanceRecord,
        _failure: &WorkflowFailure,
    ) -> Option<FinalRecord> {
        None
    }
}

/// Recorded outcome of one task
#[derive(Debug, Clone, Copy)]
enum Outcome<'h> {
    Completed(&'h Value),
    Failed { seq: u64, error: &'h str },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ScheduledEntry<'h> {
    correlation_id: CorrelationId,
    task_name: &'h str,
    input_hash: &'h str,
}

/// Lookup tables over a history prefix
#[derive(Debug, Default)]
pub(crate) struct HistoryIndex<'h> {
    /// TaskScheduled events in the order they were recorded
    scheduled: Vec<ScheduledEntry<'h>>,
    /// First recorded outcome per correlation id
    outcomes: HashMap<CorrelationId, Outcome<'h>>,
}

impl<'h> HistoryIndex<'h> {
    pub(crate) fn build(history: &'h [HistoryEvent]) -> Self {
        let mut index = Self::default();

        for event in history {
            match &event.kind {
                EventKind::TaskScheduled {
                    correlation_id,
                    task_name,
                    input_hash,
                } => index.scheduled.push(ScheduledEntry {
                    correlation_id: *correlation_id,
                    task_name: task_name.as_str(),
                    input_hash: input_hash.as_str(),
                }),
                EventKind::TaskCompleted {
                    correlation_id,
                    output,
                    ..
                } => {
                    index
                        .outcomes
                        .entry(*correlation_id)
                        .or_insert(Outcome::Completed(output));
                }
                EventKind::TaskFailed {
                    correlation_id,
                    error,
                    ..
                } => {
                    index.outcomes.entry(*correlation_id).or_insert(Outcome::Failed {
                        seq: event.seq,
                        error: error.as_str(),
                    });
                }
                EventKind::WorkflowCompleted { .. } | EventKind::WorkflowFailed { .. } => {}
            }
        }

        index
    }

    pub(crate) fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }
}

/// Cursor over an instance's history for one replay pass
pub struct WorkflowContext<'h> {
    instance_id: &'h InstanceId,
    index: HistoryIndex<'h>,
    /// Position of the next schedule call; doubles as its correlation id
    next_position: u64,
    /// Tasks the current turn is waiting on
    pending: Vec<TaskDescriptor>,
}

impl<'h> WorkflowContext<'h> {
    pub fn new(instance_id: &'h InstanceId, history: &'h [HistoryEvent]) -> Self {
        Self {
            instance_id,
            index: HistoryIndex::build(history),
            next_position: 0,
            pending: Vec::new(),
        }
    }

    /// Id of the instance being executed (stable across replays)
    pub fn instance_id(&self) -> &InstanceId {
        self.instance_id
    }

    /// Whether the cursor is still inside recorded history
    pub fn is_replaying(&self) -> bool {
        (self.next_position as usize) < self.index.scheduled_len()
    }

    /// Schedule one task and return its output
    pub fn schedule(&mut self, task_name: &str, input: Value) -> Result<Value, WorkflowError> {
        let mut outputs = self.schedule_all(vec![TaskCall::new(task_name, input)])?;
        outputs
            .pop()
            .ok_or_else(|| WorkflowError::Failed(format!("Task '{}' produced no output", task_name)))
    }

    /// Schedule one task with typed input and output
    pub fn schedule_typed<I, O>(&mut self, task_name: &str, input: &I) -> Result<O, WorkflowError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let output = self.schedule(task_name, serde_json::to_value(input)?)?;
        Ok(serde_json::from_value(output)?)
    }

    /// Fan out a set of tasks and fan their results back in, in input order
    pub fn schedule_all(&mut self, calls: Vec<TaskCall>) -> Result<Vec<Value>, WorkflowError> {
        let mut barrier = PendingBarrier::with_capacity(calls.len());
        let mut waiting = Vec::new();

        for call in calls {
            let position = self.next_position;
            self.next_position += 1;

            let correlation_id = CorrelationId(position);
            let input_hash = hash_input(&call.input);
            let newly_scheduled = self.check_recorded(position, &call, &input_hash)?;

            let slot = match self.index.outcomes.get(&correlation_id) {
                Some(Outcome::Completed(output)) => Slot::Completed((*output).clone()),
                Some(Outcome::Failed { seq, error }) => Slot::Failed {
                    seq: *seq,
                    error: (*error).to_string(),
                },
                None => {
                    waiting.push(TaskDescriptor {
                        correlation_id,
                        task_name: call.name.clone(),
                        input: call.input,
                        input_hash,
                        newly_scheduled,
                    });
                    Slot::Waiting
                }
            };

            barrier.push(correlation_id, call.name, slot);
        }

        match barrier.resolve() {
            BarrierState::Satisfied(outputs) => Ok(outputs),
            BarrierState::Failed { task_name, error } => Err(WorkflowError::TaskFailed {
                task: task_name,
                error,
            }),
            BarrierState::Waiting { unresolved } => {
                self.pending.extend(waiting);
                Err(WorkflowError::Suspend {
                    pending: unresolved.len(),
                })
            }
        }
    }

    /// Compare a call against the TaskScheduled event at the same position.
    /// Returns true when the position is beyond recorded history.
    fn check_recorded(
        &self,
        position: u64,
        call: &TaskCall,
        input_hash: &str,
    ) -> Result<bool, WorkflowError> {
        let Some(entry) = self.index.scheduled.get(position as usize) else {
            return Ok(true);
        };

        if entry.correlation_id != CorrelationId(position)
            || entry.task_name != call.name
            || entry.input_hash != input_hash
        {
            return Err(WorkflowError::Nondeterminism(format!(
                "position {} recorded task '{}' {} (input {}), replay scheduled '{}' (input {})",
                position,
                entry.task_name,
                entry.correlation_id,
                entry.input_hash,
                call.name,
                input_hash
            )));
        }

        Ok(false)
    }

    pub(crate) fn issued(&self) -> u64 {
        self.next_position
    }

    pub(crate) fn recorded(&self) -> u64 {
        self.index.scheduled_len() as u64
    }

    pub(crate) fn take_pending(&mut self) -> Vec<TaskDescriptor> {
        std::mem::take(&mut self.pending)
    }
}
