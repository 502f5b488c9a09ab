//! One deterministic replay pass ("turn") over an instance history.
//!
//! `replay` is pure: it reads history, runs the workflow procedure from the
//! top, and reports what should happen next. Applying that decision
//! (appending events, dispatching tasks) is the coordinator's job.

use serde_json::Value;

use crate::domain::{HistoryEvent, InstanceId, TaskDescriptor, WorkflowFailure};

use super::context::{Workflow, WorkflowContext, WorkflowError};

/// What a replay pass decided
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The procedure is blocked on tasks listed in `Turn::pending`
    Suspended,

    /// The procedure returned a value
    Completed(Value),

    /// The procedure failed
    Failed(WorkflowFailure),
}

/// Result of one replay pass
#[derive(Debug, Clone)]
pub struct Turn {
    pub outcome: TurnOutcome,

    /// Tasks without a recorded outcome (only populated when suspended)
    pub pending: Vec<TaskDescriptor>,
}

impl Turn {
    /// Tasks that still need a TaskScheduled event
    pub fn newly_scheduled(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.pending.iter().filter(|t| t.newly_scheduled)
    }
}

/// Run the workflow procedure against a history prefix
pub fn replay(
    workflow: &dyn Workflow,
    instance_id: &InstanceId,
    input: &Value,
    history: &[HistoryEvent],
) -> Turn {
    let mut ctx = WorkflowContext::new(instance_id, history);
    let result = workflow.execute(&mut ctx, input);

    let issued = ctx.issued();
    let recorded = ctx.recorded();

    let outcome = match result {
        Err(WorkflowError::Nondeterminism(message)) => {
            TurnOutcome::Failed(WorkflowFailure::nondeterminism(message))
        }
        // The procedure stopped short of tasks it scheduled on an earlier pass
        _ if issued < recorded => TurnOutcome::Failed(WorkflowFailure::nondeterminism(format!(
            "history records {} scheduled task(s) but replay issued only {}",
            recorded, issued
        ))),
        Ok(output) => TurnOutcome::Completed(output),
        Err(WorkflowError::Suspend { .. }) => TurnOutcome::Suspended,
        Err(WorkflowError::TaskFailed { task, error }) => {
            TurnOutcome::Failed(WorkflowFailure::task(task, error))
        }
        Err(e) => TurnOutcome::Failed(WorkflowFailure::workflow(e.to_string())),
    };

    let pending = match outcome {
        TurnOutcome::Suspended => ctx.take_pending(),
        _ => Vec::new(),
    };

    Turn { outcome, pending }
}
