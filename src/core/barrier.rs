//! Fan-out/fan-in barrier.
//!
//! A barrier tracks a set of tasks scheduled together. Results are indexed
//! by each task's position in the set, never by arrival order, so the
//! fan-in is ordered by input regardless of which worker finishes first.

use serde_json::Value;

use crate::domain::CorrelationId;

/// Resolution state of one slot in a barrier
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// No outcome recorded yet
    Waiting,

    /// Completed with an output
    Completed(Value),

    /// Failed; `seq` is the history position of the TaskFailed event
    Failed { seq: u64, error: String },
}

/// Outcome of evaluating a barrier against history
#[derive(Debug, Clone, PartialEq)]
pub enum BarrierState {
    /// Every task completed; outputs in input order
    Satisfied(Vec<Value>),

    /// At least one task failed; the earliest recorded failure wins
    Failed {
        task_name: String,
        error: String,
    },

    /// Some tasks are still outstanding
    Waiting { unresolved: Vec<CorrelationId> },
}

/// Transient coordinator-local state of one fan-out step
#[derive(Debug, Clone)]
pub struct PendingBarrier {
    /// Correlation ids in input order
    ids: Vec<CorrelationId>,
    task_names: Vec<String>,
    slots: Vec<Slot>,
}

impl PendingBarrier {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: Vec::with_capacity(capacity),
            task_names: Vec::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Add the next task in input order
    pub fn push(&mut self, id: CorrelationId, task_name: impl Into<String>, slot: Slot) {
        self.ids.push(id);
        self.task_names.push(task_name.into());
        self.slots.push(slot);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids that have no outcome yet, in input order
    pub fn unresolved(&self) -> Vec<CorrelationId> {
        self.ids
            .iter()
            .zip(&self.slots)
            .filter(|(_, slot)| matches!(slot, Slot::Waiting))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Evaluate the barrier.
    ///
    /// Fail-fast: any recorded failure fails the barrier even while
    /// siblings are still outstanding.
    pub fn resolve(self) -> BarrierState {
        let first_failure = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Failed { seq, error } => Some((index, *seq, error)),
                _ => None,
            })
            .min_by_key(|(_, seq, _)| *seq);

        if let Some((index, _, error)) = first_failure {
            return BarrierState::Failed {
                task_name: self.task_names[index].clone(),
                error: error.clone(),
            };
        }

        let unresolved = self.unresolved();
        if !unresolved.is_empty() {
            return BarrierState::Waiting { unresolved };
        }

        let outputs = self
            .slots
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Completed(value) => Some(value),
                _ => None,
            })
            .collect();

        BarrierState::Satisfied(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_satisfied_keeps_input_order() {
        let mut barrier = PendingBarrier::with_capacity(3);
        barrier.push(CorrelationId(0), "a", Slot::Completed(json!("A")));
        barrier.push(CorrelationId(1), "b", Slot::Completed(json!("B")));
        barrier.push(CorrelationId(2), "c", Slot::Completed(json!("C")));

        assert_eq!(
            barrier.resolve(),
            BarrierState::Satisfied(vec![json!("A"), json!("B"), json!("C")])
        );
    }

    #[test]
    fn test_waiting_lists_unresolved() {
        let mut barrier = PendingBarrier::with_capacity(3);
        barrier.push(CorrelationId(0), "a", Slot::Waiting);
        barrier.push(CorrelationId(1), "b", Slot::Completed(json!(1)));
        barrier.push(CorrelationId(2), "c", Slot::Waiting);

        assert_eq!(barrier.len(), 3);
        assert_eq!(
            barrier.resolve(),
            BarrierState::Waiting {
                unresolved: vec![CorrelationId(0), CorrelationId(2)]
            }
        );
    }

    #[test]
    fn test_fail_fast_with_outstanding_siblings() {
        let mut barrier = PendingBarrier::with_capacity(3);
        barrier.push(CorrelationId(0), "a", Slot::Waiting);
        barrier.push(
            CorrelationId(1),
            "b",
            Slot::Failed { seq: 5, error: "bad".to_string() },
        );
        barrier.push(CorrelationId(2), "c", Slot::Waiting);

        assert_eq!(
            barrier.resolve(),
            BarrierState::Failed {
                task_name: "b".to_string(),
                error: "bad".to_string()
            }
        );
    }

    #[test]
    fn test_earliest_recorded_failure_wins() {
        let mut barrier = PendingBarrier::with_capacity(2);
        barrier.push(
            CorrelationId(0),
            "a",
            Slot::Failed { seq: 9, error: "late".to_string() },
        );
        barrier.push(
            CorrelationId(1),
            "b",
            Slot::Failed { seq: 6, error: "early".to_string() },
        );

        match barrier.resolve() {
            BarrierState::Failed { task_name, error, .. } => {
                assert_eq!(task_name, "b");
                assert_eq!(error, "early");
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }
}
