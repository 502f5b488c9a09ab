//! Replay-driven orchestration coordinator.
//!
//! `run` is the only place that decides what happens next for an instance:
//! it reads history, replays the workflow, appends whatever the turn
//! produced and dispatches outstanding tasks. Worker results enter through
//! `on_worker_result`, which records them (first writer wins) and re-runs.
//! Both hold a per-instance lock so one instance never runs concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    EventKind, HistoryEvent, InstanceId, InstanceRecord, WorkflowFailure, WorkflowInstance,
};
use crate::store::ResultStore;

use super::context::Workflow;
use super::dispatcher::{Completion, Dispatcher, TaskOutcome};
use super::history::{HistoryError, HistoryLog};
use super::replay::{replay, TurnOutcome};

/// Result of one `run` invocation
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Waiting on `pending` outstanding tasks
    Suspended { pending: usize },

    Completed(Value),

    Failed(WorkflowFailure),
}

impl RunOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Suspended { .. })
    }
}

/// Coordinates instances of one workflow definition
pub struct Coordinator {
    workflow: Arc<dyn Workflow>,
    history: Arc<dyn HistoryLog>,
    dispatcher: Arc<dyn Dispatcher>,
    results: Option<Arc<dyn ResultStore>>,
    locks: LockTable,
}

type LockTable = StdMutex<HashMap<InstanceId, Arc<Mutex<()>>>>;

/// Exclusive hold on one instance; the table entry goes away with the last holder
struct InstanceGuard<'a> {
    table: &'a LockTable,
    id: InstanceId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.table.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        if locks
            .get(&self.id)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

impl Coordinator {
    pub fn new(
        workflow: Arc<dyn Workflow>,
        history: Arc<dyn HistoryLog>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            workflow,
            history,
            dispatcher,
            results: None,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Store that receives failure records of failed instances
    pub fn with_result_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.results = Some(store);
        self
    }

    pub fn workflow_name(&self) -> &str {
        self.workflow.name()
    }

    pub fn history(&self) -> &Arc<dyn HistoryLog> {
        &self.history
    }

    async fn lock_instance(&self, id: &InstanceId) -> InstanceGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        InstanceGuard {
            table: &self.locks,
            id: id.clone(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    /// Register a new instance with an empty history
    pub async fn create_instance(&self, input: Value) -> Result<InstanceId> {
        let id = InstanceId::generate();
        let record = InstanceRecord::new(id.clone(), self.workflow.name(), input);

        self.history
            .create(&record)
            .await
            .with_context(|| format!("Failed to create instance {}", id))?;

        info!(instance_id = %id, workflow = %self.workflow.name(), "Instance created");
        Ok(id)
    }

    /// Create an instance and run its first turn
    pub async fn start(&self, input: Value) -> Result<(InstanceId, RunOutcome)> {
        let id = self.create_instance(input).await?;
        let outcome = self.run(&id).await?;
        Ok((id, outcome))
    }

    /// Run one turn of an instance
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn run(&self, id: &InstanceId) -> Result<RunOutcome> {
        let _guard = self.lock_instance(id).await;
        self.run_locked(id).await
    }

    async fn run_locked(&self, id: &InstanceId) -> Result<RunOutcome> {
        let record = self
            .history
            .instance(id)
            .await
            .with_context(|| format!("Failed to load instance {}", id))?;

        if record.workflow != self.workflow.name() {
            bail!(
                "Instance {} belongs to workflow '{}', not '{}'",
                id,
                record.workflow,
                self.workflow.name()
            );
        }

        let events = self
            .history
            .read(id)
            .await
            .with_context(|| format!("Failed to read history of {}", id))?;

        if let Some(outcome) = terminal_outcome(&events) {
            debug!("Instance already terminal");
            return Ok(outcome);
        }

        let turn = replay(self.workflow.as_ref(), id, &record.input, &events);
        let mut next_seq = events.len() as u64;

        match turn.outcome {
            TurnOutcome::Suspended => {
                // Every TaskScheduled lands before any dispatch
                for task in turn.newly_scheduled() {
                    let event = HistoryEvent::new(
                        next_seq,
                        EventKind::TaskScheduled {
                            correlation_id: task.correlation_id,
                            task_name: task.task_name.clone(),
                            input_hash: task.input_hash.clone(),
                        },
                    );
                    self.append(id, &event).await?;
                    next_seq += 1;
                }

                let pending = turn.pending.len();
                for task in turn.pending {
                    let name = task.task_name.clone();
                    self.dispatcher
                        .dispatch(id, task)
                        .await
                        .with_context(|| format!("Failed to dispatch task '{}'", name))?;
                }

                debug!(pending, "Instance suspended");
                Ok(RunOutcome::Suspended { pending })
            }
            TurnOutcome::Completed(output) => {
                let event = HistoryEvent::new(
                    next_seq,
                    EventKind::WorkflowCompleted {
                        output: output.clone(),
                    },
                );
                self.append(id, &event).await?;

                info!("Instance completed");
                Ok(RunOutcome::Completed(output))
            }
            TurnOutcome::Failed(failure) => {
                let event = HistoryEvent::new(
                    next_seq,
                    EventKind::WorkflowFailed {
                        failure: failure.clone(),
                    },
                );
                self.append(id, &event).await?;

                warn!(failure = %failure, "Instance failed");
                self.publish_failure(&record, &failure).await;
                Ok(RunOutcome::Failed(failure))
            }
        }
    }

    async fn append(&self, id: &InstanceId, event: &HistoryEvent) -> Result<()> {
        self.history
            .append(id, event)
            .await
            .with_context(|| format!("Failed to append {} to {}", event.label(), id))
    }

    /// Upsert the workflow's failure record; errors never change the outcome
    async fn publish_failure(&self, record: &InstanceRecord, failure: &WorkflowFailure) {
        let Some(store) = &self.results else {
            return;
        };
        let Some(final_record) = self.workflow.failure_record(record, failure) else {
            return;
        };

        match store.put(&final_record.id, &final_record).await {
            Ok(()) => debug!(record_id = %final_record.id, "Failure record stored"),
            Err(e) => warn!(record_id = %final_record.id, error = %e, "Failed to store failure record"),
        }
    }

    /// Record a worker result and re-run the instance.
    ///
    /// Returns `None` when nothing new happened: a duplicate delivery, or a
    /// late result for an instance that is already terminal. The dispatcher
    /// is told the result was consumed whatever the outcome.
    #[instrument(
        skip(self, completion),
        fields(
            instance_id = %completion.instance_id,
            correlation_id = %completion.correlation_id,
            task = %completion.task_name
        )
    )]
    pub async fn on_worker_result(&self, completion: Completion) -> Result<Option<RunOutcome>> {
        let id = completion.instance_id.clone();
        let correlation_id = completion.correlation_id;
        let _guard = self.lock_instance(&id).await;

        let result = self.record_result(completion).await;
        self.dispatcher.acknowledge(&id, correlation_id);
        result
    }

    async fn record_result(&self, completion: Completion) -> Result<Option<RunOutcome>> {
        let id = completion.instance_id.clone();
        let events = self
            .history
            .read(&id)
            .await
            .with_context(|| format!("Failed to read history of {}", id))?;

        let scheduled = events.iter().any(|e| match &e.kind {
            EventKind::TaskScheduled {
                correlation_id,
                task_name,
                ..
            } => *correlation_id == completion.correlation_id && *task_name == completion.task_name,
            _ => false,
        });
        if !scheduled {
            return Err(HistoryError::OrphanCompletion {
                instance: id,
                correlation_id: completion.correlation_id,
                task: completion.task_name,
            }
            .into());
        }

        let duplicate = events
            .iter()
            .any(|e| e.is_task_outcome() && e.correlation_id() == Some(completion.correlation_id));
        if duplicate {
            info!("Duplicate completion ignored");
            return Ok(None);
        }

        let kind = match completion.outcome {
            TaskOutcome::Completed(output) => EventKind::TaskCompleted {
                correlation_id: completion.correlation_id,
                task_name: completion.task_name,
                output,
            },
            TaskOutcome::Failed(error) => EventKind::TaskFailed {
                correlation_id: completion.correlation_id,
                task_name: completion.task_name,
                error,
            },
        };
        let event = HistoryEvent::new(events.len() as u64, kind);
        self.append(&id, &event).await?;

        if events.iter().any(HistoryEvent::is_terminal) {
            debug!("Late result recorded for terminal instance");
            return Ok(None);
        }

        self.run_locked(&id).await.map(Some)
    }

    /// Feed completions into the coordinator until `id` is terminal.
    ///
    /// Completions for other instances arriving on the same channel are
    /// processed along the way.
    pub async fn drive(
        &self,
        id: &InstanceId,
        completions: &mut mpsc::UnboundedReceiver<Completion>,
    ) -> Result<RunOutcome> {
        let mut outcome = self.run(id).await?;

        while !outcome.is_terminal() {
            let completion = completions
                .recv()
                .await
                .ok_or_else(|| anyhow!("Completion channel closed before {} finished", id))?;

            let target = completion.instance_id.clone();
            if let Some(next) = self.on_worker_result(completion).await? {
                if target == *id {
                    outcome = next;
                }
            }
        }

        Ok(outcome)
    }

    /// Process completions for any instance until the channel closes
    pub async fn serve(&self, completions: &mut mpsc::UnboundedReceiver<Completion>) {
        while let Some(completion) = completions.recv().await {
            let target = completion.instance_id.clone();
            match self.on_worker_result(completion).await {
                Ok(Some(RunOutcome::Completed(_))) => info!(instance_id = %target, "Instance completed"),
                Ok(Some(RunOutcome::Failed(failure))) => {
                    warn!(instance_id = %target, failure = %failure, "Instance failed")
                }
                Ok(_) => {}
                Err(e) => warn!(instance_id = %target, error = %e, "Failed to handle completion"),
            }
        }
    }

    /// Current projection of an instance
    pub async fn status(&self, id: &InstanceId) -> Result<WorkflowInstance> {
        let record = self
            .history
            .instance(id)
            .await
            .with_context(|| format!("Failed to load instance {}", id))?;
        let events = self.history.read(id).await?;
        Ok(WorkflowInstance::from_history(record, events))
    }

    /// All instances, newest first
    pub async fn list_instances(&self) -> Result<Vec<WorkflowInstance>> {
        let mut instances = Vec::new();
        for id in self.history.list().await? {
            instances.push(self.status(&id).await?);
        }
        instances.sort_by(|a, b| b.record.created_at.cmp(&a.record.created_at));
        Ok(instances)
    }
}

/// Outcome recorded by a terminal event, if any
fn terminal_outcome(events: &[HistoryEvent]) -> Option<RunOutcome> {
    events.iter().find_map(|e| match &e.kind {
        EventKind::WorkflowCompleted { output } => Some(RunOutcome::Completed(output.clone())),
        EventKind::WorkflowFailed { failure } => Some(RunOutcome::Failed(failure.clone())),
        _ => None,
    })
}
