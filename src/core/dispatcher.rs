//! Task dispatch and the worker pool.
//!
//! The coordinator hands each outstanding task to a [`Dispatcher`] and
//! returns immediately. Outcomes come back later as [`Completion`]s over a
//! single-consumer channel; delivery may be duplicated or reordered.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::domain::{CorrelationId, InstanceId, TaskDescriptor};
use crate::tasks::{Task, TaskError, TaskRegistry};

use super::retry::RetryPolicy;

/// Outcome reported by a worker
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    Failed(String),
}

/// A worker result addressed to one task of one instance
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub instance_id: InstanceId,
    pub correlation_id: CorrelationId,
    pub task_name: String,
    pub outcome: TaskOutcome,
}

impl Completion {
    pub fn completed(
        instance_id: InstanceId,
        correlation_id: CorrelationId,
        task_name: impl Into<String>,
        output: Value,
    ) -> Self {
        Self {
            instance_id,
            correlation_id,
            task_name: task_name.into(),
            outcome: TaskOutcome::Completed(output),
        }
    }

    pub fn failed(
        instance_id: InstanceId,
        correlation_id: CorrelationId,
        task_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            instance_id,
            correlation_id,
            task_name: task_name.into(),
            outcome: TaskOutcome::Failed(error.into()),
        }
    }
}

/// Hands tasks to workers; fire-and-forget from the coordinator's view
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, instance_id: &InstanceId, task: TaskDescriptor) -> Result<()>;

    /// Called once the coordinator has consumed a completion. Until then a
    /// dispatcher may treat the task as still outstanding.
    fn acknowledge(&self, _instance_id: &InstanceId, _correlation_id: CorrelationId) {}
}

/// Worker pool tuning
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Maximum tasks executing at once
    pub pool_size: usize,

    /// Limit on a single attempt
    pub task_timeout: Duration,

    pub retry: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pool_size: 4,
            task_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

type InFlightKey = (InstanceId, CorrelationId);

/// Runs registered tasks on the tokio runtime with bounded concurrency
pub struct WorkerPool {
    registry: Arc<TaskRegistry>,
    settings: WorkerSettings,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl WorkerPool {
    /// Create a pool and the receiving end of its completion channel
    pub fn new(
        registry: Arc<TaskRegistry>,
        settings: WorkerSettings,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Self {
            permits: Arc::new(Semaphore::new(settings.pool_size.max(1))),
            registry,
            settings,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            completions: tx,
        };
        (pool, rx)
    }

    /// Tasks dispatched in this process and not yet acknowledged
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

fn lock(set: &Mutex<HashSet<InFlightKey>>) -> MutexGuard<'_, HashSet<InFlightKey>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Dispatcher for WorkerPool {
    async fn dispatch(&self, instance_id: &InstanceId, task: TaskDescriptor) -> Result<()> {
        let key = (instance_id.clone(), task.correlation_id);
        if !lock(&self.in_flight).insert(key.clone()) {
            debug!(
                instance_id = %instance_id,
                correlation_id = %task.correlation_id,
                task = %task.task_name,
                "Task already in flight, skipping dispatch"
            );
            return Ok(());
        }

        debug!(
            instance_id = %instance_id,
            correlation_id = %task.correlation_id,
            task = %task.task_name,
            "Dispatching task"
        );

        let registry = Arc::clone(&self.registry);
        let permits = Arc::clone(&self.permits);
        let in_flight = Arc::clone(&self.in_flight);
        let completions = self.completions.clone();
        let settings = self.settings.clone();
        let instance_id = instance_id.clone();

        tokio::spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => match registry.get(&task.task_name) {
                    Some(handler) => run_with_retry(handler, &task, &settings).await,
                    None => TaskOutcome::Failed(format!(
                        "no task registered under '{}'",
                        task.task_name
                    )),
                },
                Err(_) => TaskOutcome::Failed("worker pool shut down".to_string()),
            };

            let completion = Completion {
                instance_id,
                correlation_id: task.correlation_id,
                task_name: task.task_name,
                outcome,
            };
            // The key stays until the coordinator acknowledges the result
            if completions.send(completion).is_err() {
                warn!(key = ?key, "Completion receiver dropped; result discarded");
                lock(&in_flight).remove(&key);
            }
        });

        Ok(())
    }

    fn acknowledge(&self, instance_id: &InstanceId, correlation_id: CorrelationId) {
        lock(&self.in_flight).remove(&(instance_id.clone(), correlation_id));
    }
}

/// Execute a task, retrying transient errors and timeouts
async fn run_with_retry(
    handler: Arc<dyn Task>,
    task: &TaskDescriptor,
    settings: &WorkerSettings,
) -> TaskOutcome {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let started = Instant::now();

        match run_attempt(Arc::clone(&handler), task.input.clone(), settings.task_timeout).await {
            Ok(output) => {
                info!(
                    task = %task.task_name,
                    correlation_id = %task.correlation_id,
                    attempt,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Task completed"
                );
                return TaskOutcome::Completed(output);
            }
            Err(e) if e.is_retryable() && settings.retry.should_retry(attempt) => {
                let delay = settings.retry.delay_for_attempt(attempt);
                warn!(
                    task = %task.task_name,
                    correlation_id = %task.correlation_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Task failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(
                    task = %task.task_name,
                    correlation_id = %task.correlation_id,
                    attempt,
                    error = %e,
                    "Task failed permanently"
                );
                return TaskOutcome::Failed(e.to_string());
            }
        }
    }
}

/// One attempt on its own tokio task so a panic or a timeout cannot leak
async fn run_attempt(
    handler: Arc<dyn Task>,
    input: Value,
    timeout: Duration,
) -> Result<Value, TaskError> {
    let handle = tokio::spawn(async move { handler.execute(input).await });
    let abort = handle.abort_handle();

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(TaskError::Permanent(format!("task panicked: {}", join))),
        Err(_) => {
            abort.abort();
            Err(TaskError::Timeout(timeout))
        }
    }
}
