//! Task implementations and the registry that names them.
//!
//! A task is a pure function `input -> output | error` with no access to
//! coordinator or history state. Implementations are swapped by registering
//! a different one under the same name.

pub mod analysis;
pub mod image;
pub mod report;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::store::ResultStore;

pub use analysis::{AnalyzeColors, AnalyzeMetadata, AnalyzeObjects, AnalyzeText};
pub use report::{GenerateReport, StoreResults};

/// Errors a task can report
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Will fail the same way on every attempt
    #[error("{0}")]
    Permanent(String),

    /// Worth retrying (transport, contention, unavailable dependency)
    #[error("transient: {0}")]
    Transient(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl TaskError {
    /// Whether the dispatcher may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

/// A named unit of work run by the worker pool
#[async_trait]
pub trait Task: Send + Sync {
    /// Name the task is registered under
    fn name(&self) -> &str;

    /// Run the task
    async fn execute(&self, input: Value) -> Result<Value, TaskError>;
}

/// Mapping from task name to implementation
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task under its own name, replacing any previous one
    pub fn register(&mut self, task: Arc<dyn Task>) -> &mut Self {
        self.tasks.insert(task.name().to_string(), task);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registry with every task the image analyzer workflow schedules
    pub fn image_analysis(store: Arc<dyn ResultStore>) -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(AnalyzeColors))
            .register(Arc::new(AnalyzeObjects))
            .register(Arc::new(AnalyzeText))
            .register(Arc::new(AnalyzeMetadata))
            .register(Arc::new(GenerateReport))
            .register(Arc::new(StoreResults::new(store)));
        registry
    }
}

/// Task built from a closure; handy for wiring stubs
pub struct FnTask<F> {
    name: String,
    func: F,
}

impl<F> FnTask<F>
where
    F: Fn(Value) -> Result<Value, TaskError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> Task for FnTask<F>
where
    F: Fn(Value) -> Result<Value, TaskError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: Value) -> Result<Value, TaskError> {
        (self.func)(input)
    }
}
