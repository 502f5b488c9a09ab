//! Core orchestration logic.
//!
//! This module contains:
//! - History: Append-only, crash-durable per-instance event log
//! - Context: The `schedule` primitive workflows are written against
//! - Barrier: Order-preserving fan-in with fail-fast
//! - Replay: One deterministic pass over history
//! - Dispatcher: Worker pool with timeouts and retries
//! - Coordinator: Applies replay decisions and handles worker results

pub mod barrier;
pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod history;
pub mod replay;
pub mod retry;

// Re-export commonly used types
pub use barrier::{BarrierState, PendingBarrier, Slot};
pub use context::{Workflow, WorkflowContext, WorkflowError};
pub use coordinator::{Coordinator, RunOutcome};
pub use dispatcher::{Completion, Dispatcher, TaskOutcome, WorkerPool, WorkerSettings};
pub use history::{HistoryError, HistoryLog, InMemoryHistoryLog, JsonlHistoryLog};
pub use replay::{replay, Turn, TurnOutcome};
pub use retry::RetryPolicy;
