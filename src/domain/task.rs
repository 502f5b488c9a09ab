//! Task requests and their correlation ids.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Deterministic identifier linking a scheduled task to its outcome.
///
/// Assigned from the position of the `schedule` call in the workflow's
/// execution order, so every replay reproduces the same ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A request to schedule a task, as issued by a workflow procedure
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCall {
    pub name: String,
    pub input: Value,
}

impl TaskCall {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            name: name.into(),
            input,
        }
    }
}

/// A task ready for dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub correlation_id: CorrelationId,
    pub task_name: String,
    pub input: Value,
    /// Hash of `input` as recorded in the TaskScheduled event
    pub input_hash: String,
    /// False when a TaskScheduled event already exists for this id
    pub newly_scheduled: bool,
}

/// Hash a task input (first 16 hex chars of SHA256 over its JSON form).
///
/// `serde_json` writes object keys in sorted order, so equal values hash
/// equally across replays.
pub fn hash_input(input: &Value) -> String {
    let bytes = serde_json::to_vec(input).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_hash_consistency() {
        let a = hash_input(&json!({"blob_name": "x.png", "size": 12}));
        let b = hash_input(&json!({"size": 12, "blob_name": "x.png"}));
        let c = hash_input(&json!({"blob_name": "y.png", "size": 12}));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_correlation_id_display() {
        assert_eq!(CorrelationId(4).to_string(), "#4");
        assert_eq!(serde_json::to_string(&CorrelationId(4)).unwrap(), "4");
    }
}
