//! Crash Recovery Integration Tests
//!
//! Simulates a coordinator restart by building a second coordinator over the
//! same on-disk history and checking what it re-dispatches.

use std::sync::Arc;

use imgflow::core::{
    Completion, Coordinator, HistoryLog, JsonlHistoryLog, RunOutcome, Workflow, WorkflowContext,
    WorkflowError,
};
use imgflow::domain::{CorrelationId, EventKind, HistoryEvent, InstanceId, TaskCall};
use imgflow::harness::RecordingDispatcher;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

struct FourWay;

impl Workflow for FourWay {
    fn name(&self) -> &str {
        "four_way"
    }

    fn execute(&self, ctx: &mut WorkflowContext<'_>, input: &Value) -> Result<Value, WorkflowError> {
        let calls = ["w", "x", "y", "z"]
            .iter()
            .map(|name| TaskCall::new(*name, input.clone()))
            .collect();
        Ok(json!(ctx.schedule_all(calls)?))
    }
}

fn coordinator(dir: &TempDir) -> (Coordinator, Arc<RecordingDispatcher>) {
    let history = Arc::new(JsonlHistoryLog::new(dir.path().join("instances")));
    let dispatcher = Arc::new(RecordingDispatcher::new());
    (
        Coordinator::new(Arc::new(FourWay), history, dispatcher.clone()),
        dispatcher,
    )
}

fn done(id: &InstanceId, cid: u64, task: &str) -> Completion {
    Completion::completed(id.clone(), CorrelationId(cid), task, json!(task.to_uppercase()))
}

#[tokio::test]
async fn test_restart_redispatches_only_unfinished_task() {
    let temp = TempDir::new().unwrap();

    let id = {
        let (first, _) = coordinator(&temp);
        let (id, _) = first.start(json!({"blob": "a.png"})).await.unwrap();
        for (cid, task) in [(0, "w"), (1, "x"), (3, "z")] {
            first.on_worker_result(done(&id, cid, task)).await.unwrap();
        }
        id
    };

    // Fresh process: same files, empty in-flight state
    let (second, dispatcher) = coordinator(&temp);
    let outcome = second.run(&id).await.unwrap();

    assert_eq!(outcome, RunOutcome::Suspended { pending: 1 });
    assert_eq!(dispatcher.count(), 1);
    assert_eq!(dispatcher.count_of("y"), 1);

    let (_, task) = &dispatcher.dispatched()[0];
    assert_eq!(task.correlation_id, CorrelationId(2));
    assert!(!task.newly_scheduled);

    let outcome = second.on_worker_result(done(&id, 2, "y")).await.unwrap();
    assert_eq!(
        outcome,
        Some(RunOutcome::Completed(json!(["W", "X", "Y", "Z"])))
    );
}

#[tokio::test]
async fn test_restart_before_any_dispatch_reissues_all() {
    let temp = TempDir::new().unwrap();

    // Crash between creating the instance and its first turn
    let id = {
        let (first, _) = coordinator(&temp);
        first.create_instance(json!({})).await.unwrap()
    };

    let (second, dispatcher) = coordinator(&temp);
    let outcome = second.run(&id).await.unwrap();

    assert_eq!(outcome, RunOutcome::Suspended { pending: 4 });
    assert_eq!(dispatcher.count(), 4);
    assert_eq!(second.history().read(&id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_torn_write_is_recovered_on_restart() {
    let temp = TempDir::new().unwrap();

    let id = {
        let (first, _) = coordinator(&temp);
        let (id, _) = first.start(json!({})).await.unwrap();
        first.on_worker_result(done(&id, 0, "w")).await.unwrap();
        id
    };

    // Half-written completion for "x" at the end of the journal
    let events_path = temp
        .path()
        .join("instances")
        .join(id.as_str())
        .join("events.jsonl");
    let mut file = OpenOptions::new().append(true).open(&events_path).await.unwrap();
    file.write_all(br#"{"seq":5,"timestamp":"2024-01-01T00:00:00Z","kind":{"type":"task_comp"#)
        .await
        .unwrap();
    file.flush().await.unwrap();

    let (second, dispatcher) = coordinator(&temp);
    let outcome = second.run(&id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Suspended { pending: 3 });
    assert_eq!(dispatcher.count_of("x"), 1);

    // The next append replaces the torn line
    second.on_worker_result(done(&id, 1, "x")).await.unwrap();
    let history = JsonlHistoryLog::new(temp.path().join("instances"));
    let events = history.read(&id).await.unwrap();
    assert_eq!(events.len(), 6);
    assert!(events.iter().enumerate().all(|(i, e)| e.seq == i as u64));
    assert!(matches!(
        events.last().map(|e: &HistoryEvent| &e.kind),
        Some(EventKind::TaskCompleted { task_name, .. }) if task_name == "x"
    ));
}
