//! End-to-End Integration Tests
//!
//! Full instances running on the worker pool: a generic
//! fan-out/combine/persist workflow over in-memory storage, and the image
//! analyzer over the JSONL history log and the SQLite result store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use imgflow::core::{
    Coordinator, HistoryLog, InMemoryHistoryLog, JsonlHistoryLog, RetryPolicy, RunOutcome,
    WorkerPool, WorkerSettings, Workflow, WorkflowContext, WorkflowError,
};
use imgflow::domain::{
    Analysis, EventKind, FailureKind, FinalRecord, ImageInput, ReceiptStatus, RecordStatus, Rgb,
    StoreReceipt, TaskCall,
};
use imgflow::harness::sample_analyses;
use imgflow::store::{InMemoryResultStore, RecordFilter, ResultStore, SqliteResultStore};
use imgflow::tasks::image::encode_ppm;
use imgflow::tasks::{FnTask, Task, TaskError, TaskRegistry};
use imgflow::workflow::ImageAnalyzerWorkflow;
use serde_json::{json, Value};
use tempfile::TempDir;

fn settings() -> WorkerSettings {
    WorkerSettings {
        pool_size: 4,
        task_timeout: Duration::from_secs(10),
        retry: RetryPolicy::none(),
    }
}

/// Four parallel steps, then combine, then persist
struct Combine;

impl Workflow for Combine {
    fn name(&self) -> &str {
        "combine_and_persist"
    }

    fn execute(&self, ctx: &mut WorkflowContext<'_>, input: &Value) -> Result<Value, WorkflowError> {
        let calls = ["a", "b", "c", "d"]
            .iter()
            .map(|name| TaskCall::new(*name, input.clone()))
            .collect();
        let parts = ctx.schedule_all(calls)?;

        let report = ctx.schedule("combine", json!(parts))?;
        ctx.schedule("persist", report.clone())?;
        Ok(report)
    }
}

/// Stores its input record and echoes it back
struct Persist {
    store: Arc<InMemoryResultStore>,
}

#[async_trait]
impl Task for Persist {
    fn name(&self) -> &str {
        "persist"
    }

    async fn execute(&self, input: Value) -> Result<Value, TaskError> {
        let record: FinalRecord = serde_json::from_value(input.clone())?;
        self.store
            .put(&record.id, &record)
            .await
            .map_err(|e| TaskError::Transient(e.to_string()))?;
        Ok(input)
    }
}

fn combine_registry(store: Arc<InMemoryResultStore>) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    for (name, output) in [("a", "A"), ("b", "B"), ("c", "C"), ("d", "D")] {
        registry.register(Arc::new(FnTask::new(name, move |input: Value| {
            if input != json!({"name": "x.png", "size": 12}) {
                return Err(TaskError::Permanent(format!("unexpected input {}", input)));
            }
            Ok(json!(output))
        })));
    }
    registry.register(Arc::new(FnTask::new("combine", |input: Value| {
        if input != json!(["A", "B", "C", "D"]) {
            return Err(TaskError::Permanent(format!("unexpected parts {}", input)));
        }
        let analyzed_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let record = FinalRecord::completed("r-1", "images/x.png", analyzed_at, &sample_analyses());
        Ok(serde_json::to_value(record)?)
    })));
    registry.register(Arc::new(Persist { store }));
    registry
}

#[tokio::test]
async fn test_combine_and_persist_runs_to_completion() {
    let store = Arc::new(InMemoryResultStore::new());
    let history = Arc::new(InMemoryHistoryLog::new());
    let (pool, mut completions) =
        WorkerPool::new(Arc::new(combine_registry(store.clone())), settings());

    let coordinator = Coordinator::new(Arc::new(Combine), history.clone(), Arc::new(pool));
    let id = coordinator
        .create_instance(json!({"name": "x.png", "size": 12}))
        .await
        .unwrap();

    let outcome = coordinator.drive(&id, &mut completions).await.unwrap();

    let report = match outcome {
        RunOutcome::Completed(report) => report,
        other => panic!("Expected completion, got {:?}", other),
    };
    assert_eq!(report["id"], "r-1");
    assert_eq!(report["file_name"], "x.png");

    // 4 scheduled + 4 completed + 2 x (scheduled + completed) + workflow completed
    let events = history.read(&id).await.unwrap();
    assert_eq!(events.len(), 13);
    assert!(matches!(
        events.last().map(|e| &e.kind),
        Some(EventKind::WorkflowCompleted { .. })
    ));
    assert_eq!(store.put_count(), 1);
    assert_eq!(store.get("r-1").await.unwrap().status, RecordStatus::Completed);
}

/// Fan out four tasks and collect their outputs
struct FanOut;

impl Workflow for FanOut {
    fn name(&self) -> &str {
        "fan_out"
    }

    fn execute(&self, ctx: &mut WorkflowContext<'_>, input: &Value) -> Result<Value, WorkflowError> {
        let calls = ["p", "q", "r", "s"]
            .iter()
            .map(|name| TaskCall::new(*name, input.clone()))
            .collect();
        Ok(json!(ctx.schedule_all(calls)?))
    }
}

#[tokio::test]
async fn test_rerun_while_results_queued_executes_each_task_once() {
    let executions = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskRegistry::new();
    for name in ["p", "q", "r", "s"] {
        let counter = executions.clone();
        registry.register(Arc::new(FnTask::new(name, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(name))
        })));
    }
    let (pool, mut completions) = WorkerPool::new(Arc::new(registry), settings());
    let pool = Arc::new(pool);
    let coordinator = Coordinator::new(
        Arc::new(FanOut),
        Arc::new(InMemoryHistoryLog::new()),
        pool.clone(),
    );

    let (id, _) = coordinator.start(json!({})).await.unwrap();

    // All four results are waiting in the channel, none recorded yet
    tokio::time::sleep(Duration::from_millis(100)).await;
    coordinator.run(&id).await.unwrap();
    coordinator.run(&id).await.unwrap();

    let outcome = coordinator.drive(&id, &mut completions).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed(json!(["p", "q", "r", "s"])));
    assert_eq!(executions.load(Ordering::SeqCst), 4);
    assert_eq!(pool.in_flight(), 0);
    assert!(completions.try_recv().is_err());
}

struct ImagePipeline {
    _temp: TempDir,
    coordinator: Coordinator,
    completions: tokio::sync::mpsc::UnboundedReceiver<imgflow::core::Completion>,
    history: Arc<JsonlHistoryLog>,
    store: Arc<SqliteResultStore>,
}

fn image_pipeline() -> ImagePipeline {
    let temp = TempDir::new().unwrap();
    let history = Arc::new(JsonlHistoryLog::new(temp.path().join("instances")));
    let store = Arc::new(SqliteResultStore::open(&temp.path().join("results.db")).unwrap());

    let registry = TaskRegistry::image_analysis(store.clone());
    let (pool, completions) = WorkerPool::new(Arc::new(registry), settings());

    let coordinator = Coordinator::new(
        Arc::new(ImageAnalyzerWorkflow::new()),
        history.clone(),
        Arc::new(pool),
    )
    .with_result_store(store.clone());

    ImagePipeline {
        _temp: temp,
        coordinator,
        completions,
        history,
        store,
    }
}

#[tokio::test]
async fn test_image_analyzer_stores_report() {
    let mut p = image_pipeline();

    let red = Rgb { r: 250, g: 10, b: 10 };
    let blue = Rgb { r: 10, g: 10, b: 250 };
    let pixels = [red, red, red, blue];
    let input = ImageInput::new("images/red.ppm", encode_ppm(2, 2, &pixels));

    let id = p
        .coordinator
        .create_instance(serde_json::to_value(&input).unwrap())
        .await
        .unwrap();
    let outcome = p.coordinator.drive(&id, &mut p.completions).await.unwrap();

    let receipt: StoreReceipt = match outcome {
        RunOutcome::Completed(value) => serde_json::from_value(value).unwrap(),
        other => panic!("Expected completion, got {:?}", other),
    };
    assert_eq!(receipt.status, ReceiptStatus::Stored);
    assert_eq!(receipt.id, id.to_string());
    assert_eq!(receipt.file_name, "red.ppm");

    let record = p.store.get(id.as_str()).await.unwrap();
    assert_eq!(record.status, RecordStatus::Completed);
    assert_eq!(record.blob_path, "images/red.ppm");
    assert_eq!(record.analyses.len(), 4);

    let summary = record.summary.unwrap();
    assert_eq!(summary.image_size, "2x2");
    assert_eq!(summary.format, "PPM");
    assert_eq!(summary.dominant_color, "#e00000");
    assert!(!summary.is_grayscale);

    assert_eq!(p.history.read(&id).await.unwrap().len(), 13);
}

fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb(color));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(image)
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageOutputFormat::Png,
        )
        .unwrap();
    bytes
}

#[tokio::test]
async fn test_png_colors_are_sampled() {
    let mut p = image_pipeline();
    let input = ImageInput::new("images/sky.png", png_bytes(64, 48, [40, 90, 230]));

    let id = p
        .coordinator
        .create_instance(serde_json::to_value(&input).unwrap())
        .await
        .unwrap();
    let outcome = p.coordinator.drive(&id, &mut p.completions).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));

    let record = p.store.get(id.as_str()).await.unwrap();
    let summary = record.summary.unwrap();
    assert_eq!(summary.format, "PNG");
    assert_eq!(summary.image_size, "64x48");
    assert_eq!(summary.dominant_color, "#2040e0");
    let sampled = record.analyses.iter().find_map(|a| match a {
        Analysis::Colors(colors) => Some(colors.total_pixels_sampled),
        _ => None,
    });
    assert_eq!(sampled, Some(50 * 48));
}

#[tokio::test]
async fn test_unreadable_image_fails_with_record() {
    let mut p = image_pipeline();
    let input = ImageInput::new("images/notes.png", b"definitely not an image".to_vec());

    let id = p
        .coordinator
        .create_instance(serde_json::to_value(&input).unwrap())
        .await
        .unwrap();
    let outcome = p.coordinator.drive(&id, &mut p.completions).await.unwrap();

    let failure = match outcome {
        RunOutcome::Failed(failure) => failure,
        other => panic!("Expected failure, got {:?}", other),
    };
    assert_eq!(failure.kind, FailureKind::Task);
    assert!(failure.task.as_deref().unwrap_or_default().starts_with("analyze_"));

    let record = p.store.get(id.as_str()).await.unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.file_name, "notes.png");
    assert_eq!(record.failure, Some(failure));

    let failed = p
        .store
        .query(
            &RecordFilter {
                status: Some(RecordStatus::Failed),
                file_name: None,
            },
            10,
        )
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
}
