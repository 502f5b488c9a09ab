//! Command-line interface for imgflow.
//!
//! Provides commands for submitting images, watching a directory, resuming
//! interrupted instances and inspecting instances and stored results.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;

use crate::config;
use crate::core::{Completion, Coordinator, HistoryLog, JsonlHistoryLog, RunOutcome, WorkerPool};
use crate::domain::{
    EventKind, FinalRecord, ImageInput, InstanceId, InstanceStatus, RecordStatus,
    WorkflowInstance,
};
use crate::ingest::{ImageWatcher, WatcherConfig};
use crate::store::{RecordFilter, ResultStore, SqliteResultStore};
use crate::tasks::TaskRegistry;
use crate::workflow::ImageAnalyzerWorkflow;

/// imgflow - Durable fan-out/fan-in image analysis
#[derive(Parser, Debug)]
#[command(name = "imgflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Analyze one image and wait for the result
    Submit {
        /// Image file
        file: PathBuf,
    },

    /// Watch a directory and analyze every new image
    Watch {
        /// Directory to watch
        dir: PathBuf,

        /// Also submit images already in the directory
        #[arg(long)]
        existing: bool,
    },

    /// Resume an interrupted instance (all running instances if no ID)
    Resume {
        /// Instance ID
        #[arg(value_parser = <InstanceId as std::str::FromStr>::from_str)]
        instance_id: Option<InstanceId>,
    },

    /// Show the status of an instance
    Status {
        /// Instance ID
        #[arg(value_parser = <InstanceId as std::str::FromStr>::from_str)]
        instance_id: InstanceId,
    },

    /// Print the event history of an instance
    History {
        /// Instance ID
        #[arg(value_parser = <InstanceId as std::str::FromStr>::from_str)]
        instance_id: InstanceId,
    },

    /// List instances
    Instances {
        /// Maximum number of instances to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List stored results
    Results {
        /// Maximum number of results to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Only results with this status
        #[arg(short, long, value_enum)]
        status: Option<StatusArg>,

        /// Only results for this file name
        #[arg(short, long)]
        file_name: Option<String>,
    },

    /// Show one stored result as JSON
    #[command(name = "result")]
    Record {
        /// Result ID (same as the instance ID)
        id: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Record status for CLI (maps to RecordStatus)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Completed,
    Failed,
}

impl From<StatusArg> for RecordStatus {
    fn from(s: StatusArg) -> Self {
        match s {
            StatusArg::Completed => RecordStatus::Completed,
            StatusArg::Failed => RecordStatus::Failed,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Submit { file } => submit(&file).await,
            Commands::Watch { dir, existing } => watch(dir, existing).await,
            Commands::Resume { instance_id } => resume(instance_id).await,
            Commands::Status { instance_id } => show_status(&instance_id).await,
            Commands::History { instance_id } => show_history(&instance_id).await,
            Commands::Instances { limit } => list_instances(limit).await,
            Commands::Results {
                limit,
                status,
                file_name,
            } => list_results(limit, status, file_name).await,
            Commands::Record { id } => show_result(&id).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Everything needed to run instances in this process
struct Runtime {
    coordinator: Arc<Coordinator>,
    completions: mpsc::UnboundedReceiver<Completion>,
}

fn open_store() -> Result<Arc<SqliteResultStore>> {
    let path = config::results_db_path()?;
    let store = SqliteResultStore::open(&path)
        .with_context(|| format!("Failed to open result database: {}", path.display()))?;
    Ok(Arc::new(store))
}

fn open_history() -> Result<Arc<dyn HistoryLog>> {
    Ok(Arc::new(JsonlHistoryLog::open_default()?))
}

fn runtime() -> Result<Runtime> {
    let cfg = config::config()?;
    let store: Arc<dyn ResultStore> = open_store()?;

    let registry = Arc::new(TaskRegistry::image_analysis(Arc::clone(&store)));
    let (pool, completions) = WorkerPool::new(registry, cfg.workers.clone());

    let coordinator = Coordinator::new(
        Arc::new(ImageAnalyzerWorkflow::new()),
        open_history()?,
        Arc::new(pool),
    )
    .with_result_store(store);

    Ok(Runtime {
        coordinator: Arc::new(coordinator),
        completions,
    })
}

/// Load an instance and project its state
async fn load_instance(history: &dyn HistoryLog, id: &InstanceId) -> Result<WorkflowInstance> {
    let record = history
        .instance(id)
        .await
        .with_context(|| format!("Instance not found: {}", id))?;
    let events = history.read(id).await?;
    Ok(WorkflowInstance::from_history(record, events))
}

fn print_outcome(id: &InstanceId, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed(output) => {
            match serde_json::to_string_pretty(output) {
                Ok(json) => println!("{}", json),
                Err(_) => println!("{}", output),
            }
            eprintln!("\n[Instance {} completed]", id);
        }
        RunOutcome::Failed(failure) => {
            eprintln!("\n[Instance {} failed: {}]", id, failure);
        }
        RunOutcome::Suspended { pending } => {
            eprintln!("\n[Instance {} waiting on {} task(s)]", id, pending);
        }
    }
}

/// Analyze one image
async fn submit(file: &Path) -> Result<()> {
    let input = ImageInput::from_file(file).await?;
    let mut rt = runtime()?;

    let id = rt
        .coordinator
        .create_instance(serde_json::to_value(&input)?)
        .await?;
    eprintln!("Instance {} created for {}", id, input.blob_name);

    let outcome = rt.coordinator.drive(&id, &mut rt.completions).await?;
    print_outcome(&id, &outcome);

    if matches!(outcome, RunOutcome::Failed(_)) {
        std::process::exit(1);
    }
    Ok(())
}

/// Watch a directory, one instance per new image
async fn watch(dir: PathBuf, existing: bool) -> Result<()> {
    let cfg = config::config()?;
    let watcher = ImageWatcher::new(WatcherConfig::new(&dir, &cfg.watch))?;

    let Runtime {
        coordinator,
        mut completions,
    } = runtime()?;

    // Completions for every instance are handled in the background
    let server = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.serve(&mut completions).await })
    };

    if existing {
        for path in watcher.scan_once().await? {
            submit_path(&coordinator, &path).await;
        }
    }

    let (mut event_rx, handle) = watcher.watch()?;
    println!("Watching {} (Ctrl+C to stop)", dir.display());

    let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        let _ = stop_tx.send(());
    });

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                submit_path(&coordinator, &event.path).await;
            }
            _ = &mut stop_rx => {
                println!();
                println!("Stopping watcher...");
                handle.stop().await?;
                break;
            }
        }
    }

    // Outstanding instances stay Running and can be resumed later
    server.abort();
    Ok(())
}

async fn submit_path(coordinator: &Coordinator, path: &Path) {
    let input = match ImageInput::from_file(path).await {
        Ok(input) => input,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable image");
            return;
        }
    };

    let value = match serde_json::to_value(&input) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to encode image input");
            return;
        }
    };

    match coordinator.start(value).await {
        Ok((id, _)) => println!("Submitted {} as {}", input.blob_name, id),
        Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to start instance"),
    }
}

/// Resume one instance, or every running one
async fn resume(instance_id: Option<InstanceId>) -> Result<()> {
    let mut rt = runtime()?;

    let ids = match instance_id {
        Some(id) => vec![id],
        None => rt
            .coordinator
            .list_instances()
            .await?
            .into_iter()
            .filter(WorkflowInstance::is_running)
            .map(|i| i.record.id)
            .collect(),
    };

    if ids.is_empty() {
        println!("No running instances");
        return Ok(());
    }

    // Re-dispatch every outstanding task first, then wait for each instance
    for id in &ids {
        rt.coordinator.run(id).await?;
    }

    let mut failed = false;
    for id in &ids {
        let outcome = rt.coordinator.drive(id, &mut rt.completions).await?;
        failed |= matches!(outcome, RunOutcome::Failed(_));
        print_outcome(id, &outcome);
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn status_label(status: &InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Running => "running",
        InstanceStatus::Completed { .. } => "completed",
        InstanceStatus::Failed { .. } => "failed",
    }
}

/// Show the status of an instance
async fn show_status(id: &InstanceId) -> Result<()> {
    let history = open_history()?;
    let instance = load_instance(history.as_ref(), id).await?;

    println!("Instance ID: {}", instance.record.id);
    println!("Workflow: {}", instance.record.workflow);
    if let Some(blob) = instance.record.input.get("blob_name").and_then(|v| v.as_str()) {
        println!("Image: {}", blob);
    }
    println!("Status: {}", status_label(&instance.status));
    println!("Created: {}", instance.record.created_at);
    if let Some(completed) = instance.completed_at {
        println!("Finished: {}", completed);
    }
    println!(
        "Tasks: {} scheduled, {} resolved",
        instance.scheduled_count(),
        instance.resolved_count()
    );

    if let InstanceStatus::Failed { failure } = &instance.status {
        println!("Failure: {}", failure);
    }

    Ok(())
}

/// Print the event history of an instance
async fn show_history(id: &InstanceId) -> Result<()> {
    let history = open_history()?;
    history
        .instance(id)
        .await
        .with_context(|| format!("Instance not found: {}", id))?;

    let events = history.read(id).await?;
    if events.is_empty() {
        println!("No events recorded");
        return Ok(());
    }

    println!("{:<5} {:<20} {:<6} {:<18} {}", "SEQ", "EVENT", "ID", "TASK", "TIME");
    println!("{}", "-".repeat(85));

    for event in events {
        let (correlation, task) = match &event.kind {
            EventKind::TaskScheduled {
                correlation_id,
                task_name,
                ..
            }
            | EventKind::TaskCompleted {
                correlation_id,
                task_name,
                ..
            }
            | EventKind::TaskFailed {
                correlation_id,
                task_name,
                ..
            } => (correlation_id.to_string(), task_name.clone()),
            EventKind::WorkflowCompleted { .. } | EventKind::WorkflowFailed { .. } => {
                ("-".to_string(), "-".to_string())
            }
        };

        println!(
            "{:<5} {:<20} {:<6} {:<18} {}",
            event.seq,
            event.label(),
            correlation,
            task,
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f")
        );

        if let EventKind::TaskFailed { error, .. } = &event.kind {
            println!("      error: {}", error);
        }
    }

    Ok(())
}

/// List instances, newest first
async fn list_instances(limit: usize) -> Result<()> {
    let history = open_history()?;

    let mut instances = Vec::new();
    for id in history.list().await? {
        instances.push(load_instance(history.as_ref(), &id).await?);
    }
    instances.sort_by(|a, b| b.record.created_at.cmp(&a.record.created_at));

    if instances.is_empty() {
        println!("No instances found");
        return Ok(());
    }

    println!("{:<38} {:<12} {:<8} {}", "INSTANCE ID", "STATUS", "TASKS", "IMAGE");
    println!("{}", "-".repeat(85));

    for instance in instances.into_iter().take(limit) {
        let image = instance
            .record
            .input
            .get("blob_name")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        println!(
            "{:<38} {:<12} {:<8} {}",
            instance.record.id,
            status_label(&instance.status),
            format!("{}/{}", instance.resolved_count(), instance.scheduled_count()),
            image
        );
    }

    Ok(())
}

fn print_record_row(record: &FinalRecord) {
    let detail = match (&record.summary, &record.failure) {
        (Some(summary), _) => format!(
            "{} {} {}",
            summary.image_size, summary.format, summary.dominant_color
        ),
        (None, Some(failure)) => failure.to_string(),
        (None, None) => String::new(),
    };

    println!(
        "{:<38} {:<10} {:<24} {}",
        record.id,
        record.status.as_str(),
        record.file_name,
        detail
    );
}

/// List stored results, newest first
async fn list_results(
    limit: usize,
    status: Option<StatusArg>,
    file_name: Option<String>,
) -> Result<()> {
    let store = open_store()?;
    let filter = RecordFilter {
        status: status.map(RecordStatus::from),
        file_name,
    };

    let records = store.query(&filter, limit).await?;
    if records.is_empty() {
        println!("No results found");
        return Ok(());
    }

    println!("{:<38} {:<10} {:<24} {}", "ID", "STATUS", "FILE", "DETAIL");
    println!("{}", "-".repeat(95));
    for record in &records {
        print_record_row(record);
    }

    Ok(())
}

/// Show one stored result
async fn show_result(id: &str) -> Result<()> {
    let store = open_store()?;
    let record = store.get(id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("imgflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:       {}", cfg.home.display());
    println!("  Instances:  {}", cfg.instances_dir().display());
    println!("  Results DB: {}", cfg.results_db.display());
    println!();
    println!("Workers:");
    println!("  Pool size:    {}", cfg.workers.pool_size);
    println!("  Task timeout: {}s", cfg.workers.task_timeout.as_secs());
    println!(
        "  Retry:        {} attempts, {}ms initial, {}ms max, x{}",
        cfg.workers.retry.max_attempts,
        cfg.workers.retry.initial_delay_ms,
        cfg.workers.retry.max_delay_ms,
        cfg.workers.retry.backoff_multiplier
    );
    println!();
    println!("Watch:");
    println!("  Extensions:      {}", cfg.watch.extensions.join(", "));
    println!("  Stability delay: {}s", cfg.watch.stability_delay_secs);

    Ok(())
}
