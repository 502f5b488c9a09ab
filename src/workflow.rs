//! The `image_analyzer` workflow definition.
//!
//! Fan out four analyses over the same image, fan their typed results back
//! in, then build the report and store it. The workflow's result is the
//! store receipt.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use crate::core::{Workflow, WorkflowContext, WorkflowError};
use crate::domain::{
    Analyses, Analysis, FinalRecord, ImageInput, InstanceRecord, StoreReceipt, TaskCall,
    WorkflowFailure,
};
use crate::tasks::report::ReportInput;

pub const WORKFLOW_NAME: &str = "image_analyzer";

pub const ANALYZE_COLORS: &str = "analyze_colors";
pub const ANALYZE_OBJECTS: &str = "analyze_objects";
pub const ANALYZE_TEXT: &str = "analyze_text";
pub const ANALYZE_METADATA: &str = "analyze_metadata";
pub const GENERATE_REPORT: &str = "generate_report";
pub const STORE_RESULTS: &str = "store_results";

/// Every task the workflow schedules
pub const TASK_NAMES: [&str; 6] = [
    ANALYZE_COLORS,
    ANALYZE_OBJECTS,
    ANALYZE_TEXT,
    ANALYZE_METADATA,
    GENERATE_REPORT,
    STORE_RESULTS,
];

/// Analyze one uploaded image and persist the report
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageAnalyzerWorkflow;

impl ImageAnalyzerWorkflow {
    pub fn new() -> Self {
        Self
    }
}

fn decode<T: DeserializeOwned>(task: &str, value: Value) -> Result<T, WorkflowError> {
    serde_json::from_value(value)
        .map_err(|e| WorkflowError::Failed(format!("Task '{}' returned a malformed result: {}", task, e)))
}

/// Decode one fan-in result and check its tag
fn expect_analysis(task: &str, value: Value, key: &str) -> Result<Analysis, WorkflowError> {
    let analysis: Analysis = decode(task, value)?;
    if analysis.key() != key {
        return Err(WorkflowError::Failed(format!(
            "Task '{}' returned a {} analysis, expected {}",
            task,
            analysis.key(),
            key
        )));
    }
    Ok(analysis)
}

impl Workflow for ImageAnalyzerWorkflow {
    fn name(&self) -> &str {
        WORKFLOW_NAME
    }

    fn execute(&self, ctx: &mut WorkflowContext<'_>, input: &Value) -> Result<Value, WorkflowError> {
        let image: ImageInput = serde_json::from_value(input.clone())?;

        // Log lines are emitted once, on the turn that first reaches them
        if !ctx.is_replaying() {
            info!(instance_id = %ctx.instance_id(), blob = %image.blob_name, "Analysis started");
        }

        let fan_out = [
            (ANALYZE_COLORS, "colors"),
            (ANALYZE_OBJECTS, "objects"),
            (ANALYZE_TEXT, "text"),
            (ANALYZE_METADATA, "metadata"),
        ];
        let calls = fan_out
            .iter()
            .map(|(task, _)| TaskCall::new(*task, input.clone()))
            .collect();
        let results = ctx.schedule_all(calls)?;

        let entries = fan_out
            .iter()
            .zip(results)
            .map(|((task, key), value)| expect_analysis(task, value, key))
            .collect::<Result<Vec<_>, _>>()?;
        let analyses = Analyses::from_entries(entries)
            .ok_or_else(|| WorkflowError::Failed("Incomplete analysis set".to_string()))?;
        if !ctx.is_replaying() {
            info!(instance_id = %ctx.instance_id(), "All analyses complete, generating report");
        }

        let report_input = ReportInput {
            record_id: ctx.instance_id().to_string(),
            blob_name: image.blob_name,
            analyses,
        };
        let report: FinalRecord = ctx.schedule_typed(GENERATE_REPORT, &report_input)?;

        let receipt = ctx.schedule(STORE_RESULTS, serde_json::to_value(&report)?)?;
        // Validate the receipt shape before it becomes the instance output
        let _: StoreReceipt = decode(STORE_RESULTS, receipt.clone())?;
        Ok(receipt)
    }

    fn failure_record(
        &self,
        instance: &InstanceRecord,
        failure: &WorkflowFailure,
    ) -> Option<FinalRecord> {
        let blob_name = instance
            .input
            .get("blob_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        Some(FinalRecord::failed(
            instance.id.to_string(),
            blob_name,
            Utc::now(),
            failure.clone(),
        ))
    }
}
