//! Sequential tail of the image workflow: build the record, then store it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::domain::{Analyses, FinalRecord, ReceiptStatus, StoreReceipt};
use crate::store::ResultStore;

use super::{Task, TaskError};

/// Input of `generate_report`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportInput {
    /// Id the record is stored under (the instance id)
    pub record_id: String,
    pub blob_name: String,
    pub analyses: Analyses,
}

/// Combine the four analyses into a [`FinalRecord`]
pub struct GenerateReport;

impl GenerateReport {
    pub const NAME: &'static str = "generate_report";
}

#[async_trait]
impl Task for GenerateReport {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, input: Value) -> Result<Value, TaskError> {
        let input: ReportInput = serde_json::from_value(input)?;
        let record = FinalRecord::completed(
            input.record_id,
            &input.blob_name,
            Utc::now(),
            &input.analyses,
        );
        info!(record_id = %record.id, file = %record.file_name, "Report generated");
        Ok(serde_json::to_value(record)?)
    }
}

/// Persist a [`FinalRecord`] and report a receipt
pub struct StoreResults {
    store: Arc<dyn ResultStore>,
}

impl StoreResults {
    pub const NAME: &'static str = "store_results";

    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Task for StoreResults {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, input: Value) -> Result<Value, TaskError> {
        let record: FinalRecord = serde_json::from_value(input)?;

        let (status, error) = match self.store.put(&record.id, &record).await {
            Ok(()) => {
                info!(record_id = %record.id, "Results stored");
                (ReceiptStatus::Stored, None)
            }
            Err(e) => {
                warn!(record_id = %record.id, error = %e, "Failed to store results");
                (ReceiptStatus::Error, Some(e.to_string()))
            }
        };

        let receipt = StoreReceipt {
            id: record.id,
            file_name: record.file_name,
            status,
            analyzed_at: record.analyzed_at,
            summary: record.summary,
            error,
        };
        Ok(serde_json::to_value(receipt)?)
    }
}
