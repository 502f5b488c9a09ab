//! In-memory test harness.
//!
//! Pairs [`InMemoryHistoryLog`](crate::core::InMemoryHistoryLog) and
//! [`InMemoryResultStore`](crate::store::InMemoryResultStore) with a
//! dispatcher that only records what it was asked to run, so tests decide
//! when and in what order completions arrive.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;

use crate::core::Dispatcher;
use crate::domain::{
    Analyses, ColorAnalysis, CorrelationId, DetectedObject, DominantColor, InstanceId,
    MetadataAnalysis, ObjectAnalysis, Rgb, TaskDescriptor, TextAnalysis,
};

/// Dispatcher that records every request and runs nothing
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<(InstanceId, TaskDescriptor)>>,
    acknowledged: Mutex<Vec<(InstanceId, CorrelationId)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(InstanceId, TaskDescriptor)>> {
        self.dispatched.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every dispatch so far, in call order
    pub fn dispatched(&self) -> Vec<(InstanceId, TaskDescriptor)> {
        self.entries().clone()
    }

    pub fn count(&self) -> usize {
        self.entries().len()
    }

    /// Dispatches of one task name
    pub fn count_of(&self, task_name: &str) -> usize {
        self.entries()
            .iter()
            .filter(|(_, t)| t.task_name == task_name)
            .count()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Results the coordinator reported as consumed, in call order
    pub fn acknowledged(&self) -> Vec<(InstanceId, CorrelationId)> {
        self.acknowledged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, instance_id: &InstanceId, task: TaskDescriptor) -> Result<()> {
        self.entries().push((instance_id.clone(), task));
        Ok(())
    }

    fn acknowledge(&self, instance_id: &InstanceId, correlation_id: CorrelationId) {
        self.acknowledged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((instance_id.clone(), correlation_id));
    }
}

/// Analyses of a 2x2 reddish PPM image
pub fn sample_analyses() -> Analyses {
    Analyses {
        colors: ColorAnalysis {
            dominant_colors: vec![DominantColor {
                hex: "#e02000".to_string(),
                rgb: Rgb { r: 224, g: 32, b: 0 },
                percentage: 75.0,
            }],
            is_grayscale: false,
            total_pixels_sampled: 4,
            note: None,
        },
        objects: ObjectAnalysis {
            objects: vec![DetectedObject {
                name: "digital image".to_string(),
                confidence: 0.99,
            }],
            object_count: 1,
            note: None,
        },
        text: TextAnalysis {
            has_text: false,
            extracted_text: String::new(),
            confidence: 0.0,
            language: "unknown".to_string(),
            note: None,
        },
        metadata: MetadataAnalysis {
            width: 2,
            height: 2,
            format: "PPM".to_string(),
            mode: "RGB".to_string(),
            total_pixels: 4,
            megapixels: 0.0,
            size_kb: 0.01,
            aspect_ratio: "2:2".to_string(),
            has_exif_data: false,
            exif_data: BTreeMap::new(),
        },
    }
}
