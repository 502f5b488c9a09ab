//! Typed task results and the final persisted record.
//!
//! Every analysis task returns one tagged variant of [`Analysis`]; the
//! workflow decodes fan-in results against these schemas so a malformed
//! payload fails at the coordinator boundary instead of at query time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::WorkflowFailure;

/// One analysis result, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Analysis {
    Colors(ColorAnalysis),
    Objects(ObjectAnalysis),
    Text(TextAnalysis),
    Metadata(MetadataAnalysis),
}

impl Analysis {
    /// Key under which this analysis is stored
    pub fn key(&self) -> &'static str {
        match self {
            Self::Colors(_) => "colors",
            Self::Objects(_) => "objects",
            Self::Text(_) => "text",
            Self::Metadata(_) => "metadata",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DominantColor {
    pub hex: String,
    pub rgb: Rgb,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorAnalysis {
    pub dominant_colors: Vec<DominantColor>,
    pub is_grayscale: bool,
    pub total_pixels_sampled: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub name: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectAnalysis {
    pub objects: Vec<DetectedObject>,
    pub object_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextAnalysis {
    pub has_text: bool,
    pub extracted_text: String,
    pub confidence: f64,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataAnalysis {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub mode: String,
    pub total_pixels: u64,
    pub megapixels: f64,
    pub size_kb: f64,
    pub aspect_ratio: String,
    pub has_exif_data: bool,
    #[serde(default)]
    pub exif_data: BTreeMap<String, String>,
}

/// The four analyses of one image, in fan-out order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analyses {
    pub colors: ColorAnalysis,
    pub objects: ObjectAnalysis,
    pub text: TextAnalysis,
    pub metadata: MetadataAnalysis,
}

impl Analyses {
    /// Each analysis as a tagged value, keyed for storage
    pub fn entries(&self) -> Vec<Analysis> {
        vec![
            Analysis::Colors(self.colors.clone()),
            Analysis::Objects(self.objects.clone()),
            Analysis::Text(self.text.clone()),
            Analysis::Metadata(self.metadata.clone()),
        ]
    }

    /// Rebuild from tagged entries; `None` when any kind is missing
    pub fn from_entries(entries: Vec<Analysis>) -> Option<Self> {
        let (mut colors, mut objects, mut text, mut metadata) = (None, None, None, None);
        for entry in entries {
            match entry {
                Analysis::Colors(a) => colors = Some(a),
                Analysis::Objects(a) => objects = Some(a),
                Analysis::Text(a) => text = Some(a),
                Analysis::Metadata(a) => metadata = Some(a),
            }
        }
        Some(Self {
            colors: colors?,
            objects: objects?,
            text: text?,
            metadata: metadata?,
        })
    }

    /// Derive the record summary
    pub fn summary(&self) -> Summary {
        Summary {
            image_size: format!("{}x{}", self.metadata.width, self.metadata.height),
            format: self.metadata.format.clone(),
            dominant_color: self
                .colors
                .dominant_colors
                .first()
                .map(|c| c.hex.clone())
                .unwrap_or_else(|| "N/A".to_string()),
            objects_detected: self.objects.object_count,
            has_text: self.text.has_text,
            is_grayscale: self.colors.is_grayscale,
        }
    }
}

/// Derived summary fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub image_size: String,
    pub format: String,
    pub dominant_color: String,
    pub objects_detected: usize,
    pub has_text: bool,
    pub is_grayscale: bool,
}

/// Status of a persisted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Analyses completed and stored
    Completed,

    /// The workflow failed; see `failure`
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Terminal output of a workflow, as kept by the result store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalRecord {
    pub id: String,
    pub file_name: String,
    pub blob_path: String,
    pub analyzed_at: DateTime<Utc>,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    #[serde(default)]
    pub analyses: Vec<Analysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<WorkflowFailure>,
}

impl FinalRecord {
    /// Record for a successfully analyzed image
    pub fn completed(
        id: impl Into<String>,
        blob_path: &str,
        analyzed_at: DateTime<Utc>,
        analyses: &Analyses,
    ) -> Self {
        Self {
            id: id.into(),
            file_name: super::artifact::file_name_of(blob_path).to_string(),
            blob_path: blob_path.to_string(),
            analyzed_at,
            status: RecordStatus::Completed,
            summary: Some(analyses.summary()),
            analyses: analyses.entries(),
            failure: None,
        }
    }

    /// Record exposing why an instance failed
    pub fn failed(
        id: impl Into<String>,
        blob_path: &str,
        analyzed_at: DateTime<Utc>,
        failure: WorkflowFailure,
    ) -> Self {
        Self {
            id: id.into(),
            file_name: super::artifact::file_name_of(blob_path).to_string(),
            blob_path: blob_path.to_string(),
            analyzed_at,
            status: RecordStatus::Failed,
            summary: None,
            analyses: Vec::new(),
            failure: Some(failure),
        }
    }
}

/// What the store step reports back to the workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreReceipt {
    pub id: String,
    pub file_name: String,
    pub status: ReceiptStatus,
    pub analyzed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Stored,
    Error,
}
