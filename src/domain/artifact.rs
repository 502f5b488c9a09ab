//! Source artifacts handed to a workflow by a trigger.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// An uploaded image, as delivered by a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInput {
    /// Artifact path, e.g. "images/photo.jpg"
    pub blob_name: String,

    /// Raw file content
    pub blob_bytes: Vec<u8>,

    /// Size in KiB rounded to 2 decimals
    pub blob_size_kb: f64,
}

impl ImageInput {
    pub fn new(blob_name: impl Into<String>, blob_bytes: Vec<u8>) -> Self {
        let blob_size_kb = round_to(blob_bytes.len() as f64 / 1024.0, 2);
        Self {
            blob_name: blob_name.into(),
            blob_bytes,
            blob_size_kb,
        }
    }

    /// Read an artifact from disk
    pub async fn from_file(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read image: {}", path.display()))?;

        let name = path
            .file_name()
            .map(|n| format!("images/{}", n.to_string_lossy()))
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self::new(name, bytes))
    }

    /// Last path segment of the blob name
    pub fn file_name(&self) -> &str {
        file_name_of(&self.blob_name)
    }
}

/// Last '/'-separated segment of a blob path
pub fn file_name_of(blob_name: &str) -> &str {
    blob_name.rsplit('/').next().unwrap_or(blob_name)
}

/// Round to a fixed number of decimals
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
