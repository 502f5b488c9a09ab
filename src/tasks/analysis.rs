//! The four fan-out analysis tasks.
//!
//! Each takes an [`ImageInput`] and returns one tagged [`Analysis`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{
    round_to, Analysis, ColorAnalysis, DetectedObject, DominantColor, ImageInput,
    MetadataAnalysis, ObjectAnalysis, Rgb, TextAnalysis,
};

use super::image::{inspect, sample_pixels, ImageInfo};
use super::{Task, TaskError};

/// Side of the sampling grid used for color analysis
const SAMPLE_SIDE: u32 = 50;

/// Number of dominant colors reported
const TOP_COLORS: usize = 5;

/// Share of near-gray samples above which an image counts as grayscale
const GRAYSCALE_RATIO: f64 = 0.9;

fn decode_input(input: Value) -> Result<ImageInput, TaskError> {
    Ok(serde_json::from_value(input)?)
}

fn inspect_input(image: &ImageInput) -> Result<ImageInfo, TaskError> {
    inspect(&image.blob_bytes).map_err(|e| {
        TaskError::Permanent(format!("cannot identify image '{}': {}", image.blob_name, e))
    })
}

fn to_output(analysis: Analysis) -> Result<Value, TaskError> {
    Ok(serde_json::to_value(analysis)?)
}

/// Dominant colors from a sampled pixel grid
pub struct AnalyzeColors;

impl AnalyzeColors {
    pub const NAME: &'static str = "analyze_colors";

    pub fn analyze(image: &ImageInput) -> Result<ColorAnalysis, TaskError> {
        inspect_input(image)?;

        // An identified image whose pixels cannot be read still yields a report
        match sample_pixels(&image.blob_bytes, SAMPLE_SIDE) {
            Ok(pixels) => Ok(summarize_colors(&pixels)),
            Err(e) => {
                warn!(blob = %image.blob_name, error = %e, "Color sampling failed");
                Ok(ColorAnalysis {
                    dominant_colors: Vec::new(),
                    is_grayscale: false,
                    total_pixels_sampled: 0,
                    note: Some(e.to_string()),
                })
            }
        }
    }
}

/// Bucket channels to multiples of 32 and rank by frequency
fn summarize_colors(pixels: &[Rgb]) -> ColorAnalysis {
    if pixels.is_empty() {
        return ColorAnalysis {
            dominant_colors: Vec::new(),
            is_grayscale: false,
            total_pixels_sampled: 0,
            note: Some("image has no pixels".to_string()),
        };
    }

    let bucket = |v: u8| v / 32 * 32;

    // First-seen order breaks ties between equally frequent buckets
    let mut order: Vec<Rgb> = Vec::new();
    let mut counts: HashMap<Rgb, usize> = HashMap::new();
    for p in pixels {
        let key = Rgb {
            r: bucket(p.r),
            g: bucket(p.g),
            b: bucket(p.b),
        };
        let count = counts.entry(key).or_insert(0);
        if *count == 0 {
            order.push(key);
        }
        *count += 1;
    }

    let mut ranked: Vec<(Rgb, usize)> = order.into_iter().map(|k| (k, counts[&k])).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    let total = pixels.len();
    let dominant_colors = ranked
        .into_iter()
        .take(TOP_COLORS)
        .map(|(rgb, count)| DominantColor {
            hex: rgb.hex(),
            rgb,
            percentage: round_to(count as f64 / total as f64 * 100.0, 1),
        })
        .collect();

    let gray = pixels
        .iter()
        .filter(|p| {
            (p.r as i16 - p.g as i16).abs() < 30 && (p.g as i16 - p.b as i16).abs() < 30
        })
        .count();

    ColorAnalysis {
        dominant_colors,
        is_grayscale: gray as f64 / total as f64 > GRAYSCALE_RATIO,
        total_pixels_sampled: total,
        note: None,
    }
}

#[async_trait]
impl Task for AnalyzeColors {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, input: Value) -> Result<Value, TaskError> {
        let image = decode_input(input)?;
        debug!(blob = %image.blob_name, "Analyzing colors");
        to_output(Analysis::Colors(Self::analyze(&image)?))
    }
}

/// Object detection stand-in driven by image geometry
pub struct AnalyzeObjects;

impl AnalyzeObjects {
    pub const NAME: &'static str = "analyze_objects";

    pub fn analyze(image: &ImageInput) -> Result<ObjectAnalysis, TaskError> {
        let info = inspect_input(image)?;
        let mut objects = Vec::new();

        let orientation = match info.width.cmp(&info.height) {
            std::cmp::Ordering::Greater => ("landscape", 0.85),
            std::cmp::Ordering::Less => ("portrait", 0.82),
            std::cmp::Ordering::Equal => ("square composition", 0.90),
        };
        objects.push(DetectedObject {
            name: orientation.0.to_string(),
            confidence: orientation.1,
        });

        if info.width as u64 * info.height as u64 > 1_000_000 {
            objects.push(DetectedObject {
                name: "high-resolution scene".to_string(),
                confidence: 0.78,
            });
        }

        objects.push(DetectedObject {
            name: "digital image".to_string(),
            confidence: 0.99,
        });

        Ok(ObjectAnalysis {
            object_count: objects.len(),
            objects,
            note: Some("Mock detection; register a real detector under the same name".to_string()),
        })
    }
}

#[async_trait]
impl Task for AnalyzeObjects {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, input: Value) -> Result<Value, TaskError> {
        let image = decode_input(input)?;
        debug!(blob = %image.blob_name, "Analyzing objects");
        to_output(Analysis::Objects(Self::analyze(&image)?))
    }
}

/// OCR stand-in; never finds text
pub struct AnalyzeText;

impl AnalyzeText {
    pub const NAME: &'static str = "analyze_text";

    pub fn analyze(image: &ImageInput) -> Result<TextAnalysis, TaskError> {
        inspect_input(image)?;
        Ok(TextAnalysis {
            has_text: false,
            extracted_text: String::new(),
            confidence: 0.0,
            language: "unknown".to_string(),
            note: Some("Mock OCR; register a real recognizer under the same name".to_string()),
        })
    }
}

#[async_trait]
impl Task for AnalyzeText {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, input: Value) -> Result<Value, TaskError> {
        let image = decode_input(input)?;
        debug!(blob = %image.blob_name, "Analyzing text");
        to_output(Analysis::Text(Self::analyze(&image)?))
    }
}

/// Header facts and EXIF tags
pub struct AnalyzeMetadata;

impl AnalyzeMetadata {
    pub const NAME: &'static str = "analyze_metadata";

    pub fn analyze(image: &ImageInput) -> Result<MetadataAnalysis, TaskError> {
        let info = inspect_input(image)?;
        let total_pixels = info.width as u64 * info.height as u64;

        Ok(MetadataAnalysis {
            width: info.width,
            height: info.height,
            format: info.format.as_str().to_string(),
            mode: info.mode,
            total_pixels,
            megapixels: round_to(total_pixels as f64 / 1_000_000.0, 2),
            size_kb: image.blob_size_kb,
            aspect_ratio: format!("{}:{}", info.width, info.height),
            has_exif_data: !info.exif.is_empty(),
            exif_data: info.exif,
        })
    }
}

#[async_trait]
impl Task for AnalyzeMetadata {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, input: Value) -> Result<Value, TaskError> {
        let image = decode_input(input)?;
        debug!(blob = %image.blob_name, "Analyzing metadata");
        to_output(Analysis::Metadata(Self::analyze(&image)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::image::encode_ppm;

    fn ppm_input(width: u32, height: u32, pixels: &[Rgb]) -> ImageInput {
        ImageInput::new("images/test.ppm", encode_ppm(width, height, pixels))
    }

    #[test]
    fn test_colors_ranked_by_frequency() {
        let red = Rgb { r: 230, g: 40, b: 10 };
        let gray = Rgb { r: 100, g: 100, b: 100 };
        let input = ppm_input(2, 2, &[red, red, red, gray]);

        let colors = AnalyzeColors::analyze(&input).unwrap();
        assert_eq!(colors.total_pixels_sampled, 4);
        assert_eq!(colors.dominant_colors.len(), 2);
        assert_eq!(colors.dominant_colors[0].hex, "#e02000");
        assert_eq!(colors.dominant_colors[0].percentage, 75.0);
        assert_eq!(colors.dominant_colors[1].rgb, Rgb { r: 96, g: 96, b: 96 });
        assert!(!colors.is_grayscale);
    }

    #[test]
    fn test_grayscale_detection() {
        let light = Rgb { r: 200, g: 205, b: 210 };
        let input = ppm_input(3, 3, &[light; 9]);
        assert!(AnalyzeColors::analyze(&input).unwrap().is_grayscale);
    }

    #[test]
    fn test_top_five_only() {
        let pixels: Vec<Rgb> = (0..8)
            .map(|i| Rgb { r: i * 32, g: 0, b: 0 })
            .collect();
        let input = ppm_input(8, 1, &pixels);
        let colors = AnalyzeColors::analyze(&input).unwrap();
        assert_eq!(colors.dominant_colors.len(), 5);
        assert_eq!(colors.dominant_colors[0].percentage, 12.5);
    }

    #[test]
    fn test_colors_from_png() {
        let image = ::image::RgbImage::from_fn(10, 10, |x, _| {
            if x < 7 {
                ::image::Rgb([20, 200, 40])
            } else {
                ::image::Rgb([250, 250, 250])
            }
        });
        let mut png = Vec::new();
        ::image::DynamicImage::ImageRgb8(image)
            .write_to(
                &mut std::io::Cursor::new(&mut png),
                ::image::ImageOutputFormat::Png,
            )
            .unwrap();

        let colors = AnalyzeColors::analyze(&ImageInput::new("images/a.png", png)).unwrap();
        assert_eq!(colors.total_pixels_sampled, 100);
        assert_eq!(colors.dominant_colors[0].hex, "#00c020");
        assert_eq!(colors.dominant_colors[0].percentage, 70.0);
        assert_eq!(colors.dominant_colors[1].hex, "#e0e0e0");
        assert!(colors.note.is_none());
    }

    #[test]
    fn test_undecodable_pixels_leave_a_note() {
        let mut png = b"\x89PNG\r\n\x1a\n\0\0\0\x0dIHDR".to_vec();
        png.extend_from_slice(&10u32.to_be_bytes());
        png.extend_from_slice(&10u32.to_be_bytes());
        png.extend_from_slice(&[8, 2, 0, 0, 0]);

        let colors = AnalyzeColors::analyze(&ImageInput::new("images/a.png", png)).unwrap();
        assert!(colors.dominant_colors.is_empty());
        assert_eq!(colors.total_pixels_sampled, 0);
        assert!(colors.note.is_some());
    }

    #[test]
    fn test_oversized_header_leaves_a_note() {
        let ppm = b"P6\n4294967295 4294967295\n255\n\0\0\0".to_vec();
        let colors = AnalyzeColors::analyze(&ImageInput::new("images/big.ppm", ppm)).unwrap();
        assert_eq!(colors.total_pixels_sampled, 0);
        assert!(colors.note.unwrap_or_default().contains("too large"));
    }

    #[test]
    fn test_objects_by_orientation() {
        let wide = ppm_input(4, 2, &[Rgb { r: 0, g: 0, b: 0 }; 8]);
        let objects = AnalyzeObjects::analyze(&wide).unwrap();
        assert_eq!(objects.objects[0].name, "landscape");
        assert_eq!(objects.objects.last().map(|o| o.name.as_str()), Some("digital image"));
        assert_eq!(objects.object_count, 2);

        let square = ppm_input(2, 2, &[Rgb { r: 0, g: 0, b: 0 }; 4]);
        assert_eq!(
            AnalyzeObjects::analyze(&square).unwrap().objects[0].name,
            "square composition"
        );
    }

    #[test]
    fn test_metadata() {
        let input = ppm_input(4, 2, &[Rgb { r: 1, g: 2, b: 3 }; 8]);
        let metadata = AnalyzeMetadata::analyze(&input).unwrap();
        assert_eq!(metadata.format, "PPM");
        assert_eq!(metadata.mode, "RGB");
        assert_eq!(metadata.total_pixels, 8);
        assert_eq!(metadata.megapixels, 0.0);
        assert_eq!(metadata.aspect_ratio, "4:2");
        assert!(!metadata.has_exif_data);
        assert_eq!(metadata.size_kb, input.blob_size_kb);
    }

    #[test]
    fn test_unknown_format_is_permanent() {
        let input = ImageInput::new("images/notes.txt", b"not an image".to_vec());
        for result in [
            AnalyzeColors::analyze(&input).map(|_| ()),
            AnalyzeObjects::analyze(&input).map(|_| ()),
            AnalyzeText::analyze(&input).map(|_| ()),
            AnalyzeMetadata::analyze(&input).map(|_| ()),
        ] {
            assert!(matches!(result, Err(TaskError::Permanent(_))));
        }
    }

    #[tokio::test]
    async fn test_task_output_is_tagged() {
        let input = ppm_input(1, 1, &[Rgb { r: 0, g: 0, b: 0 }]);
        let output = AnalyzeText
            .execute(serde_json::to_value(&input).unwrap())
            .await
            .unwrap();
        assert_eq!(output["kind"], "text");
        assert_eq!(output["language"], "unknown");
    }

    #[tokio::test]
    async fn test_malformed_input() {
        let err = AnalyzeMetadata
            .execute(serde_json::json!({"nope": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput(_)));
    }
}
