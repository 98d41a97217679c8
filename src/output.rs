//! Result types produced by the pipeline.
//!
//! Everything here is plain data: `Serialize`/`Deserialize`, no behaviour
//! beyond small derived accessors. A [`RecognitionResult`] is immutable once a
//! provider has produced it; a [`StructuredDocument`] is built in one pass by
//! the orchestrator in [`crate::structure`].

use crate::entities::EntitySet;
use crate::error::ItemError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Recognition ──────────────────────────────────────────────────────────

/// Pixel box of a recognised word plus the top-left corner relative to the
/// image size.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub relative_x: f64,
    pub relative_y: f64,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32, image: ImageSize) -> Self {
        let rel = |v: u32, total: u32| if total == 0 { 0.0 } else { v as f64 / total as f64 };
        Self {
            x,
            y,
            width,
            height,
            relative_x: rel(x, image.width),
            relative_y: rel(y, image.height),
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }
}

/// Cell of the 3×3 grid a text block's center falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    TopLeft,
    TopCenter,
    TopRight,
    MiddleLeft,
    MiddleCenter,
    MiddleRight,
    BottomLeft,
    BottomCenter,
    BottomRight,
    /// Image dimensions were unknown.
    Unknown,
}

impl Position {
    /// Classify a box by its center, with cell borders at 1/3 and 2/3.
    pub fn of(bbox: &BoundingBox, image: ImageSize) -> Self {
        if image.width == 0 || image.height == 0 {
            return Position::Unknown;
        }
        let (cx, cy) = bbox.center();
        let band = |rel: f64| {
            if rel < 1.0 / 3.0 {
                0
            } else if rel < 2.0 / 3.0 {
                1
            } else {
                2
            }
        };
        let col = band(cx / image.width as f64);
        let row = band(cy / image.height as f64);
        match (row, col) {
            (0, 0) => Position::TopLeft,
            (0, 1) => Position::TopCenter,
            (0, _) => Position::TopRight,
            (1, 0) => Position::MiddleLeft,
            (1, 1) => Position::MiddleCenter,
            (1, _) => Position::MiddleRight,
            (_, 0) => Position::BottomLeft,
            (_, 1) => Position::BottomCenter,
            _ => Position::BottomRight,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Position::TopLeft => "top-left",
            Position::TopCenter => "top-center",
            Position::TopRight => "top-right",
            Position::MiddleLeft => "middle-left",
            Position::MiddleCenter => "middle-center",
            Position::MiddleRight => "middle-right",
            Position::BottomLeft => "bottom-left",
            Position::BottomCenter => "bottom-center",
            Position::BottomRight => "bottom-right",
            Position::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// One recognised word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    /// Integer percentage in `0..=100`.
    pub confidence: u8,
    pub bbox: BoundingBox,
    pub position: Position,
    pub block_num: u32,
    pub line_num: u32,
    pub word_num: u32,
}

/// What a recognition engine saw in one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub text: String,
    /// Mean confidence on the `[0, 100]` scale.
    pub confidence: f64,
    pub languages: Vec<String>,
    /// Registry name of the engine that produced this result.
    pub engine: String,
    #[serde(default)]
    pub blocks: Vec<TextBlock>,
    pub image_size: ImageSize,
}

impl RecognitionResult {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Clamp a provider's native confidence to the shared integer scale.
pub(crate) fn percent(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

// ── Structuring ──────────────────────────────────────────────────────────

/// Which evidence last raised a field's confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldSource {
    Model,
    Pattern,
    EntityHint,
}

impl FieldSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldSource::Model => "model",
            FieldSource::Pattern => "pattern",
            FieldSource::EntityHint => "entity-hint",
        }
    }
}

/// Scored value of one schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConfidence {
    pub value: serde_json::Value,
    pub confidence: f64,
    pub source: FieldSource,
    pub needs_validation: bool,
}

impl FieldConfidence {
    /// The record used whenever a field has nothing to show.
    pub fn missing() -> Self {
        Self {
            value: serde_json::Value::Null,
            confidence: 0.0,
            source: FieldSource::Model,
            needs_validation: true,
        }
    }
}

/// Per-field scores plus the review queue for one document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructuredDocument {
    pub fields: BTreeMap<String, FieldConfidence>,
    /// Percentage of fields with a non-empty value, two decimals.
    pub coverage: f64,
    /// Fields needing human review, in schema order.
    pub validation_list: Vec<String>,
}

// ── Pipeline results ─────────────────────────────────────────────────────

/// Everything produced for one image or one PDF page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    /// File name (or caller-supplied label) of the input.
    pub source_name: String,
    /// 1-indexed page for PDF inputs.
    pub page_number: Option<usize>,
    pub recognition: RecognitionResult,
    /// `None` when NLP processing is disabled.
    pub structured: Option<StructuredDocument>,
    pub cleaned_text: Option<String>,
    pub entities: Option<EntitySet>,
    pub schema_title: String,
    /// Messages from recovered sub-steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

/// Result for one input of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub source_name: String,
    pub results: Vec<ProcessingResult>,
    /// Failed pages, or a single entry when the whole input failed.
    pub errors: Vec<ItemError>,
}

impl BatchItem {
    pub fn failed(source_name: impl Into<String>, error: ItemError) -> Self {
        Self {
            source_name: source_name.into(),
            results: Vec::new(),
            errors: vec![error],
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.results.is_empty()
    }
}

/// Aggregate of a sequential batch run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub items: Vec<BatchItem>,
}

impl BatchResult {
    pub fn from_items(items: Vec<BatchItem>) -> Self {
        let successful = items.iter().filter(|i| i.is_success()).count();
        Self {
            total: items.len(),
            successful,
            failed: items.len() - successful,
            items,
        }
    }
}
