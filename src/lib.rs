//! # edgequake-docstruct
//!
//! Turn scanned business documents (invoices, receipts, forms) into
//! schema-defined, confidence-scored JSON.
//!
//! ## Why this crate?
//!
//! Plain OCR hands back a wall of text; a language model alone happily
//! invents values that are not on the page. This crate combines both: a
//! recognition engine reads the page, a generative model maps the text onto
//! a field schema, and every value is scored against what the page actually
//! says. Fields the evidence does not support land on a review list instead
//! of silently flowing into downstream systems.
//!
//! ## Pipeline Overview
//!
//! ```text
//! image / PDF page
//!  │
//!  ├─ 1. Normalize  deskew, then denoise + binarize (or keep color)
//!  ├─ 2. Recognize  current engine of the router (Tesseract, Google Vision)
//!  ├─ 3. Clean      whitespace and noise rules
//!  ├─ 4. Evidence   dates, amounts, phones, e-mails, ids
//!  ├─ 5. Structure  LLM call → JSON object → per-field confidence
//!  └─ 6. Export     raw text, review CSV, structured JSON
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docstruct::{DocumentPipeline, EngineRouter, PipelineConfig, StructureSchema};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = Arc::new(EngineRouter::load("configs/ocr_engines.json").await?);
//!     let schema = StructureSchema::load("configs/structures/origin/invoice.json").await?;
//!     // Structuring provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let pipeline = DocumentPipeline::new(router, schema, PipelineConfig::default())?;
//!
//!     let item = pipeline.process_file("scan.png").await;
//!     for result in &item.results {
//!         if let Some(doc) = &result.structured {
//!             println!("coverage {:.2}%, review: {:?}", doc.coverage, doc.validation_list);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docstruct` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-docstruct = { version = "0.1", default-features = false }
//! ```
//!
//! ## Configuration Files
//!
//! | File | Read by |
//! |------|---------|
//! | `configs/ocr_engines.json` | [`EngineRouter::load`] |
//! | `configs/nlp.json` | [`NlpConfig::load`] |
//! | `configs/llms/init.json` | [`LlmServices::load`] |
//! | `configs/structures/{origin,temp,new}/*.json` | [`SchemaVersions`] |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod entities;
pub mod error;
pub mod export;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod recognition;
pub mod schema;
pub mod scoring;
pub mod stream;
pub mod structure;
pub mod versioning;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{LlmServices, NlpConfig, PageSelection, PipelineConfig, PipelineConfigBuilder, TextCleaning};
pub use convert::DocumentPipeline;
pub use entities::{Entity, EntityExtractor, EntitySet, EntityTagger, TaggedEntity};
pub use error::{DocStructError, ItemError, Recovered};
pub use export::{write_outputs, ExportedFiles};
pub use output::{
    BatchItem, BatchResult, FieldConfidence, FieldSource, Position, ProcessingResult, RecognitionResult,
    StructuredDocument, TextBlock,
};
pub use pipeline::llm::{LlmGenerator, TextGenerator};
pub use pipeline::normalize::NormalizeConfig;
pub use progress::{NoopProgressCallback, ProcessingProgressCallback, ProgressCallback};
pub use recognition::{EngineRouter, EngineSnapshot, EngineStatus};
pub use schema::{FieldSpec, FieldType, StructureSchema};
pub use scoring::ScoringConfig;
pub use stream::process_stream;
pub use structure::{StructureReport, Structurer};
pub use versioning::{CommitReport, LlmRegenerator, SchemaRegenerator, SchemaVersions};
