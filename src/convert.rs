//! Document processing entry points.
//!
//! A [`DocumentPipeline`] runs one unit of work (an image or one PDF page)
//! through every stage in order:
//!
//! ```text
//! bytes ─▶ decode ─▶ normalize ─▶ PNG ─▶ recognize ─▶ structure
//!                    (color or     │      (snapshot of
//!                     binary,      │       the router)
//!                     per engine)  │
//! ```
//!
//! ## Why one snapshot per unit?
//!
//! The engine choice decides how the image is normalized (Google Vision
//! wants color, Tesseract wants a binary page). Taking the router snapshot
//! once, before normalization, keeps that decision and the recognition call
//! on the same engine even when a switch lands mid-run.
//!
//! ## Failure isolation
//!
//! A fatal error ends its unit of work only. Every page of a PDF is its own
//! unit, and [`DocumentPipeline::process_batch`] records a failed input and
//! moves on; there is no retry anywhere.

use crate::config::PipelineConfig;
use crate::error::{DocStructError, ItemError};
use crate::output::{BatchItem, BatchResult, ProcessingResult};
use crate::pipeline::input::{self, InputKind, LoadedInput};
use crate::pipeline::{encode, llm, normalize, render};
use crate::recognition::EngineRouter;
use crate::schema::StructureSchema;
use crate::structure::Structurer;
use image::DynamicImage;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Recognition plus structuring for one schema.
pub struct DocumentPipeline {
    router: Arc<EngineRouter>,
    structurer: Option<Structurer>,
    schema: StructureSchema,
    config: PipelineConfig,
}

impl std::fmt::Debug for DocumentPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentPipeline")
            .field("engine", &self.router.current_engine())
            .field("structurer", &self.structurer)
            .field("schema", &self.schema.title)
            .field("config", &self.config)
            .finish()
    }
}

impl DocumentPipeline {
    /// Build a pipeline. When NLP processing is enabled the structuring
    /// provider is resolved from `config` now, so a missing API key fails
    /// here rather than on the first document.
    pub fn new(
        router: Arc<EngineRouter>,
        schema: StructureSchema,
        config: PipelineConfig,
    ) -> Result<Self, DocStructError> {
        let structurer = if config.nlp.enabled {
            let generator = llm::resolve_generator(&config)?;
            Some(
                Structurer::new(generator)
                    .with_cleaning(config.nlp.text_cleaning.clone())
                    .with_scoring(config.scoring.clone()),
            )
        } else {
            info!("NLP processing disabled, results carry recognition only");
            None
        };
        Ok(Self {
            router,
            structurer,
            schema,
            config,
        })
    }

    /// Replace the structurer, e.g. to attach an entity tagger.
    pub fn with_structurer(mut self, structurer: Structurer) -> Self {
        self.structurer = Some(structurer);
        self
    }

    pub fn router(&self) -> &Arc<EngineRouter> {
        &self.router
    }

    pub fn schema(&self) -> &StructureSchema {
        &self.schema
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process an encoded image (PNG, JPEG, TIFF, BMP).
    pub async fn process_image_bytes(
        &self,
        bytes: &[u8],
        source_name: &str,
    ) -> Result<ProcessingResult, DocStructError> {
        let image = normalize::decode_image(bytes)?;
        self.process_image(image, source_name, None).await
    }

    /// Process one decoded image or rendered page.
    pub async fn process_image(
        &self,
        image: DynamicImage,
        source_name: &str,
        page_number: Option<usize>,
    ) -> Result<ProcessingResult, DocStructError> {
        let start = Instant::now();
        let snapshot = self.router.snapshot();
        let preserve_color = snapshot.prefers_color();

        let normalize_config = self.config.normalize.clone();
        let normalized = tokio::task::spawn_blocking(move || {
            let normalized = normalize::normalize(&image, preserve_color, &normalize_config)?;
            encode::encode_png(&normalized)
        })
        .await
        .map_err(|e| DocStructError::Internal(format!("Normalization task panicked: {e}")))??;
        debug!(
            "Normalized {source_name} ({} mode) in {}ms",
            if preserve_color { "color" } else { "binary" },
            start.elapsed().as_millis()
        );

        let recognition = snapshot.recognize(&normalized).await?;
        info!(
            "Recognized {source_name}{} with {}: {} chars, confidence {:.1}",
            page_suffix(page_number),
            recognition.engine,
            recognition.text.chars().count(),
            recognition.confidence
        );

        let mut result = ProcessingResult {
            source_name: source_name.to_string(),
            page_number,
            recognition,
            structured: None,
            cleaned_text: None,
            entities: None,
            schema_title: self.schema.title.clone(),
            diagnostics: Vec::new(),
        };

        if let Some(structurer) = &self.structurer {
            let report = structurer.structure_detailed(&result.recognition, &self.schema).await;
            result.structured = Some(report.document);
            result.cleaned_text = Some(report.cleaned_text);
            result.entities = Some(report.entities);
            result.diagnostics = report.diagnostics;
        }

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_page_complete(
                source_name,
                page_number,
                result.structured.as_ref().map(|d| d.coverage),
            );
        }
        Ok(result)
    }

    /// Process raw input bytes: PDFs page by page, anything else as one
    /// image. `source_name` labels the results.
    pub async fn process_bytes(&self, bytes: &[u8], source_name: &str) -> BatchItem {
        match input::sniff(bytes) {
            InputKind::Image => self.image_item(bytes, source_name).await,
            InputKind::Pdf => {
                // pdfium opens files, not buffers; the temp file is deleted on drop.
                let tmp = match write_temp_pdf(bytes) {
                    Ok(tmp) => tmp,
                    Err(e) => return BatchItem::failed(source_name, ItemError::from_error(source_name, None, &e)),
                };
                self.pdf_item(tmp.path(), source_name).await
            }
        }
    }

    /// Read and process one file. Never fails: errors are recorded in the
    /// returned item.
    pub async fn process_file(&self, path: impl AsRef<Path>) -> BatchItem {
        let path = path.as_ref();
        let name = input::display_name(path);
        match input::read_input(path).await {
            Ok(loaded) => self.process_loaded(&loaded).await,
            Err(e) => {
                warn!("Cannot read {}: {e}", path.display());
                BatchItem::failed(&name, ItemError::from_error(&name, None, &e))
            }
        }
    }

    async fn process_loaded(&self, loaded: &LoadedInput) -> BatchItem {
        let name = loaded.name();
        match loaded.kind {
            InputKind::Image => self.image_item(&loaded.bytes, &name).await,
            InputKind::Pdf => self.pdf_item(&loaded.path, &name).await,
        }
    }

    async fn image_item(&self, bytes: &[u8], name: &str) -> BatchItem {
        match self.process_image_bytes(bytes, name).await {
            Ok(result) => BatchItem {
                source_name: name.to_string(),
                results: vec![result],
                errors: Vec::new(),
            },
            Err(e) => {
                warn!("{name} failed: {e}");
                BatchItem::failed(name, ItemError::from_error(name, None, &e))
            }
        }
    }

    async fn pdf_item(&self, pdf_path: &Path, name: &str) -> BatchItem {
        let password = self.config.password.as_deref();
        let total_pages = match render::page_count(pdf_path, password).await {
            Ok(n) => n,
            Err(e) => return BatchItem::failed(name, ItemError::from_error(name, None, &e)),
        };

        let indices = self.config.pages.to_indices(total_pages);
        if indices.is_empty() {
            let e = DocStructError::UnsupportedInput {
                path: pdf_path.to_path_buf(),
                detail: format!("page selection {:?} matches none of {total_pages} pages", self.config.pages),
            };
            return BatchItem::failed(name, ItemError::from_error(name, None, &e));
        }
        debug!("{name}: processing {} of {total_pages} pages", indices.len());

        let rendered = match render::render_pages(pdf_path, &self.config, &indices).await {
            Ok(pages) => pages,
            Err(e) => return BatchItem::failed(name, ItemError::from_error(name, None, &e)),
        };

        let mut item = BatchItem {
            source_name: name.to_string(),
            results: Vec::with_capacity(rendered.len()),
            errors: Vec::new(),
        };
        for (idx, page) in rendered {
            let page_number = idx + 1;
            let outcome = match page {
                Ok(image) => self.process_image(image, name, Some(page_number)).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(result) => item.results.push(result),
                Err(e) => {
                    warn!("{name} page {page_number} failed: {e}");
                    item.errors.push(ItemError::from_error(name, Some(page_number), &e));
                }
            }
        }
        item
    }

    /// Process inputs one after another. A failing input is recorded and the
    /// batch continues.
    pub async fn process_batch(&self, paths: &[PathBuf]) -> BatchResult {
        let total = paths.len();
        let cb = self.config.progress_callback.as_ref();
        if let Some(cb) = cb {
            cb.on_batch_start(total);
        }

        let mut items = Vec::with_capacity(total);
        for (index, path) in paths.iter().enumerate() {
            let name = input::display_name(path);
            if let Some(cb) = cb {
                cb.on_item_start(index, total, &name);
            }
            let item = self.process_file(path).await;
            notify_item(cb, index, total, &item);
            items.push(item);
        }

        let result = BatchResult::from_items(items);
        info!(
            "Batch complete: {}/{} inputs succeeded",
            result.successful, result.total
        );
        if let Some(cb) = cb {
            cb.on_batch_complete(result.total, result.successful);
        }
        result
    }

    /// Release resources held by the structurer.
    pub fn close(&mut self) {
        if let Some(s) = self.structurer.as_mut() {
            s.close();
        }
    }
}

pub(crate) fn notify_item(
    cb: Option<&crate::progress::ProgressCallback>,
    index: usize,
    total: usize,
    item: &BatchItem,
) {
    let Some(cb) = cb else { return };
    match item.errors.first() {
        None => cb.on_item_complete(index, total, &item.source_name, item.results.len()),
        Some(e) => cb.on_item_error(index, total, &item.source_name, &e.cause),
    }
}

fn write_temp_pdf(bytes: &[u8]) -> Result<tempfile::NamedTempFile, DocStructError> {
    let mut tmp = tempfile::Builder::new()
        .suffix(".pdf")
        .tempfile()
        .map_err(|e| DocStructError::Internal(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .map_err(|e| DocStructError::Internal(format!("tempfile write: {e}")))?;
    Ok(tmp)
}

fn page_suffix(page: Option<usize>) -> String {
    page.map(|p| format!(" page {p}")).unwrap_or_default()
}
