//! PDF rasterisation: render selected pages to `DynamicImage` via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto the blocking pool so the
//! runtime keeps serving other documents while a large PDF renders.
//!
//! ## Why DPI and a pixel cap?
//!
//! Recognition quality tracks physical resolution, so pages are scaled by
//! `dpi / 72`. The cap keeps an oversized page (A0 drawings, posters) from
//! allocating hundreds of megabytes of pixels.

use crate::config::PipelineConfig;
use crate::error::DocStructError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info};

/// One rendered page: 0-based index and the image, or why it failed.
pub type RenderedPage = (usize, Result<DynamicImage, DocStructError>);

/// Number of pages in a PDF.
pub async fn page_count(pdf_path: &Path, password: Option<&str>) -> Result<usize, DocStructError> {
    let path = pdf_path.to_path_buf();
    let pwd = password.map(str::to_string);
    tokio::task::spawn_blocking(move || {
        let pdfium = bind()?;
        let document = open(&pdfium, &path, pwd.as_deref())?;
        Ok(document.pages().len() as usize)
    })
    .await
    .map_err(|e| DocStructError::Internal(format!("Page count task panicked: {e}")))?
}

/// Rasterise selected pages. A page that fails to render is reported in its
/// slot; only a document that cannot be opened fails the whole call.
pub async fn render_pages(
    pdf_path: &Path,
    config: &PipelineConfig,
    page_indices: &[usize],
) -> Result<Vec<RenderedPage>, DocStructError> {
    let path = pdf_path.to_path_buf();
    let scale = config.dpi as f32 / 72.0;
    let max_pixels = config.max_rendered_pixels as i32;
    let password = config.password.clone();
    let indices = page_indices.to_vec();

    tokio::task::spawn_blocking(move || {
        render_pages_blocking(&path, scale, max_pixels, password.as_deref(), &indices)
    })
    .await
    .map_err(|e| DocStructError::Internal(format!("Render task panicked: {e}")))?
}

/// Bind the pdfium shared library. `PDFIUM_DYNAMIC_LIB_PATH` names a
/// directory to look in first; otherwise the system search path is used.
fn bind() -> Result<Pdfium, DocStructError> {
    let bindings = match std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        Ok(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&dir))
            .or_else(|_| Pdfium::bind_to_system_library()),
        Err(_) => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| DocStructError::Internal(format!("pdfium library not available: {e:?}")))?;
    Ok(Pdfium::new(bindings))
}

fn open<'a>(
    pdfium: &'a Pdfium,
    pdf_path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, DocStructError> {
    pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| DocStructError::UnsupportedInput {
            path: pdf_path.to_path_buf(),
            detail: format!("cannot open PDF: {e:?}"),
        })
}

fn render_pages_blocking(
    pdf_path: &Path,
    scale: f32,
    max_pixels: i32,
    password: Option<&str>,
    page_indices: &[usize],
) -> Result<Vec<RenderedPage>, DocStructError> {
    let pdfium = bind()?;
    let document = open(&pdfium, pdf_path, password)?;
    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(scale)
        .set_maximum_width(max_pixels)
        .set_maximum_height(max_pixels);

    let results = page_indices
        .iter()
        .map(|&idx| {
            let rendered = if idx >= total_pages {
                Err(DocStructError::RenderFailed {
                    page: idx + 1,
                    detail: format!("out of range (document has {total_pages} pages)"),
                })
            } else {
                let failed = |e: PdfiumError| DocStructError::RenderFailed {
                    page: idx + 1,
                    detail: format!("{e:?}"),
                };
                match pages.get(idx as u16) {
                    Ok(page) => page
                        .render_with_config(&render_config)
                        .map(|bitmap| bitmap.as_image())
                        .map_err(failed),
                    Err(e) => Err(failed(e)),
                }
            };
            if let Ok(ref image) = rendered {
                debug!("Rendered page {} → {}x{} px", idx + 1, image.width(), image.height());
            }
            (idx, rendered)
        })
        .collect();

    Ok(results)
}
