//! Result files: raw text, the review queue as CSV, and a JSON dump.
//!
//! Each processed unit gets its own directory:
//!
//! ```text
//! <output-dir>/<base>/
//!   ├─ ocr_raw_text.txt          recognized text as the engine returned it
//!   ├─ validation_list.csv       fields a reviewer must check
//!   └─ <base>_structured.json    structured document + recognition metadata
//! ```
//!
//! `<base>` is the input's file stem, suffixed with `_p<N>` for PDF pages.
//! Every file is written atomically (temp file + rename) so a crash never
//! leaves a half-written CSV next to a complete JSON.

use crate::error::DocStructError;
use crate::output::{FieldConfidence, ProcessingResult, StructuredDocument};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// CSV header of the validation list.
pub const VALIDATION_HEADER: [&str; 5] = ["field", "value", "confidence", "source", "needs_validation"];

/// Paths of the files written for one result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedFiles {
    pub directory: PathBuf,
    pub raw_text: Option<PathBuf>,
    pub validation_list: Option<PathBuf>,
    pub structured_json: PathBuf,
}

/// Write `bytes` to `path` via a sibling temp file and a rename.
///
/// The temp file is flushed to disk before the rename and, on Unix, the
/// directory entry after it. Once this returns, the new content survives a
/// power loss; callers that order writes (`new/` before `temp/` in schema
/// versioning) rely on that.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DocStructError> {
    let failed = |source: std::io::Error| DocStructError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(failed)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
    write_synced(&tmp_path, bytes).await.map_err(failed)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(failed)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        sync_dir(parent).await.map_err(failed)?;
    }
    Ok(())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

// Directories cannot be opened as files on Windows; rename is already
// durable there once the data is synced.
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Base name used for a result's directory and JSON file.
pub fn base_name(result: &ProcessingResult) -> String {
    let stem = Path::new(&result.source_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "result".to_string());
    match result.page_number {
        Some(page) => format!("{stem}_p{page}"),
        None => stem,
    }
}

/// Fields for the review CSV: the validation list in order, or, when it is
/// empty, every field at or below `threshold`.
pub fn review_rows<'a>(doc: &'a StructuredDocument, threshold: f64) -> Vec<(&'a str, &'a FieldConfidence)> {
    if doc.validation_list.is_empty() {
        return doc
            .fields
            .iter()
            .filter(|(_, f)| f.confidence <= threshold)
            .map(|(name, f)| (name.as_str(), f))
            .collect();
    }
    doc.validation_list
        .iter()
        .filter_map(|name| doc.fields.get(name).map(|f| (name.as_str(), f)))
        .collect()
}

/// Render the review CSV.
pub fn validation_csv(doc: &StructuredDocument, threshold: f64) -> Result<Vec<u8>, DocStructError> {
    let csv_err = |e: csv::Error| DocStructError::Internal(format!("CSV encoding failed: {e}"));
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(VALIDATION_HEADER).map_err(csv_err)?;
    for (name, field) in review_rows(doc, threshold) {
        let value = match &field.value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        writer
            .write_record([
                name,
                value.as_str(),
                format!("{:.2}", field.confidence).as_str(),
                field.source.as_str(),
                if field.needs_validation { "true" } else { "false" },
            ])
            .map_err(csv_err)?;
    }
    writer
        .into_inner()
        .map_err(|e| DocStructError::Internal(format!("CSV encoding failed: {e}")))
}

/// Write every file for one result under `output_root/<base>/`.
pub async fn write_outputs(
    output_root: &Path,
    result: &ProcessingResult,
    threshold: f64,
) -> Result<ExportedFiles, DocStructError> {
    let base = base_name(result);
    let dir = output_root.join(&base);

    let raw_text = if result.recognition.text.is_empty() {
        None
    } else {
        let path = dir.join("ocr_raw_text.txt");
        write_atomic(&path, result.recognition.text.as_bytes()).await?;
        Some(path)
    };

    let validation_list = match &result.structured {
        Some(doc) => {
            let path = dir.join("validation_list.csv");
            write_atomic(&path, &validation_csv(doc, threshold)?).await?;
            Some(path)
        }
        None => None,
    };

    let structured_json = dir.join(format!("{base}_structured.json"));
    let json = serde_json::to_vec_pretty(result)
        .map_err(|e| DocStructError::Internal(format!("JSON encoding failed: {e}")))?;
    write_atomic(&structured_json, &json).await?;

    debug!("Wrote outputs for {} to {}", result.source_name, dir.display());
    Ok(ExportedFiles {
        directory: dir,
        raw_text,
        validation_list,
        structured_json,
    })
}
