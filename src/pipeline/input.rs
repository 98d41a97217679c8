//! Input resolution: read a user-supplied file and decide how to treat it.
//!
//! Scans arrive either as single images (PNG, JPEG, TIFF, BMP) or as PDFs
//! holding one scanned page each. The magic bytes decide, not the extension:
//! upload pipelines routinely rename `.pdf` files to `.jpg` and vice versa.

use crate::error::DocStructError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What the bytes of an input are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pdf,
    Image,
}

/// Classify raw bytes by their leading magic.
pub fn sniff(bytes: &[u8]) -> InputKind {
    if bytes.starts_with(b"%PDF") {
        InputKind::Pdf
    } else {
        InputKind::Image
    }
}

/// A file read fully into memory.
#[derive(Debug, Clone)]
pub struct LoadedInput {
    pub path: PathBuf,
    pub kind: InputKind,
    pub bytes: Vec<u8>,
}

impl LoadedInput {
    /// File name used in results, logs and export file names.
    pub fn name(&self) -> String {
        display_name(&self.path)
    }
}

pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Read a local file, validating existence and readability.
pub async fn read_input(path: impl AsRef<Path>) -> Result<LoadedInput, DocStructError> {
    let path = path.as_ref().to_path_buf();
    let bytes = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DocStructError::FileNotFound { path });
        }
        Err(e) => {
            return Err(DocStructError::UnsupportedInput {
                path,
                detail: e.to_string(),
            })
        }
    };
    if bytes.is_empty() {
        return Err(DocStructError::UnsupportedInput {
            path,
            detail: "file is empty".into(),
        });
    }
    let kind = sniff(&bytes);
    debug!("Resolved {:?} input: {}", kind, path.display());
    Ok(LoadedInput { path, kind, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sniff_pdf_magic() {
        assert_eq!(sniff(b"%PDF-1.7\n..."), InputKind::Pdf);
        assert_eq!(sniff(b"\x89PNG\r\n"), InputKind::Image);
        assert_eq!(sniff(b""), InputKind::Image);
    }

    #[tokio::test]
    async fn missing_file_is_file_not_found() {
        let dir = TempDir::new().unwrap();
        let err = read_input(dir.path().join("nope.png")).await.unwrap_err();
        assert!(matches!(err, DocStructError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn empty_file_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.png");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            read_input(&path).await,
            Err(DocStructError::UnsupportedInput { .. })
        ));
    }

    #[tokio::test]
    async fn renamed_pdf_detected_by_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan.jpg");
        std::fs::write(&path, b"%PDF-1.4\n%fake").unwrap();
        let input = read_input(&path).await.unwrap();
        assert_eq!(input.kind, InputKind::Pdf);
        assert_eq!(input.name(), "scan.jpg");
    }
}
