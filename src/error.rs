//! Error types for the edgequake-docstruct library.
//!
//! Three distinct shapes reflect three distinct failure modes:
//!
//! * [`DocStructError`] — **Fatal** for one unit of work: the image cannot be
//!   decoded, the recognition engine is missing, a configuration file is
//!   malformed. Returned as `Err(DocStructError)`.
//!
//! * [`ItemError`] — **Non-fatal** record of a fatal error that happened to
//!   one page or one batch item. Stored inside
//!   [`crate::output::BatchItem`] so one bad scan never aborts the rest of
//!   the batch.
//!
//! * [`Recovered`] — the result of a best-effort sub-step (vocabulary
//!   correction, entity tagging, provider-output decoding). It always carries
//!   a usable value; the fallback arm adds the diagnostic explaining why the
//!   enhanced value is missing.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-docstruct library.
#[derive(Debug, Error)]
pub enum DocStructError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The bytes are neither a PDF nor a decodable image.
    #[error("Unsupported input '{path}': {detail}")]
    UnsupportedInput { path: PathBuf, detail: String },

    /// pdfium could not render a page.
    #[error("Rendering failed for page {page}: {detail}")]
    RenderFailed { page: usize, detail: String },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// The image could not be decoded or a normalization stage failed.
    #[error("Image normalization failed: {0}")]
    NormalizationFailure(String),

    /// The engine's binary or credentials are missing.
    #[error("Recognition engine '{engine}' is unavailable: {reason}")]
    EngineUnavailable { engine: String, reason: String },

    /// The provider returned an error or nothing usable.
    #[error("Recognition failed on engine '{engine}': {detail}")]
    RecognitionFailure { engine: String, detail: String },

    /// No structuring provider could be resolved.
    #[error("LLM provider '{provider}' is not configured: {hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// A registry lookup for a name that is not configured.
    #[error("Unknown recognition engine '{0}'")]
    UnknownEngine(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// A configuration document is missing or malformed.
    #[error("Configuration error in '{path}': {detail}")]
    ConfigError { path: PathBuf, detail: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output or configuration file.
    #[error("Failed to write '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DocStructError {
    pub(crate) fn config(path: impl Into<PathBuf>, detail: impl ToString) -> Self {
        Self::ConfigError {
            path: path.into(),
            detail: detail.to_string(),
        }
    }

    /// Short machine-friendly tag for the error family.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileNotFound { .. } | Self::UnsupportedInput { .. } => "input",
            Self::RenderFailed { .. } => "render",
            Self::NormalizationFailure(_) => "normalization",
            Self::EngineUnavailable { .. } | Self::UnknownEngine(_) => "engine_unavailable",
            Self::RecognitionFailure { .. } => "recognition",
            Self::ConfigError { .. } | Self::InvalidConfig(_) | Self::ProviderNotConfigured { .. } => {
                "config"
            }
            Self::OutputWriteFailed { .. } | Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

/// A non-fatal error for a single page or batch item.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize, PartialEq)]
#[error("{source_name}{}: {cause}", .page.map(|p| format!(" (page {p})")).unwrap_or_default())]
pub struct ItemError {
    /// File name or label of the failing unit.
    pub source_name: String,
    /// 1-indexed PDF page, when the unit is a page.
    pub page: Option<usize>,
    /// Error family, see [`DocStructError::kind`].
    pub kind: String,
    /// Human-readable cause.
    pub cause: String,
}

impl ItemError {
    pub fn from_error(source_name: impl Into<String>, page: Option<usize>, err: &DocStructError) -> Self {
        Self {
            source_name: source_name.into(),
            page,
            kind: err.kind().to_string(),
            cause: err.to_string(),
        }
    }
}

/// Outcome of a best-effort step that never fails outright.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovered<T> {
    /// The step ran to completion.
    Enhanced(T),
    /// The step failed; `value` is what downstream code should use instead.
    Fallback { value: T, diagnostic: String },
}

impl<T> Recovered<T> {
    pub fn fallback(value: T, diagnostic: impl Into<String>) -> Self {
        Self::Fallback {
            value,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Self::Enhanced(v) | Self::Fallback { value: v, .. } => v,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Self::Enhanced(v) | Self::Fallback { value: v, .. } => v,
        }
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Enhanced(_) => None,
            Self::Fallback { diagnostic, .. } => Some(diagnostic),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Recovered<U> {
        match self {
            Self::Enhanced(v) => Recovered::Enhanced(f(v)),
            Self::Fallback { value, diagnostic } => Recovered::Fallback {
                value: f(value),
                diagnostic,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_unavailable_display() {
        let e = DocStructError::EngineUnavailable {
            engine: "pytesseract".into(),
            reason: "binary not found".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("pytesseract"), "got: {msg}");
        assert!(msg.contains("binary not found"));
        assert_eq!(e.kind(), "engine_unavailable");
    }

    #[test]
    fn item_error_carries_page() {
        let err = DocStructError::RecognitionFailure {
            engine: "pytesseract".into(),
            detail: "empty".into(),
        };
        let item = ItemError::from_error("scan.pdf", Some(3), &err);
        assert_eq!(item.kind, "recognition");
        let msg = item.to_string();
        assert!(msg.starts_with("scan.pdf (page 3): "), "got: {msg}");
    }

    #[test]
    fn item_error_without_page() {
        let err = DocStructError::NormalizationFailure("bad header".into());
        let item = ItemError::from_error("a.png", None, &err);
        assert!(item.to_string().starts_with("a.png: "));
    }

    #[test]
    fn recovered_accessors() {
        let ok: Recovered<u8> = Recovered::Enhanced(1);
        assert_eq!(*ok.value(), 1);
        assert!(ok.diagnostic().is_none());

        let fb = Recovered::fallback(2u8, "tagger offline");
        assert!(fb.is_fallback());
        assert_eq!(fb.diagnostic(), Some("tagger offline"));
        assert_eq!(fb.map(|v| v * 2).into_value(), 4);
    }
}
