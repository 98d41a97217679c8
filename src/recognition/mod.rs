//! Recognition engines and the router that selects between them.
//!
//! Every engine turns PNG bytes into the same [`RecognitionResult`] shape:
//! text, a 0–100 confidence, detected languages, per-word [`TextBlock`]s with
//! a nine-cell position label, and the source image size. Downstream code
//! never learns which engine ran beyond the `engine` name in the result.
//!
//! ```text
//! registry file ──▶ EngineRouter ──snapshot──▶ RecognitionProvider
//!                    (current, previous)        ├─ TesseractEngine    (local binary)
//!                                               └─ GoogleVisionEngine (REST)
//! ```
//!
//! [`TextBlock`]: crate::output::TextBlock

pub mod google_vision;
pub mod registry;
pub mod tesseract;
pub mod vocabulary;

pub use google_vision::GoogleVisionEngine;
pub use registry::{EngineRouter, EngineSnapshot, EngineStatus};
pub use tesseract::TesseractEngine;
pub use vocabulary::{Vocabulary, VocabularyStats};

use crate::error::DocStructError;
use crate::output::RecognitionResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

// ── Engine kinds ─────────────────────────────────────────────────────────

/// The provider implementation behind a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Tesseract,
    GoogleVision,
}

impl EngineKind {
    /// Map a provider or engine name to a kind.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "pytesseract" | "tesseract" => Some(Self::Tesseract),
            "google-cloud-vision" | "google-vision" | "google_cloud_vision" => Some(Self::GoogleVision),
            _ => None,
        }
    }

    /// Resolve the kind of a registry entry: an explicit `"provider"` member
    /// wins, otherwise the engine name itself.
    pub fn resolve(name: &str, settings: &Map<String, Value>) -> Option<Self> {
        match settings.get("provider").and_then(Value::as_str) {
            Some(provider) => Self::from_name(provider),
            None => Self::from_name(name),
        }
    }

    /// Whether the engine wants color input rather than a binarized page.
    pub fn prefers_color(self) -> bool {
        matches!(self, Self::GoogleVision)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tesseract => "tesseract",
            Self::GoogleVision => "google-cloud-vision",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Typed settings ───────────────────────────────────────────────────────

/// Settings of a Tesseract registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseractSettings {
    pub binary: String,
    /// `+`-joined Tesseract language codes. Defaults to `eng`, which every
    /// Tesseract install ships; Chinese scans need `chi_sim+eng` and the
    /// `chi_sim` traineddata.
    pub languages: String,
    pub oem: u8,
    pub psm: u8,
    pub custom_words_path: Option<PathBuf>,
    pub custom_patterns_path: Option<PathBuf>,
    pub description: Option<String>,
    pub timeout_secs: u64,
}

impl Default for TesseractSettings {
    fn default() -> Self {
        Self {
            binary: "tesseract".into(),
            languages: "eng".into(),
            oem: 3,
            psm: 6,
            custom_words_path: None,
            custom_patterns_path: None,
            description: None,
            timeout_secs: 120,
        }
    }
}

/// Settings of a Google Cloud Vision registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleVisionSettings {
    pub credentials_path: Option<PathBuf>,
    pub language_hints: Vec<String>,
    /// Take the text from `TEXT_DETECTION` when true, from
    /// `DOCUMENT_TEXT_DETECTION` otherwise. Confidence always comes from the
    /// document annotation.
    pub enable_text_detection: bool,
    pub enable_post_process: bool,
    pub custom_words_path: Option<PathBuf>,
    pub fuzzy_threshold: f64,
    pub endpoint: String,
    pub description: Option<String>,
    pub timeout_secs: u64,
}

impl Default for GoogleVisionSettings {
    fn default() -> Self {
        Self {
            credentials_path: None,
            language_hints: vec!["zh".into(), "en".into()],
            enable_text_detection: true,
            enable_post_process: true,
            custom_words_path: None,
            fuzzy_threshold: vocabulary::DEFAULT_FUZZY_THRESHOLD,
            endpoint: "https://vision.googleapis.com/v1/images:annotate".into(),
            description: None,
            timeout_secs: 60,
        }
    }
}

// ── Registry entry ───────────────────────────────────────────────────────

/// One configured engine: its name, kind and raw settings map. The map is
/// kept as written so persisting the registry does not drop unknown keys.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEntry {
    pub name: String,
    pub kind: EngineKind,
    pub settings: Map<String, Value>,
}

impl EngineEntry {
    /// Validate an entry: its kind must be known and its settings must
    /// decode into the kind's typed settings.
    pub fn new(name: impl Into<String>, settings: Map<String, Value>) -> Result<Self, String> {
        let name = name.into();
        let kind = EngineKind::resolve(&name, &settings)
            .ok_or_else(|| format!("engine '{name}' has no known provider"))?;
        let entry = Self { name, kind, settings };
        match kind {
            EngineKind::Tesseract => entry.tesseract_settings().map(|_| ())?,
            EngineKind::GoogleVision => entry.google_settings().map(|_| ())?,
        }
        Ok(entry)
    }

    pub fn tesseract_settings(&self) -> Result<TesseractSettings, String> {
        serde_json::from_value(Value::Object(self.settings.clone()))
            .map_err(|e| format!("engine '{}': {e}", self.name))
    }

    pub fn google_settings(&self) -> Result<GoogleVisionSettings, String> {
        serde_json::from_value(Value::Object(self.settings.clone()))
            .map_err(|e| format!("engine '{}': {e}", self.name))
    }

    pub fn description(&self) -> String {
        self.settings
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| match self.kind {
                EngineKind::Tesseract => "Tesseract OCR (local)".to_string(),
                EngineKind::GoogleVision => "Google Cloud Vision API".to_string(),
            })
    }
}

// ── Providers ────────────────────────────────────────────────────────────

/// A ready-to-call engine built from a registry entry.
#[derive(Debug, Clone)]
pub enum RecognitionProvider {
    Tesseract(TesseractEngine),
    GoogleVision(GoogleVisionEngine),
}

impl RecognitionProvider {
    /// Build the provider for `entry`. `fallback_words` is the vocabulary
    /// used by engines whose entry names none.
    pub fn from_entry(entry: &EngineEntry, fallback_words: Option<PathBuf>) -> Result<Self, DocStructError> {
        let invalid = |detail: String| DocStructError::InvalidConfig(detail);
        Ok(match entry.kind {
            EngineKind::Tesseract => {
                Self::Tesseract(TesseractEngine::new(&entry.name, entry.tesseract_settings().map_err(invalid)?))
            }
            EngineKind::GoogleVision => Self::GoogleVision(GoogleVisionEngine::new(
                &entry.name,
                entry.google_settings().map_err(invalid)?,
                fallback_words,
            )?),
        })
    }

    pub async fn recognize(&self, image: &[u8]) -> Result<RecognitionResult, DocStructError> {
        match self {
            Self::Tesseract(e) => e.recognize(image).await,
            Self::GoogleVision(e) => e.recognize(image).await,
        }
    }

    pub async fn is_available(&self) -> bool {
        match self {
            Self::Tesseract(e) => e.is_available().await,
            Self::GoogleVision(e) => e.is_available().await,
        }
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            Self::Tesseract(_) => EngineKind::Tesseract,
            Self::GoogleVision(_) => EngineKind::GoogleVision,
        }
    }

    pub fn prefers_color(&self) -> bool {
        self.kind().prefers_color()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn kind_from_name_or_provider_key() {
        assert_eq!(EngineKind::resolve("pytesseract", &Map::new()), Some(EngineKind::Tesseract));
        assert_eq!(
            EngineKind::resolve("cloud", &map(json!({"provider": "google-vision"}))),
            Some(EngineKind::GoogleVision)
        );
        assert_eq!(EngineKind::resolve("abbyy", &Map::new()), None);
    }

    #[test]
    fn entry_settings_decode_with_defaults() {
        let entry = EngineEntry::new("pytesseract", map(json!({"lang": "ignored", "psm": 4}))).unwrap();
        let s = entry.tesseract_settings().unwrap();
        assert_eq!(s.psm, 4);
        assert_eq!(s.oem, 3);
        assert_eq!(s.languages, "eng");

        let chinese = EngineEntry::new("pytesseract", map(json!({"languages": "chi_sim+eng"}))).unwrap();
        assert_eq!(chinese.tesseract_settings().unwrap().languages, "chi_sim+eng");
    }

    #[test]
    fn entry_with_bad_setting_is_rejected() {
        let err = EngineEntry::new("pytesseract", map(json!({"oem": "three"}))).unwrap_err();
        assert!(err.contains("pytesseract"));
    }

    #[test]
    fn google_prefers_color() {
        assert!(EngineKind::GoogleVision.prefers_color());
        assert!(!EngineKind::Tesseract.prefers_color());
        let entry = EngineEntry::new("google-cloud-vision", Map::new()).unwrap();
        let provider = RecognitionProvider::from_entry(&entry, None).unwrap();
        assert!(provider.prefers_color());
        assert_eq!(entry.description(), "Google Cloud Vision API");
    }
}
