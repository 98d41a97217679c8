//! Configuration types for document structuring.
//!
//! Runtime behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. The file-backed documents the pipeline reads
//! next to it live here too:
//!
//! | Document | Type | Missing file |
//! |----------|------|--------------|
//! | `configs/nlp.json` | [`NlpConfig`] | defaults |
//! | `configs/llms/init.json` | [`LlmServices`] | environment auto-detection |
//! | `configs/ocr_engines.json` | [`crate::recognition::EngineRouter`] | `ConfigError` |
//!
//! # Design choice: builder over constructor
//! The same reasoning as for any wide config struct: callers set only what
//! they care about and rely on documented defaults for the rest.

use crate::error::DocStructError;
use crate::pipeline::llm::TextGenerator;
use crate::pipeline::normalize::NormalizeConfig;
use crate::progress::ProgressCallback;
use crate::scoring::ScoringConfig;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Configuration for a structuring run.
///
/// # Example
/// ```rust
/// use edgequake_docstruct::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .dpi(300)
///     .model("gpt-4.1-nano")
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 300);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Rendering DPI for PDF pages. Range: 72–600. Default: 200.
    ///
    /// Tesseract is tuned for roughly 300 DPI text; 200 keeps typical
    /// invoices legible while halving the pixel count.
    pub dpi: u32,

    /// Cap on either rendered dimension in pixels. Default: 4000.
    pub max_rendered_pixels: u32,

    /// Pages of a PDF to process. Default: all.
    pub pages: PageSelection,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// LLM model identifier used for structuring and schema regeneration.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-built text generator. Takes precedence over every provider field.
    pub generator: Option<Arc<dyn TextGenerator>>,

    /// Sampling temperature. Default: 0.1.
    ///
    /// Extraction wants the model to copy what the text says, not to invent.
    pub temperature: f32,

    /// Maximum tokens of structured JSON per call. Default: 2048.
    pub max_tokens: usize,

    /// Per-call timeout for the structuring provider in seconds. Default: 60.
    pub api_timeout_secs: u64,

    pub normalize: NormalizeConfig,

    pub scoring: ScoringConfig,

    pub nlp: NlpConfig,

    /// Per-item batch events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dpi: 200,
            max_rendered_pixels: 4000,
            pages: PageSelection::default(),
            password: None,
            model: None,
            provider_name: None,
            provider: None,
            generator: None,
            temperature: 0.1,
            max_tokens: 2048,
            api_timeout_secs: 60,
            normalize: NormalizeConfig::default(),
            scoring: ScoringConfig::default(),
            nlp: NlpConfig::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("pages", &self.pages)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("generator", &self.generator.as_ref().map(|_| "<dyn TextGenerator>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("normalize", &self.normalize)
            .field("scoring", &self.scoring)
            .field("nlp", &self.nlp)
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.config.generator = Some(generator);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn normalize(mut self, normalize: NormalizeConfig) -> Self {
        self.config.normalize = normalize;
        self
    }

    pub fn scoring(mut self, scoring: ScoringConfig) -> Self {
        self.config.scoring = scoring;
        self
    }

    pub fn nlp(mut self, nlp: NlpConfig) -> Self {
        self.config.nlp = nlp;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, DocStructError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(DocStructError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.max_tokens == 0 {
            return Err(DocStructError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        c.scoring.validate()?;
        c.normalize.validate()?;
        Ok(self.config)
    }
}

// ── Page selection ───────────────────────────────────────────────────────

/// Specifies which pages of a PDF to process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum PageSelection {
    #[default]
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let in_range = |p: usize| p >= 1 && p <= total_pages;
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) if in_range(*p) => vec![p - 1],
            PageSelection::Single(_) => vec![],
            PageSelection::Range(start, end) => ((*start).max(1) - 1..(*end).min(total_pages)).collect(),
            PageSelection::Set(pages) => pages.iter().copied().filter(|&p| in_range(p)).map(|p| p - 1).collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Parse `all`, `5`, `3-15` or `1,3,5`.
    pub fn parse(s: &str) -> Result<Self, DocStructError> {
        let s = s.trim().to_lowercase();
        let page = |p: &str| -> Result<usize, DocStructError> {
            match p.trim().parse::<usize>() {
                Ok(n) if n >= 1 => Ok(n),
                _ => Err(DocStructError::InvalidConfig(format!(
                    "invalid page number '{}' (pages are 1-indexed)",
                    p.trim()
                ))),
            }
        };

        if s == "all" {
            return Ok(PageSelection::All);
        }
        if let Some((start, end)) = s.split_once('-') {
            let (start, end) = (page(start)?, page(end)?);
            if start > end {
                return Err(DocStructError::InvalidConfig(format!(
                    "invalid page range '{start}-{end}': start must be <= end"
                )));
            }
            return Ok(PageSelection::Range(start, end));
        }
        if s.contains(',') {
            return s.split(',').map(page).collect::<Result<Vec<_>, _>>().map(PageSelection::Set);
        }
        page(&s).map(PageSelection::Single)
    }
}

// ── NLP / cleaning document ──────────────────────────────────────────────

/// Text cleaning switches applied before structuring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextCleaning {
    pub remove_extra_spaces: bool,
    pub normalize_whitespace: bool,
    pub remove_special_chars: bool,
}

impl Default for TextCleaning {
    fn default() -> Self {
        Self {
            remove_extra_spaces: true,
            normalize_whitespace: true,
            remove_special_chars: false,
        }
    }
}

/// The `nlp_processing` section of the NLP configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NlpConfig {
    /// When false, recognition results are returned without structuring.
    pub enabled: bool,
    pub text_cleaning: TextCleaning,
    pub structure_config_path: Option<PathBuf>,
}

impl Default for NlpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            text_cleaning: TextCleaning::default(),
            structure_config_path: None,
        }
    }
}

#[derive(Deserialize)]
struct NlpDocument {
    #[serde(default)]
    nlp_processing: NlpConfig,
}

impl NlpConfig {
    /// Load `{"nlp_processing": {...}}`. A missing file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DocStructError> {
        let path = path.as_ref();
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(file = %path.display(), "NLP config missing, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(DocStructError::config(path, e)),
        };
        let doc: NlpDocument = serde_json::from_str(&text).map_err(|e| DocStructError::config(path, e))?;
        Ok(doc.nlp_processing)
    }
}

// ── LLM service document ─────────────────────────────────────────────────

/// One named generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmServiceConfig {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

/// `{"llm_services": {"current": name, "services": {name: {...}}}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmServices {
    pub current: String,
    #[serde(default)]
    pub services: BTreeMap<String, LlmServiceConfig>,
}

#[derive(Deserialize)]
struct LlmDocument {
    llm_services: LlmServices,
}

impl LlmServices {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DocStructError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DocStructError::config(path, e))?;
        let doc: LlmDocument = serde_json::from_str(&text).map_err(|e| DocStructError::config(path, e))?;
        if !doc.llm_services.services.contains_key(&doc.llm_services.current) {
            return Err(DocStructError::config(
                path,
                format!("current service '{}' is not defined", doc.llm_services.current),
            ));
        }
        Ok(doc.llm_services)
    }

    pub fn current_service(&self) -> Option<&LlmServiceConfig> {
        self.services.get(&self.current)
    }

    /// Copy the current service's settings onto a builder.
    pub fn apply(&self, mut builder: PipelineConfigBuilder) -> PipelineConfigBuilder {
        if let Some(svc) = self.current_service() {
            builder = builder.provider_name(svc.provider.clone());
            if let Some(ref m) = svc.model {
                builder = builder.model(m.clone());
            }
            if let Some(t) = svc.temperature {
                builder = builder.temperature(t);
            }
            if let Some(n) = svc.max_tokens {
                builder = builder.max_tokens(n);
            }
        }
        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn builder_clamps_and_validates() {
        let c = PipelineConfig::builder().dpi(10).temperature(5.0).build().unwrap();
        assert_eq!(c.dpi, 72);
        assert_eq!(c.temperature, 2.0);

        let err = PipelineConfig::builder().max_tokens(0).build().unwrap_err();
        assert!(matches!(err, DocStructError::InvalidConfig(_)));
    }

    #[test]
    fn page_selection_indices() {
        assert_eq!(PageSelection::All.to_indices(3), vec![0, 1, 2]);
        assert_eq!(PageSelection::Single(2).to_indices(3), vec![1]);
        assert!(PageSelection::Single(9).to_indices(3).is_empty());
        assert_eq!(PageSelection::Range(2, 10).to_indices(4), vec![1, 2, 3]);
        assert_eq!(PageSelection::Set(vec![3, 1, 3, 8]).to_indices(4), vec![0, 2]);
    }

    #[test]
    fn page_selection_parse() {
        assert_eq!(PageSelection::parse("ALL").unwrap(), PageSelection::All);
        assert_eq!(PageSelection::parse("5").unwrap(), PageSelection::Single(5));
        assert_eq!(PageSelection::parse("3-15").unwrap(), PageSelection::Range(3, 15));
        assert_eq!(
            PageSelection::parse("1, 3,5").unwrap(),
            PageSelection::Set(vec![1, 3, 5])
        );
        assert!(PageSelection::parse("0").is_err());
        assert!(PageSelection::parse("9-2").is_err());
    }

    #[tokio::test]
    async fn nlp_config_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let cfg = NlpConfig::load(dir.path().join("nlp.json")).await.unwrap();
        assert_eq!(cfg, NlpConfig::default());
        assert!(cfg.enabled);
        assert!(!cfg.text_cleaning.remove_special_chars);
    }

    #[tokio::test]
    async fn nlp_config_partial_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nlp.json");
        std::fs::write(
            &path,
            r#"{"nlp_processing": {"enabled": false, "text_cleaning": {"remove_special_chars": true},
               "structure_config_path": "configs/structures/new/invoice.json"}}"#,
        )
        .unwrap();
        let cfg = NlpConfig::load(&path).await.unwrap();
        assert!(!cfg.enabled);
        assert!(cfg.text_cleaning.remove_special_chars);
        assert!(cfg.text_cleaning.normalize_whitespace);
        assert_eq!(
            cfg.structure_config_path.as_deref(),
            Some(Path::new("configs/structures/new/invoice.json"))
        );
    }

    #[tokio::test]
    async fn nlp_config_malformed_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nlp.json");
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            NlpConfig::load(&path).await,
            Err(DocStructError::ConfigError { .. })
        ));
    }

    #[tokio::test]
    async fn llm_services_apply_current() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("init.json");
        std::fs::write(
            &path,
            r#"{"llm_services": {"current": "qwen", "services": {
                "qwen": {"provider": "ollama", "model": "qwen2.5", "temperature": 0.1, "max_tokens": 1024}
            }}}"#,
        )
        .unwrap();
        let services = LlmServices::load(&path).await.unwrap();
        let cfg = services.apply(PipelineConfig::builder()).build().unwrap();
        assert_eq!(cfg.provider_name.as_deref(), Some("ollama"));
        assert_eq!(cfg.model.as_deref(), Some("qwen2.5"));
        assert_eq!(cfg.max_tokens, 1024);
    }

    #[tokio::test]
    async fn llm_services_unknown_current() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("init.json");
        std::fs::write(&path, r#"{"llm_services": {"current": "x", "services": {}}}"#).unwrap();
        assert!(LlmServices::load(&path).await.is_err());
    }
}
