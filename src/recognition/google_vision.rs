//! Google Cloud Vision engine over the `images:annotate` REST endpoint.
//!
//! With `enable_text_detection` the request asks for `TEXT_DETECTION` and
//! the text comes from its first text annotation. `DOCUMENT_TEXT_DETECTION`
//! is always requested alongside, in the same call, because only its
//! `fullTextAnnotation` carries confidences, languages and word boxes. With
//! the flag off, document detection alone supplies everything.
//!
//! `fullTextAnnotation` nests pages → blocks → paragraphs → words →
//! symbols; each word becomes one [`TextBlock`], numbered by block,
//! paragraph and word index.
//!
//! Vision reports confidence in `0.0..=1.0` per block. The page confidence
//! is the block mean scaled to percent, or 95 when the response carries
//! none.
//!
//! Vision has no user dictionary, so recognized text optionally goes through
//! [`Vocabulary`] correction afterwards.

use super::vocabulary::Vocabulary;
use super::GoogleVisionSettings;
use crate::error::DocStructError;
use crate::output::{percent, BoundingBox, ImageSize, Position, RecognitionResult, TextBlock};
use crate::pipeline::encode::to_base64;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable consulted when the credentials file has no key.
pub const API_KEY_ENV: &str = "GOOGLE_VISION_API_KEY";

/// Confidence used when the response has no block confidences.
const DEFAULT_CONFIDENCE: f64 = 95.0;

#[derive(Debug, Clone)]
pub struct GoogleVisionEngine {
    name: String,
    settings: GoogleVisionSettings,
    /// Vocabulary used when the entry names none of its own.
    fallback_words: Option<PathBuf>,
    client: reqwest::Client,
}

impl GoogleVisionEngine {
    pub fn new(
        name: impl Into<String>,
        settings: GoogleVisionSettings,
        fallback_words: Option<PathBuf>,
    ) -> Result<Self, DocStructError> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| DocStructError::EngineUnavailable {
                engine: name.clone(),
                reason: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self {
            name,
            settings,
            fallback_words,
            client,
        })
    }

    pub fn settings(&self) -> &GoogleVisionSettings {
        &self.settings
    }

    /// Vocabulary file in effect, if any.
    pub fn vocabulary_path(&self) -> Option<&PathBuf> {
        self.settings
            .custom_words_path
            .as_ref()
            .or(self.fallback_words.as_ref())
    }

    /// `true` when credentials are present.
    pub async fn is_available(&self) -> bool {
        self.api_key().await.is_ok()
    }

    /// Resolve the API key: the credentials file must exist; its `api_key`
    /// member wins over the environment variable.
    async fn api_key(&self) -> Result<String, DocStructError> {
        let unavailable = |reason: String| DocStructError::EngineUnavailable {
            engine: self.name.clone(),
            reason,
        };
        let path = self
            .settings
            .credentials_path
            .as_ref()
            .ok_or_else(|| unavailable("credentials_path is not configured".into()))?;
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| unavailable(format!("credentials file '{}': {e}", path.display())))?;

        let from_file = serde_json::from_str::<serde_json::Value>(&raw)
            .ok()
            .and_then(|v| v.get("api_key").and_then(|k| k.as_str()).map(str::to_string))
            .filter(|k| !k.is_empty());
        if let Some(key) = from_file {
            return Ok(key);
        }
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.is_empty() => Ok(key),
            _ => Err(unavailable(format!(
                "no api_key in '{}' and {API_KEY_ENV} is not set",
                path.display()
            ))),
        }
    }

    pub async fn recognize(&self, image: &[u8]) -> Result<RecognitionResult, DocStructError> {
        let key = self.api_key().await?;
        let size = image::load_from_memory(image)
            .map(|img| ImageSize {
                width: img.width(),
                height: img.height(),
            })
            .map_err(|e| self.failure(format!("cannot decode image: {e}")))?;

        let body = serde_json::to_vec(&self.request_body(image)).map_err(|e| self.failure(e.to_string()))?;

        let url = format!("{}?key={}", self.settings.endpoint, key);
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| self.failure(format!("request failed: {}", e.without_url())))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.failure(format!("reading response: {}", e.without_url())))?;
        if !status.is_success() {
            let preview: String = String::from_utf8_lossy(&bytes).chars().take(200).collect();
            return Err(self.failure(format!("HTTP {status}: {preview}")));
        }

        let parsed: AnnotateResponse = serde_json::from_slice(&bytes)
            .map_err(|e| self.failure(format!("malformed response: {e}")))?;
        let mut result = self.to_result(parsed, size)?;

        if self.settings.enable_post_process {
            result.text = self.post_process(result.text).await;
        }
        info!(
            engine = %self.name,
            "Recognized {} words, confidence {:.1}",
            result.blocks.len(),
            result.confidence
        );
        Ok(result)
    }

    /// Feature types sent with every request, in order.
    fn features(&self) -> &'static [&'static str] {
        if self.settings.enable_text_detection {
            &["TEXT_DETECTION", "DOCUMENT_TEXT_DETECTION"]
        } else {
            &["DOCUMENT_TEXT_DETECTION"]
        }
    }

    fn request_body(&self, image: &[u8]) -> serde_json::Value {
        let features: Vec<_> = self.features().iter().map(|f| json!({ "type": f })).collect();
        let mut request = json!({
            "image": { "content": to_base64(image) },
            "features": features,
        });
        if !self.settings.language_hints.is_empty() {
            request["imageContext"] = json!({ "languageHints": self.settings.language_hints });
        }
        json!({ "requests": [request] })
    }

    fn to_result(&self, parsed: AnnotateResponse, size: ImageSize) -> Result<RecognitionResult, DocStructError> {
        let single = parsed
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| self.failure("response contained no annotation"))?;
        if let Some(err) = single.error {
            return Err(self.failure(format!("API error: {}", err.message)));
        }
        let mut page = annotation_to_page(single.full_text_annotation.as_ref(), size);

        if let Some(first) = single.text_annotations.first() {
            let detected = first.description.trim();
            if !detected.is_empty() && (self.settings.enable_text_detection || page.text.is_empty()) {
                page.text = detected.to_string();
            }
            if page.languages.is_empty() {
                page.languages.extend(first.locale.clone());
            }
        }
        if page.languages.is_empty() {
            page.languages = self.settings.language_hints.clone();
        }

        Ok(RecognitionResult {
            text: page.text,
            confidence: page.confidence,
            languages: page.languages,
            engine: self.name.clone(),
            blocks: page.blocks,
            image_size: size,
        })
    }

    async fn post_process(&self, text: String) -> String {
        let Some(path) = self.vocabulary_path() else {
            return text;
        };
        match Vocabulary::load(path).await {
            Ok(vocab) => {
                let corrected = vocab
                    .with_fuzzy_threshold(self.settings.fuzzy_threshold)
                    .correct(&text);
                if let Some(diag) = corrected.diagnostic() {
                    warn!(engine = %self.name, "{diag}");
                }
                corrected.into_value()
            }
            Err(e) => {
                warn!(engine = %self.name, "Skipping vocabulary correction: {e}");
                text
            }
        }
    }

    fn failure(&self, detail: impl Into<String>) -> DocStructError {
        DocStructError::RecognitionFailure {
            engine: self.name.clone(),
            detail: detail.into(),
        }
    }
}

// ── Response model ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub(crate) struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    full_text_annotation: Option<FullTextAnnotation>,
    #[serde(default)]
    text_annotations: Vec<EntityAnnotation>,
    error: Option<ApiStatus>,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct EntityAnnotation {
    #[serde(default)]
    description: String,
    locale: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FullTextAnnotation {
    #[serde(default)]
    text: String,
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Debug, Default, Deserialize)]
struct Page {
    property: Option<TextProperty>,
    #[serde(default)]
    blocks: Vec<Block>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextProperty {
    #[serde(default)]
    detected_languages: Vec<DetectedLanguage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectedLanguage {
    language_code: String,
}

#[derive(Debug, Default, Deserialize)]
struct Block {
    #[serde(default)]
    paragraphs: Vec<Paragraph>,
    confidence: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct Paragraph {
    #[serde(default)]
    words: Vec<Word>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Word {
    bounding_box: Option<BoundingPoly>,
    #[serde(default)]
    symbols: Vec<Symbol>,
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Symbol {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<Vertex>,
}

#[derive(Debug, Default, Deserialize)]
struct Vertex {
    #[serde(default)]
    x: i64,
    #[serde(default)]
    y: i64,
}

struct VisionPage {
    text: String,
    blocks: Vec<TextBlock>,
    confidence: f64,
    languages: Vec<String>,
}

fn annotation_to_page(annotation: Option<&FullTextAnnotation>, size: ImageSize) -> VisionPage {
    let mut out = VisionPage {
        text: String::new(),
        blocks: Vec::new(),
        confidence: DEFAULT_CONFIDENCE,
        languages: Vec::new(),
    };
    let Some(annotation) = annotation else {
        return out;
    };
    out.text = annotation.text.trim().to_string();

    let mut block_confidences = Vec::new();
    for page in &annotation.pages {
        if let Some(prop) = &page.property {
            for lang in &prop.detected_languages {
                if !out.languages.contains(&lang.language_code) {
                    out.languages.push(lang.language_code.clone());
                }
            }
        }
        for (bi, block) in page.blocks.iter().enumerate() {
            if let Some(c) = block.confidence {
                block_confidences.push(c);
            }
            for (pi, paragraph) in block.paragraphs.iter().enumerate() {
                for (wi, word) in paragraph.words.iter().enumerate() {
                    let text: String = word.symbols.iter().map(|s| s.text.as_str()).collect();
                    if text.trim().is_empty() {
                        continue;
                    }
                    let bbox = vertices_to_bbox(word.bounding_box.as_ref(), size);
                    let conf = word.confidence.or(block.confidence).map_or(DEFAULT_CONFIDENCE, |c| c * 100.0);
                    out.blocks.push(TextBlock {
                        text,
                        confidence: percent(conf),
                        position: Position::of(&bbox, size),
                        bbox,
                        block_num: bi as u32 + 1,
                        line_num: pi as u32 + 1,
                        word_num: wi as u32 + 1,
                    });
                }
            }
        }
    }

    if !block_confidences.is_empty() {
        out.confidence = 100.0 * block_confidences.iter().sum::<f64>() / block_confidences.len() as f64;
    }
    debug!("Vision page: {} words, {} blocks with confidence", out.blocks.len(), block_confidences.len());
    out
}

fn vertices_to_bbox(poly: Option<&BoundingPoly>, size: ImageSize) -> BoundingBox {
    let vertices = poly.map(|p| p.vertices.as_slice()).unwrap_or(&[]);
    if vertices.is_empty() {
        return BoundingBox::new(0, 0, 0, 0, size);
    }
    let min_x = vertices.iter().map(|v| v.x).min().unwrap_or(0).max(0);
    let max_x = vertices.iter().map(|v| v.x).max().unwrap_or(0).max(0);
    let min_y = vertices.iter().map(|v| v.y).min().unwrap_or(0).max(0);
    let max_y = vertices.iter().map(|v| v.y).max().unwrap_or(0).max(0);
    BoundingBox::new(
        min_x as u32,
        min_y as u32,
        (max_x - min_x) as u32,
        (max_y - min_y) as u32,
        size,
    )
}
