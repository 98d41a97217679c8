//! Structuring provider: the generative model that maps cleaned text to the
//! schema's fields.
//!
//! The pipeline only needs "prompt in, text out", so it talks to the model
//! through [`TextGenerator`]. [`LlmGenerator`] adapts any `edgequake-llm`
//! provider to that seam; tests and offline callers plug in their own
//! implementation without touching the network.
//!
//! ## No retry loop
//!
//! A failed generation is reported once and the document is scored with
//! every field missing. Repeating the call would change the confidence a
//! reviewer sees depending on transient network state, and the batch loop
//! already keeps one slow document from blocking the others.

use crate::config::PipelineConfig;
use crate::error::{DocStructError, Recovered};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// System prompt for structuring calls.
const SYSTEM_PROMPT: &str = "You extract structured data from OCR text. \
Respond with a single JSON object and nothing else.";

/// Anything that turns a prompt into generated text.
pub trait TextGenerator: Send + Sync {
    /// Produce a completion for `prompt`. The error is a human-readable cause.
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, String>>;

    /// Label used in logs.
    fn name(&self) -> &str {
        "generator"
    }
}

/// [`TextGenerator`] backed by an `edgequake-llm` provider.
pub struct LlmGenerator {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    timeout: Option<Duration>,
}

impl LlmGenerator {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
            timeout: (config.api_timeout_secs > 0)
                .then(|| Duration::from_secs(config.api_timeout_secs)),
        }
    }
}

impl TextGenerator for LlmGenerator {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
            let messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];
            let start = Instant::now();
            let call = self.provider.chat(&messages, Some(&self.options));
            let response = match self.timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .map_err(|_| format!("no response within {}s", limit.as_secs()))?,
                None => call.await,
            }
            .map_err(|e| e.to_string())?;
            debug!(
                "Structuring call: {} input tokens, {} output tokens, {:?}",
                response.prompt_tokens,
                response.completion_tokens,
                start.elapsed()
            );
            Ok(response.content)
        })
    }

    fn name(&self) -> &str {
        "edgequake-llm"
    }
}

/// Build `CompletionOptions` from the pipeline config.
fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, DocStructError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        DocStructError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the structuring generator, from most-specific to least-specific.
///
/// 1. **Pre-built generator** (`config.generator`), used as-is.
/// 2. **Pre-built provider** (`config.provider`), wrapped in [`LlmGenerator`].
/// 3. **Named provider + model** (`config.provider_name`, model defaults to
///    `gpt-4.1-nano`). The factory reads the matching API key from the
///    environment.
/// 4. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
/// 5. `OPENAI_API_KEY` present → OpenAI.
/// 6. Full auto-detection via [`ProviderFactory::from_env`].
pub fn resolve_generator(config: &PipelineConfig) -> Result<Arc<dyn TextGenerator>, DocStructError> {
    if let Some(ref generator) = config.generator {
        return Ok(Arc::clone(generator));
    }
    let provider = resolve_provider(config)?;
    Ok(Arc::new(LlmGenerator::new(provider, config)))
}

fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, DocStructError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| DocStructError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {e}"
            ),
        })?;
    Ok(llm_provider)
}

// ── Response decoding ────────────────────────────────────────────────────

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^```(?:json)?\s*\n?(.*?)\n?```\s*$").unwrap());

static RE_OPEN_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^```[A-Za-z]*\s*").unwrap());

/// Decode a provider response into a field map.
///
/// Accepts bare JSON, JSON wrapped in a ```` ```json ```` fence, and JSON with
/// chatter around it (the outermost `{ … }` is tried). Anything else decodes
/// to an empty map with a diagnostic.
pub fn parse_structured_response(raw: &str) -> Recovered<Map<String, Value>> {
    let trimmed = raw.trim();
    let body = match RE_FENCED.captures(trimmed) {
        Some(caps) => caps[1].trim().to_string(),
        None => {
            let without_open = RE_OPEN_FENCE.replace(trimmed, "");
            without_open.trim_end().trim_end_matches("```").trim().to_string()
        }
    };

    match serde_json::from_str::<Value>(&body) {
        Ok(Value::Object(map)) => return Recovered::Enhanced(map),
        Ok(other) => {
            return Recovered::fallback(
                Map::new(),
                format!("provider returned JSON {} instead of an object", json_kind(&other)),
            )
        }
        Err(_) => {}
    }

    if let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) {
        if start < end {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&body[start..=end]) {
                debug!("Recovered JSON object from surrounding text");
                return Recovered::Enhanced(map);
            }
        }
    }

    let preview: String = body.chars().take(80).collect();
    warn!("Provider output is not a JSON object: {preview:?}");
    Recovered::fallback(Map::new(), format!("provider output is not valid JSON: {preview:?}"))
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
