//! Structuring orchestrator: recognized text in, scored fields out.
//!
//! ```text
//! RecognitionResult ─▶ clean_text ─▶ EntityExtractor ─▶ TextGenerator ─▶ parse ─▶ score
//!        │ (empty)                     (recovered)        (recovered)   (recovered)
//!        └──────────────────────────▶ all fields missing ◀──────────────┘
//! ```
//!
//! ## Why nothing here returns `Err`
//!
//! Every failure after recognition has a defined degraded result: a tagger
//! failure leaves the pattern matches, a provider failure leaves every field
//! missing and queued for review. A document therefore always reaches the
//! reviewer, with its diagnostics attached, instead of disappearing from a
//! batch because a model endpoint hiccupped.

use crate::config::TextCleaning;
use crate::entities::{EntityExtractor, EntitySet};
use crate::error::Recovered;
use crate::output::{RecognitionResult, StructuredDocument};
use crate::pipeline::llm::{parse_structured_response, TextGenerator};
use crate::pipeline::postprocess::clean_text;
use crate::prompts;
use crate::schema::StructureSchema;
use crate::scoring::{all_missing, score_document, Evidence, ScoringConfig};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything a structuring pass produced, for callers that keep the
/// intermediate evidence.
#[derive(Debug, Clone)]
pub struct StructureReport {
    pub document: StructuredDocument,
    pub cleaned_text: String,
    pub entities: EntitySet,
    /// Provider output as received, `None` when the provider was not called
    /// or failed.
    pub raw_response: Option<String>,
    pub diagnostics: Vec<String>,
}

/// Owns the structuring provider, the entity extractor and the scoring
/// parameters for the lifetime of a pipeline.
pub struct Structurer {
    generator: Arc<dyn TextGenerator>,
    extractor: EntityExtractor,
    cleaning: TextCleaning,
    scoring: ScoringConfig,
}

impl std::fmt::Debug for Structurer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Structurer")
            .field("generator", &self.generator.name())
            .field("extractor", &self.extractor)
            .field("cleaning", &self.cleaning)
            .field("scoring", &self.scoring)
            .finish()
    }
}

impl Structurer {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            extractor: EntityExtractor::new(),
            cleaning: TextCleaning::default(),
            scoring: ScoringConfig::default(),
        }
    }

    pub fn with_extractor(mut self, extractor: EntityExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_cleaning(mut self, cleaning: TextCleaning) -> Self {
        self.cleaning = cleaning;
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn scoring(&self) -> &ScoringConfig {
        &self.scoring
    }

    /// Structure one recognition result against `schema`.
    pub async fn structure(&self, recognition: &RecognitionResult, schema: &StructureSchema) -> StructuredDocument {
        self.structure_detailed(recognition, schema).await.document
    }

    /// Like [`structure`](Self::structure), keeping the cleaned text,
    /// entities, raw provider output and diagnostics.
    pub async fn structure_detailed(
        &self,
        recognition: &RecognitionResult,
        schema: &StructureSchema,
    ) -> StructureReport {
        if recognition.is_empty() {
            debug!("Recognized text is empty, skipping structuring");
            return StructureReport {
                document: all_missing(schema),
                cleaned_text: String::new(),
                entities: EntitySet::default(),
                raw_response: None,
                diagnostics: Vec::new(),
            };
        }

        let mut diagnostics = Vec::new();
        let cleaned_text = clean_text(&recognition.text, &self.cleaning);

        let entities = collect(self.extractor.extract(&cleaned_text), &mut diagnostics);
        debug!("Extracted {} entities", entities.len());

        let prompt = prompts::extraction_prompt(schema, &cleaned_text);
        let start = Instant::now();
        let raw_response = match self.generator.generate(&prompt).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Structuring provider '{}' failed: {e}", self.generator.name());
                diagnostics.push(format!("structuring provider failed: {e}"));
                None
            }
        };

        let document = match &raw_response {
            None => all_missing(schema),
            Some(raw) => {
                let values = collect(parse_structured_response(raw), &mut diagnostics);
                let evidence = Evidence {
                    cleaned_text: &cleaned_text,
                    entities: &entities,
                    ocr_confidence: recognition.confidence,
                };
                score_document(schema, &values, &evidence, &self.scoring)
            }
        };

        info!(
            "Structured {} fields in {}ms: coverage {:.2}%, {} to review",
            document.fields.len(),
            start.elapsed().as_millis(),
            document.coverage,
            document.validation_list.len()
        );

        StructureReport {
            document,
            cleaned_text,
            entities,
            raw_response,
            diagnostics,
        }
    }

    /// Release the extractor's tagger.
    pub fn close(&mut self) {
        self.extractor.close();
    }
}

fn collect<T>(recovered: Recovered<T>, diagnostics: &mut Vec<String>) -> T {
    if let Some(d) = recovered.diagnostic() {
        diagnostics.push(d.to_string());
    }
    recovered.into_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{EntityTagger, TaggedEntity};
    use crate::output::{FieldSource, ImageSize};
    use crate::schema::{FieldSpec, FieldType};
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        reply: Result<String, String>,
        calls: AtomicUsize,
        last_prompt: Mutex<String>,
    }

    impl Scripted {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(String::new()),
            })
        }

        fn failing(cause: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(cause.to_string()),
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(String::new()),
            })
        }
    }

    impl TextGenerator for Scripted {
        fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = prompt.to_string();
            let reply = self.reply.clone();
            Box::pin(async move { reply })
        }
    }

    fn recognition(text: &str, confidence: f64) -> RecognitionResult {
        RecognitionResult {
            text: text.into(),
            confidence,
            languages: vec!["eng".into()],
            engine: "pytesseract".into(),
            blocks: vec![],
            image_size: ImageSize { width: 100, height: 100 },
        }
    }

    fn invoice_schema() -> StructureSchema {
        StructureSchema {
            title: "Invoice".into(),
            description: String::new(),
            items: vec![FieldSpec::new("invoice_no", FieldType::Text).with_pattern(r"INV-\d+")],
        }
    }

    #[tokio::test]
    async fn pattern_corroborated_field_scores_full() {
        let gen = Scripted::ok(r#"{"invoice_no":"INV-2024-001"}"#);
        let s = Structurer::new(gen.clone());
        let doc = s.structure(&recognition("INV-2024-001", 90.0), &invoice_schema()).await;
        let f = &doc.fields["invoice_no"];
        assert_eq!(f.confidence, 100.0);
        assert_eq!(f.source, FieldSource::Pattern);
        assert!(!f.needs_validation);
        assert_eq!(doc.coverage, 100.0);
        assert!(doc.validation_list.is_empty());
        assert!(gen.last_prompt.lock().unwrap().contains("INV-2024-001"));
    }

    #[tokio::test]
    async fn null_value_is_queued() {
        let s = Structurer::new(Scripted::ok(r#"{"invoice_no": null}"#));
        let doc = s.structure(&recognition("INV-2024-001", 90.0), &invoice_schema()).await;
        assert_eq!(doc.fields["invoice_no"].confidence, 0.0);
        assert!(doc.fields["invoice_no"].needs_validation);
        assert_eq!(doc.coverage, 0.0);
    }

    #[tokio::test]
    async fn empty_text_skips_the_provider() {
        let gen = Scripted::ok("{}");
        let s = Structurer::new(gen.clone());
        let report = s.structure_detailed(&recognition("  \n", 90.0), &invoice_schema()).await;
        assert_eq!(gen.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.document.coverage, 0.0);
        assert_eq!(report.document.validation_list, vec!["invoice_no"]);
        assert!(report.raw_response.is_none());
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_all_missing() {
        let s = Structurer::new(Scripted::failing("connection refused"));
        let report = s.structure_detailed(&recognition("INV-1", 90.0), &invoice_schema()).await;
        assert_eq!(report.document, all_missing(&invoice_schema()));
        assert!(report.diagnostics[0].contains("connection refused"));
    }

    #[tokio::test]
    async fn garbage_response_degrades_with_diagnostic() {
        let s = Structurer::new(Scripted::ok("I could not find anything."));
        let report = s.structure_detailed(&recognition("INV-1", 90.0), &invoice_schema()).await;
        assert_eq!(report.document.coverage, 0.0);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.raw_response.as_deref(), Some("I could not find anything."));
    }

    #[tokio::test]
    async fn text_is_cleaned_before_prompting() {
        let gen = Scripted::ok("{}");
        let s = Structurer::new(gen.clone());
        let report = s
            .structure_detailed(&recognition("INV-1\r\n\r\n\r\n  total   12", 80.0), &invoice_schema())
            .await;
        assert_eq!(report.cleaned_text, "INV-1\n\n total 12");
        assert!(gen.last_prompt.lock().unwrap().contains("INV-1\n\n total 12"));
    }

    struct BrokenTagger(AtomicBool);

    impl EntityTagger for BrokenTagger {
        fn tag(&self, _text: &str) -> Result<Vec<TaggedEntity>, String> {
            Err("model not loaded".into())
        }

        fn release(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn tagger_failure_keeps_pattern_entities() {
        let tagger = Arc::new(BrokenTagger(AtomicBool::new(false)));
        let mut s = Structurer::new(Scripted::ok(r#"{"invoice_no":"INV-1"}"#))
            .with_extractor(EntityExtractor::with_tagger(tagger.clone()));
        let report = s
            .structure_detailed(&recognition("INV-1 on 2024-03-05", 90.0), &invoice_schema())
            .await;
        assert_eq!(report.entities.dates.len(), 1);
        assert!(report.diagnostics.iter().any(|d| d.contains("model not loaded")));
        s.close();
        assert!(tagger.0.load(Ordering::SeqCst));
    }
}
