//! Field-level confidence scoring.
//!
//! A provider value is only as trustworthy as the evidence behind it. The
//! scorer starts from the recognition engine's own confidence and adjusts it
//! by what the document itself corroborates:
//!
//! ```text
//! value missing ─────────────────────────────▶ 0, review
//! base = min(ocr, cap)
//!   ± literal found in cleaned text  (+bonus / −penalty)
//!   + entity of the field's category (+bonus, source=entity-hint)
//!   + declared pattern matches       (+bonus, source=pattern)
//! clamp 0..=100; review when ≤ threshold
//! ```
//!
//! The constants are heuristics, not probabilities. They live in
//! [`ScoringConfig`] so a deployment can recalibrate them against its own
//! review outcomes.

use crate::entities::EntitySet;
use crate::error::DocStructError;
use crate::output::{FieldConfidence, FieldSource, StructuredDocument};
use crate::schema::{FieldSpec, StructureSchema};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::warn;

/// Scoring weights and the review cutoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Upper bound on the engine confidence used as the base score.
    pub ocr_cap: f64,
    /// Added when the value appears verbatim in the cleaned text.
    pub substring_bonus: f64,
    /// Subtracted when it does not.
    pub unsupported_penalty: f64,
    pub entity_hint_bonus: f64,
    pub pattern_bonus: f64,
    /// Fields at or below this confidence go to human review.
    pub review_threshold: f64,
    pub date_keywords: Vec<String>,
    pub amount_keywords: Vec<String>,
    pub phone_keywords: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let words = |w: &[&str]| -> Vec<String> { w.iter().map(|s| s.to_string()).collect() };
        Self {
            ocr_cap: 95.0,
            substring_bonus: 5.0,
            unsupported_penalty: 10.0,
            entity_hint_bonus: 5.0,
            pattern_bonus: 5.0,
            review_threshold: 80.0,
            date_keywords: words(&["date", "日期", "time", "时间"]),
            amount_keywords: words(&[
                "amount", "total", "price", "sum", "fee", "tax", "金额", "价", "税", "费",
            ]),
            phone_keywords: words(&["phone", "tel", "mobile", "电话", "手机"]),
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), DocStructError> {
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(self.ocr_cap) {
            return Err(DocStructError::InvalidConfig(format!(
                "ocr_cap must be within 0..=100, got {}",
                self.ocr_cap
            )));
        }
        if !in_range(self.review_threshold) {
            return Err(DocStructError::InvalidConfig(format!(
                "review_threshold must be within 0..=100, got {}",
                self.review_threshold
            )));
        }
        for (name, v) in [
            ("substring_bonus", self.substring_bonus),
            ("unsupported_penalty", self.unsupported_penalty),
            ("entity_hint_bonus", self.entity_hint_bonus),
            ("pattern_bonus", self.pattern_bonus),
        ] {
            if !(v.is_finite() && v >= 0.0) {
                return Err(DocStructError::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {v}"
                )));
            }
        }
        Ok(())
    }

    /// Which entity category a field name belongs to, by case-insensitive
    /// keyword substring. Date wins over amount, amount over phone.
    pub fn category(&self, field_name: &str) -> Option<FieldCategory> {
        let name = field_name.to_lowercase();
        let hit = |words: &[String]| words.iter().any(|w| !w.is_empty() && name.contains(&w.to_lowercase()));
        if hit(&self.date_keywords) {
            Some(FieldCategory::Date)
        } else if hit(&self.amount_keywords) {
            Some(FieldCategory::Amount)
        } else if hit(&self.phone_keywords) {
            Some(FieldCategory::Phone)
        } else {
            None
        }
    }
}

/// Entity categories a field name can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCategory {
    Date,
    Amount,
    Phone,
}

impl FieldCategory {
    fn has_hints(self, entities: &EntitySet) -> bool {
        match self {
            Self::Date => !entities.dates.is_empty(),
            Self::Amount => !entities.amounts.is_empty(),
            Self::Phone => !entities.phone_numbers.is_empty(),
        }
    }
}

/// What the document offers in support of provider values.
#[derive(Debug, Clone, Copy)]
pub struct Evidence<'a> {
    pub cleaned_text: &'a str,
    pub entities: &'a EntitySet,
    /// Engine confidence in `[0,100]`.
    pub ocr_confidence: f64,
}

/// `true` for null, empty strings and empty containers.
pub fn is_missing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// The text a reader would look for in the document.
fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Compiled field patterns by source text. `None` marks a pattern that
/// failed to compile, so the warning is logged once.
static PATTERNS: Lazy<Mutex<HashMap<String, Option<Regex>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn compiled_pattern(field: &str, pattern: &str) -> Option<Regex> {
    let mut cache = PATTERNS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    cache
        .entry(pattern.to_string())
        .or_insert_with(|| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("Field '{field}': ignoring invalid pattern {pattern:?}: {e}");
                None
            }
        })
        .clone()
}

/// Score one provider value. `literal_value` is what the provider actually
/// wrote, before any type coercion, and is what the text is searched for.
pub fn score_field(
    spec: &FieldSpec,
    value: Value,
    literal_value: &Value,
    evidence: &Evidence<'_>,
    cfg: &ScoringConfig,
) -> FieldConfidence {
    if is_missing(&value) {
        return FieldConfidence::missing();
    }

    let ocr = if evidence.ocr_confidence.is_finite() {
        evidence.ocr_confidence
    } else {
        0.0
    };
    let mut score = ocr.min(cfg.ocr_cap);
    let mut source = FieldSource::Model;

    let needle = literal(literal_value);
    if !needle.is_empty() && evidence.cleaned_text.contains(&needle) {
        score += cfg.substring_bonus;
    } else {
        score -= cfg.unsupported_penalty;
    }

    if let Some(category) = cfg.category(&spec.field) {
        if category.has_hints(evidence.entities) {
            score += cfg.entity_hint_bonus;
            source = FieldSource::EntityHint;
        }
    }

    if let Some(re) = spec.pattern().and_then(|p| compiled_pattern(&spec.field, p)) {
        if re.is_match(&needle) {
            score += cfg.pattern_bonus;
            source = FieldSource::Pattern;
        }
    }

    let confidence = round2(score.clamp(0.0, 100.0));
    FieldConfidence {
        value,
        confidence,
        source,
        needs_validation: confidence <= cfg.review_threshold,
    }
}

/// Score every schema field against the provider's output map.
pub fn score_document(
    schema: &StructureSchema,
    provider_values: &Map<String, Value>,
    evidence: &Evidence<'_>,
    cfg: &ScoringConfig,
) -> StructuredDocument {
    let mut fields = BTreeMap::new();
    let mut validation_list = Vec::new();
    let mut populated = 0usize;

    for spec in &schema.items {
        let raw = provider_values.get(&spec.field).cloned().unwrap_or(Value::Null);
        let typed = coerce(&raw, spec);
        let scored = score_field(spec, typed, &raw, evidence, cfg);
        if !is_missing(&scored.value) {
            populated += 1;
        }
        if scored.needs_validation {
            validation_list.push(spec.field.clone());
        }
        fields.insert(spec.field.clone(), scored);
    }

    StructuredDocument {
        fields,
        coverage: coverage(populated, schema.items.len()),
        validation_list,
    }
}

/// Every field missing, every field queued for review.
pub fn all_missing(schema: &StructureSchema) -> StructuredDocument {
    StructuredDocument {
        fields: schema
            .items
            .iter()
            .map(|f| (f.field.clone(), FieldConfidence::missing()))
            .collect(),
        coverage: 0.0,
        validation_list: schema.field_names().map(str::to_string).collect(),
    }
}

fn coverage(populated: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(100.0 * populated as f64 / total as f64)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Coerce a provider value to the field's declared type. Number fields
/// accept `"1,234.50"`, `"￥99"` and similar strings; anything that does not
/// parse is kept as the provider wrote it.
pub fn coerce(value: &Value, spec: &FieldSpec) -> Value {
    match (&spec.field_type, value) {
        (crate::schema::FieldType::Number, Value::String(s)) => {
            let digits: String = s
                .trim()
                .trim_start_matches(['￥', '¥', '$'])
                .trim_end_matches(['元', '圆'])
                .chars()
                .filter(|c| !matches!(c, ',' | '，' | ' '))
                .collect();
            if digits.is_empty() {
                return Value::Null;
            }
            if let Ok(i) = digits.parse::<i64>() {
                return Value::from(i);
            }
            match digits.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                Some(n) => Value::Number(n),
                None => value.clone(),
            }
        }
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::extract_patterns;
    use crate::schema::FieldType;
    use serde_json::json;

    fn evidence<'a>(text: &'a str, entities: &'a EntitySet, ocr: f64) -> Evidence<'a> {
        Evidence {
            cleaned_text: text,
            entities,
            ocr_confidence: ocr,
        }
    }

    #[test]
    fn pattern_and_substring_reach_full_confidence() {
        let spec = FieldSpec::new("invoice_no", FieldType::Text).with_pattern(r"INV-\d+");
        let none = EntitySet::default();
        let v = json!("INV-2024-001");
        let out = score_field(&spec, v.clone(), &v, &evidence("INV-2024-001", &none, 90.0), &ScoringConfig::default());
        assert_eq!(out.confidence, 100.0);
        assert_eq!(out.source, FieldSource::Pattern);
        assert!(!out.needs_validation);
    }

    #[test]
    fn unsupported_value_is_penalised() {
        let spec = FieldSpec::new("buyer", FieldType::Text);
        let none = EntitySet::default();
        let v = json!("Globex");
        let out = score_field(&spec, v.clone(), &v, &evidence("Acme Corp", &none, 90.0), &ScoringConfig::default());
        assert_eq!(out.confidence, 80.0);
        assert_eq!(out.source, FieldSource::Model);
        assert!(out.needs_validation, "80 is at the cutoff and must be reviewed");
    }

    #[test]
    fn entity_hint_sets_source() {
        let text = "开票日期 2024-01-05";
        let entities = extract_patterns(text);
        let spec = FieldSpec::new("issue_date", FieldType::Date);
        let v = json!("2024-01-05");
        let out = score_field(&spec, v.clone(), &v, &evidence(text, &entities, 99.0), &ScoringConfig::default());
        assert_eq!(out.confidence, 100.0);
        assert_eq!(out.source, FieldSource::EntityHint);
    }

    #[test]
    fn pattern_overrides_entity_hint() {
        let text = "金额 ￥100.00";
        let entities = extract_patterns(text);
        let spec = FieldSpec::new("total_amount", FieldType::Text).with_pattern(r"^\d+\.\d{2}$");
        let v = json!("100.00");
        let out = score_field(&spec, v.clone(), &v, &evidence(text, &entities, 70.0), &ScoringConfig::default());
        assert_eq!(out.confidence, 85.0);
        assert_eq!(out.source, FieldSource::Pattern);
    }

    #[test]
    fn malformed_pattern_gives_no_bonus() {
        let spec = FieldSpec::new("code", FieldType::Text).with_pattern("([unclosed");
        let none = EntitySet::default();
        let v = json!("X1");
        let out = score_field(&spec, v.clone(), &v, &evidence("X1", &none, 50.0), &ScoringConfig::default());
        assert_eq!(out.confidence, 55.0);
        assert_eq!(out.source, FieldSource::Model);
    }

    #[test]
    fn patterns_compile_once() {
        let pattern = r"^RCP-\d{6}$";
        let first = compiled_pattern("receipt_no", pattern).unwrap();
        let second = compiled_pattern("receipt_no", pattern).unwrap();
        assert_eq!(first.as_str(), second.as_str());
        assert!(PATTERNS.lock().unwrap().contains_key(pattern));

        assert!(compiled_pattern("code", "(?P<broken").is_none());
        assert!(matches!(PATTERNS.lock().unwrap().get("(?P<broken"), Some(None)));
    }

    #[test]
    fn confidence_clamped_for_adversarial_input() {
        let spec = FieldSpec::new("x", FieldType::Text);
        let none = EntitySet::default();
        let v = json!("zzz");
        for ocr in [f64::NAN, -50.0, 0.0, 1e9] {
            let out = score_field(&spec, v.clone(), &v, &evidence("", &none, ocr), &ScoringConfig::default());
            assert!((0.0..=100.0).contains(&out.confidence), "ocr={ocr} → {}", out.confidence);
            assert_eq!(out.needs_validation, out.confidence <= 80.0);
        }
    }

    #[test]
    fn empty_values_are_missing() {
        let spec = FieldSpec::new("x", FieldType::Text);
        let none = EntitySet::default();
        for v in [json!(null), json!(""), json!("   "), json!([])] {
            let out = score_field(&spec, v.clone(), &v, &evidence("text", &none, 90.0), &ScoringConfig::default());
            assert_eq!(out.confidence, 0.0);
            assert!(out.needs_validation);
            assert_eq!(out.source, FieldSource::Model);
        }
    }

    #[test]
    fn document_coverage_and_order() {
        let schema = StructureSchema {
            title: "Invoice".into(),
            description: String::new(),
            items: vec![
                FieldSpec::new("seller", FieldType::Text),
                FieldSpec::new("buyer", FieldType::Text),
                FieldSpec::new("code", FieldType::Text),
            ],
        };
        let none = EntitySet::default();
        let values = json!({"seller": "Acme", "buyer": null}).as_object().cloned().unwrap();
        let doc = score_document(&schema, &values, &evidence("Acme", &none, 90.0), &ScoringConfig::default());
        assert_eq!(doc.coverage, 33.33);
        assert_eq!(doc.validation_list, vec!["buyer", "code"]);
        assert!(!doc.fields["seller"].needs_validation);
    }

    #[test]
    fn empty_schema_has_zero_coverage() {
        let none = EntitySet::default();
        let doc = score_document(&StructureSchema::default(), &Map::new(), &evidence("a", &none, 90.0), &ScoringConfig::default());
        assert_eq!(doc.coverage, 0.0);
        assert!(doc.fields.is_empty());
    }

    #[test]
    fn number_fields_are_coerced() {
        let spec = FieldSpec::new("total", FieldType::Number);
        assert_eq!(coerce(&json!("1,234.50"), &spec), json!(1234.5));
        assert_eq!(coerce(&json!("￥99"), &spec), json!(99));
        assert_eq!(coerce(&json!("n/a"), &spec), json!("n/a"));
        assert_eq!(coerce(&json!(""), &spec), json!(null));
        let text = FieldSpec::new("name", FieldType::Text);
        assert_eq!(coerce(&json!("1,234"), &text), json!("1,234"));
    }

    #[test]
    fn literal_of_coerced_number_uses_raw_text() {
        let spec = FieldSpec::new("total", FieldType::Number);
        let none = EntitySet::default();
        let raw = json!("1,234.50");
        let out = score_field(&spec, coerce(&raw, &spec), &raw, &evidence("总计 1,234.50", &none, 90.0), &ScoringConfig::default());
        assert_eq!(out.value, json!(1234.5));
        assert_eq!(out.confidence, 95.0);
    }

    #[test]
    fn category_keywords() {
        let cfg = ScoringConfig::default();
        assert_eq!(cfg.category("Invoice_Date"), Some(FieldCategory::Date));
        assert_eq!(cfg.category("价税合计"), Some(FieldCategory::Amount));
        assert_eq!(cfg.category("联系电话"), Some(FieldCategory::Phone));
        assert_eq!(cfg.category("seller"), None);
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let cfg = ScoringConfig {
            review_threshold: 120.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        assert!(ScoringConfig::default().validate().is_ok());
    }
}
