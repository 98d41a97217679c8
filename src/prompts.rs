//! Prompts for the generative provider.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: changing how fields are requested (a new
//!    sentinel rule, a different date format) means editing exactly one
//!    place.
//!
//! 2. **Testability**: unit tests inspect prompts directly without calling a
//!    model, so prompt regressions are easy to catch.
//!
//! Two prompts exist: field extraction from cleaned text, and regeneration of
//! a hand-written field schema into the house style of a reference template.

use crate::schema::StructureSchema;

/// Rules appended to every extraction prompt.
pub const EXTRACTION_RULES: &str = r#"Rules:
1. Output ONLY the JSON object. No explanations, no code fences.
2. If a field cannot be found in the text, use null for date and number fields and "" for all others.
3. Write dates as YYYY-MM-DD.
4. Write numbers as plain digits with an optional decimal point; drop currency symbols and thousands separators.
5. Copy text values exactly as they appear in the OCR text.
6. The output must be valid JSON."#;

/// Build the extraction prompt for one document.
///
/// Layout: document type and description, one block per field (name,
/// description, type, optional pattern), the cleaned text inside a fence,
/// a skeleton of the expected object with the per-type "not found" sentinel,
/// and [`EXTRACTION_RULES`].
pub fn extraction_prompt(schema: &StructureSchema, cleaned_text: &str) -> String {
    let mut fields = String::new();
    for item in &schema.items {
        fields.push_str(&format!(
            "- field: {}\n  description: {}\n  type: {}\n",
            item.field, item.description, item.field_type
        ));
        if let Some(pattern) = item.pattern() {
            fields.push_str(&format!("  pattern: {pattern}\n"));
        }
    }

    let skeleton = schema
        .items
        .iter()
        .map(|item| {
            let sentinel = if item.field_type.prefers_null() { "null" } else { "\"\"" };
            format!(
                "  {}: {sentinel}",
                serde_json::Value::String(item.field.clone())
            )
        })
        .collect::<Vec<_>>()
        .join(",\n");

    let title = if schema.title.is_empty() { "unknown" } else { &schema.title };

    format!(
        "You are an expert at extracting structured data from OCR output.\n\
         Extract the fields defined below from the OCR text.\n\n\
         Document type: {title}\n\
         Document description: {}\n\n\
         Fields to extract:\n{fields}\n\
         OCR text:\n```\n{cleaned_text}\n```\n\n\
         Respond with one JSON object shaped like this:\n{{\n{skeleton}\n}}\n\n\
         {EXTRACTION_RULES}",
        schema.description
    )
}

/// Build the prompt that rewrites a hand-written schema into the style of
/// `template`. Both arguments are JSON text.
pub fn regeneration_prompt(origin_json: &str, template_json: &str) -> String {
    format!(
        "You are an expert at writing field schemas for OCR data extraction.\n\
         Rewrite the informal schema below into a rigorous one that follows the \
         reference output's structure and conventions: precise descriptions, \
         explicit types and validation patterns where a field has a fixed format.\n\
         Keep every field of the input. Output only valid JSON, without \
         explanations or code fences.\n\n\
         Input:\n```json\n{origin_json}\n```\n\n\
         Reference output:\n```json\n{template_json}\n```"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType};

    fn schema() -> StructureSchema {
        StructureSchema {
            title: "Invoice".into(),
            description: "VAT invoice".into(),
            items: vec![
                FieldSpec::new("invoice_no", FieldType::Text)
                    .with_description("Invoice number")
                    .with_pattern(r"INV-\d+"),
                FieldSpec::new("issue_date", FieldType::Date),
                FieldSpec::new("total", FieldType::Number),
            ],
        }
    }

    #[test]
    fn extraction_prompt_lists_fields_and_text() {
        let p = extraction_prompt(&schema(), "INV-2024-001");
        assert!(p.contains("Document type: Invoice"));
        assert!(p.contains("- field: invoice_no\n  description: Invoice number\n  type: text\n  pattern: INV-\\d+"));
        assert!(p.contains("```\nINV-2024-001\n```"));
        assert!(p.contains("YYYY-MM-DD"));
    }

    #[test]
    fn skeleton_uses_type_sentinels() {
        let p = extraction_prompt(&schema(), "x");
        assert!(p.contains("  \"invoice_no\": \"\""));
        assert!(p.contains("  \"issue_date\": null"));
        assert!(p.contains("  \"total\": null"));
    }

    #[test]
    fn untitled_schema_says_unknown() {
        let p = extraction_prompt(&StructureSchema::default(), "x");
        assert!(p.contains("Document type: unknown"));
    }

    #[test]
    fn regeneration_prompt_embeds_both_documents() {
        let p = regeneration_prompt(r#"{"a":1}"#, r#"{"title":"T"}"#);
        assert!(p.contains("Input:\n```json\n{\"a\":1}\n```"));
        assert!(p.contains("Reference output:\n```json\n{\"title\":\"T\"}\n```"));
    }
}
