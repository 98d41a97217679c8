//! Field schemas: what the structuring step is asked to extract.
//!
//! A schema file looks like
//!
//! ```json
//! {
//!   "title": "Invoice",
//!   "description": "VAT invoice",
//!   "items": [
//!     {"field": "invoice_no", "description": "Invoice number", "type": "text", "pattern": "INV-\\d+"},
//!     {"field": "issue_date", "description": "Date of issue", "type": "date"}
//!   ]
//! }
//! ```
//!
//! Schemas are read once per run and never mutated while structuring; the
//! version tracker in [`crate::versioning`] is the only writer of these files.

use crate::error::DocStructError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Declared value type of a field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldType {
    #[default]
    Text,
    Date,
    Number,
    /// Any other declared type, kept verbatim.
    Other(String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::Text => "text",
            FieldType::Date => "date",
            FieldType::Number => "number",
            FieldType::Other(s) => s,
        }
    }

    /// Fields whose "not found" sentinel is `null` rather than `""`.
    pub fn prefers_null(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::Number)
    }
}

impl From<&str> for FieldType {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "" | "text" | "string" => FieldType::Text,
            "date" => FieldType::Date,
            "number" | "decimal" | "integer" | "float" | "小数" | "数字" => FieldType::Number,
            other => FieldType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FieldType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(FieldType::from(s.as_str()))
    }
}

/// One field to extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Unique key within the schema.
    pub field: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub field_type: FieldType,
    /// Validation regex. An empty string means no pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl FieldSpec {
    pub fn new(field: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            field: field.into(),
            description: String::new(),
            field_type,
            pattern: None,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The validation pattern, ignoring blank entries.
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref().filter(|p| !p.trim().is_empty())
    }
}

/// An ordered list of fields plus document-level context.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructureSchema {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub items: Vec<FieldSpec>,
}

impl StructureSchema {
    /// Parse and validate a schema from a JSON value.
    pub fn from_value(value: serde_json::Value, origin: &Path) -> Result<Self, DocStructError> {
        let schema: StructureSchema =
            serde_json::from_value(value).map_err(|e| DocStructError::config(origin, e))?;
        schema.validate(origin)?;
        Ok(schema)
    }

    pub fn from_json_str(json: &str, origin: &Path) -> Result<Self, DocStructError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| DocStructError::config(origin, e))?;
        Self::from_value(value, origin)
    }

    /// Read a schema file from disk.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DocStructError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DocStructError::config(path, format!("cannot read schema: {e}")))?;
        Self::from_json_str(&text, path)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|f| f.field.as_str())
    }

    fn validate(&self, origin: &Path) -> Result<(), DocStructError> {
        let mut seen = HashSet::new();
        for item in &self.items {
            if item.field.trim().is_empty() {
                return Err(DocStructError::config(origin, "schema item with empty field name"));
            }
            if !seen.insert(item.field.as_str()) {
                return Err(DocStructError::config(
                    origin,
                    format!("duplicate field name '{}'", item.field),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<StructureSchema, DocStructError> {
        StructureSchema::from_json_str(json, Path::new("test.json"))
    }

    #[test]
    fn parses_minimal_schema() {
        let s = parse(r#"{"title":"Invoice","items":[{"field":"invoice_no","pattern":"INV-\\d+"}]}"#)
            .unwrap();
        assert_eq!(s.title, "Invoice");
        assert_eq!(s.items.len(), 1);
        assert_eq!(s.items[0].field_type, FieldType::Text);
        assert_eq!(s.items[0].pattern(), Some(r"INV-\d+"));
    }

    #[test]
    fn maps_declared_types() {
        let s = parse(
            r#"{"items":[
                {"field":"a","type":"date"},
                {"field":"b","type":"小数"},
                {"field":"c","type":"phone"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(s.items[0].field_type, FieldType::Date);
        assert_eq!(s.items[1].field_type, FieldType::Number);
        assert_eq!(s.items[2].field_type, FieldType::Other("phone".into()));
        assert!(s.items[1].field_type.prefers_null());
    }

    #[test]
    fn blank_pattern_is_none() {
        let s = parse(r#"{"items":[{"field":"a","pattern":"  "}]}"#).unwrap();
        assert_eq!(s.items[0].pattern(), None);
    }

    #[test]
    fn rejects_duplicate_fields() {
        let err = parse(r#"{"items":[{"field":"a"},{"field":"a"}]}"#).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "got: {err}");
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(parse("{not json"), Err(DocStructError::ConfigError { .. })));
    }

    #[test]
    fn load_reports_missing_file_as_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope.json");
        let err = tokio_test::block_on(StructureSchema::load(&missing)).unwrap_err();
        assert_eq!(err.kind(), "config");

        std::fs::write(&missing, r#"{"title":"R","items":[{"field":"total","type":"number"}]}"#).unwrap();
        let s = tokio_test::block_on(StructureSchema::load(&missing)).unwrap();
        assert_eq!(s.field_names().collect::<Vec<_>>(), vec!["total"]);
    }

    #[test]
    fn type_round_trips_as_string() {
        let spec = FieldSpec::new("total", FieldType::Number);
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "number");
        assert!(json.get("pattern").is_none());
    }
}
