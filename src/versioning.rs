//! Schema version tracking: detect hand-edited field schemas and regenerate
//! their refined versions.
//!
//! Three sibling directories hold identically-named JSON files:
//!
//! ```text
//! configs/structures/
//!   ├─ origin/      authoritative, edited by people
//!   ├─ temp/        copy of origin taken at the last successful regeneration
//!   ├─ new/         refined schema produced from origin
//!   └─ template.json  reference layout the refinement imitates
//! ```
//!
//! A file is *stale* when its origin no longer matches its temp copy.
//! [`SchemaVersions::sync`] prunes derived files whose origin is gone, finds
//! the stale names and regenerates them.
//!
//! ## Why temp is written last
//!
//! `commit` writes `new/<name>` first and only then refreshes
//! `temp/<name>`. If the process dies in between, origin and temp still
//! differ and the next run regenerates the file again instead of silently
//! keeping an outdated refinement.
//!
//! One writer at a time: the tracker takes no locks, so callers must not run
//! two syncs over the same root concurrently.

use crate::error::DocStructError;
use crate::export::write_atomic;
use crate::pipeline::llm::{parse_structured_response, TextGenerator};
use crate::prompts;
use crate::schema::StructureSchema;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reference layout used when `template.json` is absent.
const DEFAULT_TEMPLATE: &str = r#"{
  "title": "Invoice",
  "description": "Value-added tax invoice issued by a supplier",
  "items": [
    {"field": "invoice_number", "description": "Invoice number printed in the top right corner", "type": "text", "pattern": "^[A-Z]{2,}-\\d+(-\\d+)*$"},
    {"field": "issue_date", "description": "Date the invoice was issued", "type": "date", "pattern": "^\\d{4}-\\d{2}-\\d{2}$"},
    {"field": "total_amount", "description": "Total amount including tax, without currency symbol", "type": "number"}
  ]
}"#;

/// Produces the refined version of an origin schema.
pub trait SchemaRegenerator: Send + Sync {
    fn regenerate<'a>(&'a self, name: &'a str, origin: &'a Value) -> BoxFuture<'a, Result<Value, String>>;
}

impl<F> SchemaRegenerator for F
where
    F: Fn(&str, &Value) -> Result<Value, String> + Send + Sync,
{
    fn regenerate<'a>(&'a self, name: &'a str, origin: &'a Value) -> BoxFuture<'a, Result<Value, String>> {
        let out = self(name, origin);
        Box::pin(async move { out })
    }
}

/// [`SchemaRegenerator`] that asks a [`TextGenerator`] to rewrite the origin
/// in the style of a reference template.
pub struct LlmRegenerator {
    generator: Arc<dyn TextGenerator>,
    template: String,
}

impl LlmRegenerator {
    pub fn new(generator: Arc<dyn TextGenerator>, template: impl Into<String>) -> Self {
        Self {
            generator,
            template: template.into(),
        }
    }

    /// Use `template_path` as the reference, or the built-in template when
    /// the file does not exist.
    pub async fn with_template_file(
        generator: Arc<dyn TextGenerator>,
        template_path: &Path,
    ) -> Result<Self, DocStructError> {
        let template = match tokio::fs::read_to_string(template_path).await {
            Ok(text) => {
                serde_json::from_str::<Value>(&text).map_err(|e| DocStructError::config(template_path, e))?;
                text
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No template at {}, using built-in reference", template_path.display());
                DEFAULT_TEMPLATE.to_string()
            }
            Err(e) => return Err(DocStructError::config(template_path, e)),
        };
        Ok(Self::new(generator, template))
    }
}

impl SchemaRegenerator for LlmRegenerator {
    fn regenerate<'a>(&'a self, name: &'a str, origin: &'a Value) -> BoxFuture<'a, Result<Value, String>> {
        Box::pin(async move {
            let origin_json = serde_json::to_string_pretty(origin).map_err(|e| e.to_string())?;
            let prompt = prompts::regeneration_prompt(&origin_json, &self.template);
            let raw = self.generator.generate(&prompt).await?;
            let parsed = parse_structured_response(&raw);
            if let Some(d) = parsed.diagnostic() {
                return Err(format!("{name}: {d}"));
            }
            Ok(Value::Object(parsed.into_value()))
        })
    }
}

/// Outcome of a commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitReport {
    pub regenerated: Vec<String>,
    /// `(file name, cause)` for every file left stale.
    pub failed: Vec<(String, String)>,
    /// Derived files removed by pruning.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pruned: Vec<PathBuf>,
}

/// The origin/temp/new directory triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaVersions {
    origin: PathBuf,
    temp: PathBuf,
    new: PathBuf,
    template: PathBuf,
}

impl SchemaVersions {
    /// Layout rooted at `root` (usually `configs/structures`).
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            origin: root.join("origin"),
            temp: root.join("temp"),
            new: root.join("new"),
            template: root.join("template.json"),
        }
    }

    pub fn origin_dir(&self) -> &Path {
        &self.origin
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp
    }

    pub fn new_dir(&self) -> &Path {
        &self.new
    }

    pub fn template_path(&self) -> &Path {
        &self.template
    }

    async fn ensure_dirs(&self) -> Result<(), DocStructError> {
        for dir in [&self.origin, &self.temp, &self.new] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| DocStructError::config(dir, format!("cannot create directory: {e}")))?;
        }
        Ok(())
    }

    /// Delete files in `new/` and `temp/` whose origin no longer exists.
    pub async fn prune(&self) -> Result<Vec<PathBuf>, DocStructError> {
        self.ensure_dirs().await?;
        let origin = list_json(&self.origin).await?;
        let mut removed = Vec::new();
        for dir in [&self.new, &self.temp] {
            for name in list_json(dir).await?.difference(&origin) {
                let path = dir.join(name);
                tokio::fs::remove_file(&path).await?;
                info!("Pruned {}", path.display());
                removed.push(path);
            }
        }
        Ok(removed)
    }

    /// Names of origin files whose temp copy is missing, unreadable or
    /// structurally different.
    pub async fn reconcile(&self) -> Result<BTreeSet<String>, DocStructError> {
        self.ensure_dirs().await?;
        let mut stale = BTreeSet::new();
        for name in list_json(&self.origin).await? {
            let origin_path = self.origin.join(&name);
            let origin = read_json(&origin_path)
                .await
                .map_err(|e| DocStructError::config(&origin_path, e))?;

            let temp_path = self.temp.join(&name);
            let up_to_date = match read_json(&temp_path).await {
                Ok(temp) => temp == origin,
                Err(e) => {
                    debug!("{} treated as stale: {e}", temp_path.display());
                    false
                }
            };
            if !up_to_date {
                stale.insert(name);
            }
        }
        debug!("{} stale schema(s)", stale.len());
        Ok(stale)
    }

    /// Regenerate each named file: write `new/<name>`, then copy origin into
    /// `temp/<name>`. Failures are recorded per file and leave it stale.
    pub async fn commit<R>(&self, names: impl IntoIterator<Item = String>, regenerator: &R) -> CommitReport
    where
        R: SchemaRegenerator + ?Sized,
    {
        let mut report = CommitReport::default();
        for name in names {
            match self.commit_one(&name, regenerator).await {
                Ok(()) => {
                    info!("Regenerated schema {name}");
                    report.regenerated.push(name);
                }
                Err(cause) => {
                    warn!("Schema {name} left stale: {cause}");
                    report.failed.push((name, cause));
                }
            }
        }
        report
    }

    async fn commit_one<R>(&self, name: &str, regenerator: &R) -> Result<(), String>
    where
        R: SchemaRegenerator + ?Sized,
    {
        let origin_path = self.origin.join(name);
        let origin_bytes = tokio::fs::read(&origin_path).await.map_err(|e| e.to_string())?;
        let origin: Value = serde_json::from_slice(&origin_bytes).map_err(|e| e.to_string())?;

        let refined = regenerator.regenerate(name, &origin).await?;
        StructureSchema::from_value(refined.clone(), &self.new.join(name))
            .map_err(|e| format!("regenerated schema rejected: {e}"))?;
        let pretty = serde_json::to_vec_pretty(&refined).map_err(|e| e.to_string())?;

        write_atomic(&self.new.join(name), &pretty).await.map_err(|e| e.to_string())?;
        write_atomic(&self.temp.join(name), &origin_bytes)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Prune, reconcile and commit in one pass.
    pub async fn sync<R>(&self, regenerator: &R) -> Result<CommitReport, DocStructError>
    where
        R: SchemaRegenerator + ?Sized,
    {
        let pruned = self.prune().await?;
        let stale = self.reconcile().await?;
        let mut report = self.commit(stale, regenerator).await;
        report.pruned = pruned;
        Ok(report)
    }

    /// The schema to structure with: `new/<name>` when it exists, otherwise
    /// the origin.
    pub async fn effective_schema(&self, name: &str) -> Result<StructureSchema, DocStructError> {
        let refined = self.new.join(name);
        if tokio::fs::try_exists(&refined).await.unwrap_or(false) {
            return StructureSchema::load(&refined).await;
        }
        StructureSchema::load(self.origin.join(name)).await
    }
}

/// `.json` file names in `dir`, skipping dot-files.
async fn list_json(dir: &Path) -> Result<BTreeSet<String>, DocStructError> {
    let mut names = BTreeSet::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| DocStructError::config(dir, e))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        if entry.file_type().await?.is_file() {
            names.insert(name);
        }
    }
    Ok(names)
}

async fn read_json(path: &Path) -> Result<Value, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn write(path: &Path, value: &Value) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_vec(value).unwrap()).unwrap();
    }

    fn invoice() -> Value {
        json!({"title": "Invoice", "items": [{"field": "invoice_no", "type": "text"}]})
    }

    fn refine(_name: &str, origin: &Value) -> Result<Value, String> {
        let mut v = origin.clone();
        v["description"] = json!("refined");
        Ok(v)
    }

    fn setup() -> (TempDir, SchemaVersions) {
        let dir = TempDir::new().unwrap();
        let versions = SchemaVersions::from_root(dir.path());
        write(&versions.origin_dir().join("invoice.json"), &invoice());
        (dir, versions)
    }

    #[tokio::test]
    async fn missing_temp_is_stale() {
        let (_dir, v) = setup();
        let stale = v.reconcile().await.unwrap();
        assert_eq!(stale, BTreeSet::from(["invoice.json".to_string()]));
    }

    #[tokio::test]
    async fn reconcile_is_stable_until_commit() {
        let (_dir, v) = setup();
        let first = v.reconcile().await.unwrap();
        assert_eq!(v.reconcile().await.unwrap(), first);

        let report = v.commit(first, &refine).await;
        assert_eq!(report.regenerated, vec!["invoice.json"]);
        assert!(v.reconcile().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn comparison_is_structural() {
        let (_dir, v) = setup();
        std::fs::create_dir_all(v.temp_dir()).unwrap();
        std::fs::write(
            v.temp_dir().join("invoice.json"),
            r#"{ "items": [ {"type": "text", "field": "invoice_no"} ],
                 "title": "Invoice" }"#,
        )
        .unwrap();
        assert!(v.reconcile().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn edited_origin_becomes_stale() {
        let (_dir, v) = setup();
        v.sync(&refine).await.unwrap();
        write(&v.origin_dir().join("invoice.json"), &json!({"title": "Receipt", "items": []}));
        assert_eq!(v.reconcile().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_temp_is_stale_but_malformed_origin_is_an_error() {
        let (_dir, v) = setup();
        std::fs::create_dir_all(v.temp_dir()).unwrap();
        std::fs::write(v.temp_dir().join("invoice.json"), "{oops").unwrap();
        assert_eq!(v.reconcile().await.unwrap().len(), 1);

        std::fs::write(v.origin_dir().join("invoice.json"), "{oops").unwrap();
        let err = v.reconcile().await.unwrap_err();
        assert!(matches!(err, DocStructError::ConfigError { .. }));
    }

    #[tokio::test]
    async fn prune_removes_orphans_only() {
        let (_dir, v) = setup();
        write(&v.new_dir().join("gone.json"), &invoice());
        write(&v.temp_dir().join("gone.json"), &invoice());
        write(&v.new_dir().join("invoice.json"), &invoice());
        std::fs::write(v.new_dir().join("notes.txt"), "keep").unwrap();

        let removed = v.prune().await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!v.new_dir().join("gone.json").exists());
        assert!(v.new_dir().join("invoice.json").exists());
        assert!(v.new_dir().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn failed_regeneration_leaves_file_stale() {
        let (_dir, v) = setup();
        let fail = |_: &str, _: &Value| -> Result<Value, String> { Err("model offline".into()) };
        let report = v.sync(&fail).await.unwrap();
        assert!(report.regenerated.is_empty());
        assert_eq!(report.failed[0].1, "model offline");
        assert!(!v.temp_dir().join("invoice.json").exists());
        assert!(!v.new_dir().join("invoice.json").exists());
        assert_eq!(v.reconcile().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_regenerated_schema_is_rejected() {
        let (_dir, v) = setup();
        let bad = |_: &str, _: &Value| -> Result<Value, String> { Ok(json!({"items": "nope"})) };
        let report = v.sync(&bad).await.unwrap();
        assert!(report.failed[0].1.contains("rejected"));
        assert!(!v.temp_dir().join("invoice.json").exists());
    }

    #[tokio::test]
    async fn effective_schema_prefers_refined() {
        let (_dir, v) = setup();
        assert!(v.effective_schema("invoice.json").await.unwrap().description.is_empty());
        v.sync(&refine).await.unwrap();
        assert_eq!(v.effective_schema("invoice.json").await.unwrap().description, "refined");
    }

    struct CountingGenerator(AtomicUsize);

    impl TextGenerator for CountingGenerator {
        fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, String>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            assert!(prompt.contains("Reference output"));
            Box::pin(async {
                Ok("```json\n{\"title\":\"Invoice\",\"description\":\"VAT\",\"items\":[]}\n```".to_string())
            })
        }
    }

    #[tokio::test]
    async fn llm_regenerator_uses_builtin_template_when_missing() {
        let (_dir, v) = setup();
        let gen = Arc::new(CountingGenerator(AtomicUsize::new(0)));
        let regen = LlmRegenerator::with_template_file(gen.clone(), v.template_path())
            .await
            .unwrap();
        let report = v.sync(&regen).await.unwrap();
        assert_eq!(report.regenerated.len(), 1);
        assert_eq!(gen.0.load(Ordering::SeqCst), 1);
        assert_eq!(v.effective_schema("invoice.json").await.unwrap().description, "VAT");
    }
}
