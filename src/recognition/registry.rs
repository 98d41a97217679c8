//! Engine registry and router.
//!
//! The registry document names every configured engine and which one is
//! current:
//!
//! ```json
//! {"ocr_engines": {
//!     "current": "pytesseract",
//!     "engines": {
//!         "pytesseract": {"languages": "chi_sim+eng", "oem": 3, "psm": 6},
//!         "google-cloud-vision": {"credentials_path": "creds.json"}
//!     }
//! }}
//! ```
//!
//! ## Why snapshots?
//!
//! Switching engines must never tear a recognition call in half: a call that
//! started on Tesseract finishes on Tesseract even if a switch lands in the
//! middle. The router therefore holds an immutable [`EngineSnapshot`] behind
//! an `Arc`. Readers clone the `Arc` (a pointer copy under a read lock) and
//! keep using it; a switch builds a new snapshot and swaps the pointer.
//! Switches are serialised by an async mutex so two concurrent switches
//! cannot both read the same "previous" engine.

use super::{EngineEntry, EngineKind, RecognitionProvider};
use crate::error::DocStructError;
use crate::export::write_atomic;
use crate::output::RecognitionResult;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Top-level key of the registry document.
const ROOT_KEY: &str = "ocr_engines";

/// Availability report for one engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub kind: String,
    pub description: String,
    pub available: bool,
    pub current: bool,
}

/// Immutable view of the registry at one version.
#[derive(Debug)]
pub struct EngineSnapshot {
    version: u64,
    current: String,
    previous: Option<String>,
    entries: BTreeMap<String, EngineEntry>,
    providers: BTreeMap<String, Arc<RecognitionProvider>>,
    /// Members of the document this crate does not interpret, kept for
    /// round-tripping.
    extra_root: Map<String, Value>,
    extra_section: Map<String, Value>,
}

impl EngineSnapshot {
    fn build(
        version: u64,
        current: String,
        previous: Option<String>,
        entries: BTreeMap<String, EngineEntry>,
        extra_root: Map<String, Value>,
        extra_section: Map<String, Value>,
    ) -> Result<Self, DocStructError> {
        if !entries.contains_key(&current) {
            return Err(DocStructError::UnknownEngine(current));
        }
        let fallback_words = fallback_vocabulary(&entries);
        let mut providers = BTreeMap::new();
        for (name, entry) in &entries {
            let provider = RecognitionProvider::from_entry(entry, fallback_words.clone())?;
            providers.insert(name.clone(), Arc::new(provider));
        }
        Ok(Self {
            version,
            current,
            previous,
            entries,
            providers,
            extra_root,
            extra_section,
        })
    }

    /// Monotonic counter, bumped by every successful switch.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn previous(&self) -> Option<&str> {
        self.previous.as_deref()
    }

    pub fn engine_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entry(&self, name: &str) -> Option<&EngineEntry> {
        self.entries.get(name)
    }

    pub fn provider(&self, name: &str) -> Option<&Arc<RecognitionProvider>> {
        self.providers.get(name)
    }

    /// The provider bound to the current engine.
    pub fn current_provider(&self) -> Result<&Arc<RecognitionProvider>, DocStructError> {
        self.providers
            .get(&self.current)
            .ok_or_else(|| DocStructError::UnknownEngine(self.current.clone()))
    }

    /// Whether the current engine wants color input.
    pub fn prefers_color(&self) -> bool {
        self.entries
            .get(&self.current)
            .is_some_and(|e| e.kind.prefers_color())
    }

    /// Recognize with the current engine of this snapshot.
    pub async fn recognize(&self, image: &[u8]) -> Result<RecognitionResult, DocStructError> {
        let provider = self.current_provider()?;
        debug!(engine = %self.current, version = self.version, "Recognizing {} bytes", image.len());
        provider.recognize(image).await
    }

    /// The registry document for this snapshot.
    pub fn to_document(&self) -> Value {
        let mut section = self.extra_section.clone();
        section.insert("current".into(), Value::String(self.current.clone()));
        if let Some(prev) = &self.previous {
            section.insert("previous".into(), Value::String(prev.clone()));
        }
        let engines: Map<String, Value> = self
            .entries
            .iter()
            .map(|(name, e)| (name.clone(), Value::Object(e.settings.clone())))
            .collect();
        section.insert("engines".into(), Value::Object(engines));

        let mut root = self.extra_root.clone();
        root.insert(ROOT_KEY.into(), Value::Object(section));
        Value::Object(root)
    }
}

/// The custom-words file of the first Tesseract entry, preferring one named
/// `pytesseract`.
fn fallback_vocabulary(entries: &BTreeMap<String, EngineEntry>) -> Option<PathBuf> {
    let words = |e: &EngineEntry| {
        e.tesseract_settings()
            .ok()
            .and_then(|s| s.custom_words_path)
    };
    entries
        .get("pytesseract")
        .filter(|e| e.kind == EngineKind::Tesseract)
        .and_then(words)
        .or_else(|| {
            entries
                .values()
                .filter(|e| e.kind == EngineKind::Tesseract)
                .find_map(words)
        })
}

/// Parse a registry document. Unknown engine kinds and a `current` that
/// names no engine are configuration errors.
fn parse_document(doc: Value, origin: &Path) -> Result<EngineSnapshot, DocStructError> {
    let Value::Object(mut root) = doc else {
        return Err(DocStructError::config(origin, "registry must be a JSON object"));
    };
    let Some(Value::Object(mut section)) = root.remove(ROOT_KEY) else {
        return Err(DocStructError::config(origin, format!("missing '{ROOT_KEY}' object")));
    };

    let current = match section.remove("current") {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        _ => return Err(DocStructError::config(origin, "'current' must name an engine")),
    };
    let previous = match section.remove("previous") {
        Some(Value::String(s)) => Some(s),
        _ => None,
    };
    let engines = match section.remove("engines") {
        Some(Value::Object(m)) => m,
        _ => return Err(DocStructError::config(origin, "'engines' must be an object")),
    };

    let mut entries = BTreeMap::new();
    for (name, settings) in engines {
        let Value::Object(settings) = settings else {
            return Err(DocStructError::config(origin, format!("engine '{name}' must be an object")));
        };
        let entry = EngineEntry::new(name.clone(), settings).map_err(|e| DocStructError::config(origin, e))?;
        entries.insert(name, entry);
    }
    if !entries.contains_key(&current) {
        return Err(DocStructError::config(
            origin,
            format!("current engine '{current}' is not configured"),
        ));
    }
    let previous = previous.filter(|p| entries.contains_key(p));

    EngineSnapshot::build(0, current, previous, entries, root, section)
}

// ── Router ───────────────────────────────────────────────────────────────

/// Routes recognition calls to the current engine and switches engines at
/// run time.
#[derive(Debug)]
pub struct EngineRouter {
    path: Option<PathBuf>,
    state: RwLock<Arc<EngineSnapshot>>,
    switch_lock: tokio::sync::Mutex<()>,
}

impl EngineRouter {
    /// Load the registry from a file. The file becomes the backing store for
    /// persisted switches.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DocStructError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DocStructError::config(path, format!("cannot read engine registry: {e}")))?;
        let doc: Value = serde_json::from_str(&raw).map_err(|e| DocStructError::config(path, e))?;
        let snapshot = parse_document(doc, path)?;
        info!(
            "Engine registry loaded from {}: current '{}', {} engines",
            path.display(),
            snapshot.current,
            snapshot.entries.len()
        );
        Ok(Self::with_snapshot(snapshot, Some(path.to_path_buf())))
    }

    /// Build a router from an in-memory document, without a backing file.
    pub fn from_value(doc: Value) -> Result<Self, DocStructError> {
        let snapshot = parse_document(doc, Path::new("<memory>"))?;
        Ok(Self::with_snapshot(snapshot, None))
    }

    /// A router with one default Tesseract engine named `pytesseract`.
    pub fn tesseract_default() -> Result<Self, DocStructError> {
        Self::from_value(json!({"ocr_engines": {"current": "pytesseract", "engines": {"pytesseract": {}}}}))
    }

    fn with_snapshot(snapshot: EngineSnapshot, path: Option<PathBuf>) -> Self {
        Self {
            path,
            state: RwLock::new(Arc::new(snapshot)),
            switch_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The current snapshot. Hold on to it to keep one engine choice across
    /// several calls.
    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        let guard = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn current_engine(&self) -> String {
        self.snapshot().current.clone()
    }

    pub fn previous_engine(&self) -> Option<String> {
        self.snapshot().previous.clone()
    }

    /// Stored settings of one engine.
    pub fn engine_config(&self, name: &str) -> Option<Map<String, Value>> {
        self.snapshot().entry(name).map(|e| e.settings.clone())
    }

    /// Recognize with whatever engine is current when the call starts.
    pub async fn recognize(&self, image: &[u8]) -> Result<RecognitionResult, DocStructError> {
        let snapshot = self.snapshot();
        snapshot.recognize(image).await
    }

    /// Description and availability of every configured engine.
    pub async fn available_engines(&self) -> BTreeMap<String, EngineStatus> {
        let snapshot = self.snapshot();
        let mut out = BTreeMap::new();
        for (name, entry) in &snapshot.entries {
            let available = match snapshot.provider(name) {
                Some(p) => p.is_available().await,
                None => false,
            };
            out.insert(
                name.clone(),
                EngineStatus {
                    kind: entry.kind.to_string(),
                    description: entry.description(),
                    available,
                    current: *name == snapshot.current,
                },
            );
        }
        out
    }

    /// Make `name` the current engine; the old current becomes previous.
    ///
    /// `overrides` are merged into the engine's stored settings. With
    /// `persist`, the updated registry is written back to the backing file
    /// before the switch becomes visible, so a failed write changes nothing.
    /// An unknown name fails with [`DocStructError::UnknownEngine`] and
    /// leaves the registry untouched.
    pub async fn try_switch_engine(
        &self,
        name: &str,
        overrides: Option<Map<String, Value>>,
        persist: bool,
    ) -> Result<(), DocStructError> {
        let _guard = self.switch_lock.lock().await;
        let old = self.snapshot();

        let Some(entry) = old.entries.get(name) else {
            return Err(DocStructError::UnknownEngine(name.to_string()));
        };
        let mut entries = old.entries.clone();
        if let Some(overrides) = overrides {
            let mut settings = entry.settings.clone();
            settings.extend(overrides);
            let updated = EngineEntry::new(name, settings).map_err(DocStructError::InvalidConfig)?;
            entries.insert(name.to_string(), updated);
        }

        let next = EngineSnapshot::build(
            old.version + 1,
            name.to_string(),
            Some(old.current.clone()),
            entries,
            old.extra_root.clone(),
            old.extra_section.clone(),
        )?;

        if persist {
            let path = self.path.as_deref().ok_or_else(|| {
                DocStructError::InvalidConfig("engine registry has no backing file to persist to".into())
            })?;
            let body = serde_json::to_vec_pretty(&next.to_document())
                .map_err(|e| DocStructError::Internal(format!("registry encoding failed: {e}")))?;
            write_atomic(path, &body).await?;
        }

        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = Arc::new(next);
        info!("Switched recognition engine: {} → {}", old.current, name);
        Ok(())
    }

    /// [`try_switch_engine`](Self::try_switch_engine) reporting only success.
    pub async fn switch_engine(
        &self,
        name: &str,
        overrides: Option<Map<String, Value>>,
        persist: bool,
    ) -> bool {
        match self.try_switch_engine(name, overrides, persist).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Engine switch to '{name}' failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> Value {
        json!({
            "app": {"name": "docstruct"},
            "ocr_engines": {
                "current": "pytesseract",
                "engines": {
                    "pytesseract": {"languages": "eng", "custom_words_path": "words.txt"},
                    "google-cloud-vision": {"credentials_path": "creds.json", "language_hints": ["zh"]}
                }
            }
        })
    }

    #[test]
    fn loads_current_and_names() {
        let router = EngineRouter::from_value(registry()).unwrap();
        assert_eq!(router.current_engine(), "pytesseract");
        assert_eq!(router.previous_engine(), None);
        let snap = router.snapshot();
        assert_eq!(snap.engine_names().collect::<Vec<_>>(), vec!["google-cloud-vision", "pytesseract"]);
        assert!(!snap.prefers_color());
    }

    #[test]
    fn google_borrows_tesseract_vocabulary() {
        let router = EngineRouter::from_value(registry()).unwrap();
        let snap = router.snapshot();
        match snap.provider("google-cloud-vision").map(|p| p.as_ref()) {
            Some(RecognitionProvider::GoogleVision(g)) => {
                assert_eq!(g.vocabulary_path(), Some(&PathBuf::from("words.txt")));
            }
            other => panic!("unexpected provider {other:?}"),
        }
    }

    #[test]
    fn current_must_be_configured() {
        let mut doc = registry();
        doc["ocr_engines"]["current"] = json!("abbyy");
        let err = EngineRouter::from_value(doc).unwrap_err();
        assert!(matches!(err, DocStructError::ConfigError { .. }));
    }

    #[test]
    fn unknown_provider_kind_fails_closed() {
        let mut doc = registry();
        doc["ocr_engines"]["engines"]["abbyy"] = json!({});
        assert!(EngineRouter::from_value(doc).is_err());
    }

    #[tokio::test]
    async fn switch_to_unknown_engine_changes_nothing() {
        let router = EngineRouter::from_value(registry()).unwrap();
        let before = router.snapshot().version();
        assert!(!router.switch_engine("abbyy", None, false).await);
        assert_eq!(router.current_engine(), "pytesseract");
        assert_eq!(router.previous_engine(), None);
        assert_eq!(router.snapshot().version(), before);
    }

    #[tokio::test]
    async fn switch_records_previous_and_applies_overrides() {
        let router = EngineRouter::from_value(registry()).unwrap();
        let overrides = json!({"language_hints": ["en"]}).as_object().cloned();
        assert!(router.switch_engine("google-cloud-vision", overrides, false).await);
        assert_eq!(router.current_engine(), "google-cloud-vision");
        assert_eq!(router.previous_engine().as_deref(), Some("pytesseract"));
        assert_eq!(router.engine_config("google-cloud-vision").unwrap()["language_hints"], json!(["en"]));
        assert!(router.snapshot().prefers_color());
        assert_eq!(router.snapshot().version(), 1);
    }

    #[tokio::test]
    async fn held_snapshot_is_unaffected_by_switch() {
        let router = EngineRouter::from_value(registry()).unwrap();
        let in_flight = router.snapshot();
        router.try_switch_engine("google-cloud-vision", None, false).await.unwrap();
        assert_eq!(in_flight.current(), "pytesseract");
        assert_eq!(router.current_engine(), "google-cloud-vision");
    }

    #[tokio::test]
    async fn persist_without_backing_file_fails_and_keeps_state() {
        let router = EngineRouter::from_value(registry()).unwrap();
        let err = router
            .try_switch_engine("google-cloud-vision", None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, DocStructError::InvalidConfig(_)));
        assert_eq!(router.current_engine(), "pytesseract");
    }

    #[tokio::test]
    async fn persisted_switch_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ocr_engines.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&registry()).unwrap()).unwrap();

        let router = EngineRouter::load(&path).await.unwrap();
        router.try_switch_engine("google-cloud-vision", None, true).await.unwrap();

        let reloaded = EngineRouter::load(&path).await.unwrap();
        assert_eq!(reloaded.current_engine(), "google-cloud-vision");
        assert_eq!(reloaded.previous_engine().as_deref(), Some("pytesseract"));

        let doc: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["app"]["name"], "docstruct");
        assert_eq!(doc["ocr_engines"]["engines"]["pytesseract"]["languages"], "eng");
    }

    #[tokio::test]
    async fn missing_registry_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = EngineRouter::load(dir.path().join("none.json")).await.unwrap_err();
        assert!(matches!(err, DocStructError::ConfigError { .. }));
    }

    #[tokio::test]
    async fn concurrent_switches_serialise() {
        let router = Arc::new(EngineRouter::from_value(registry()).unwrap());
        let a = {
            let r = Arc::clone(&router);
            tokio::spawn(async move { r.switch_engine("google-cloud-vision", None, false).await })
        };
        let b = {
            let r = Arc::clone(&router);
            tokio::spawn(async move { r.switch_engine("pytesseract", None, false).await })
        };
        assert!(a.await.unwrap() && b.await.unwrap());
        let snap = router.snapshot();
        assert_eq!(snap.version(), 2);
        assert_ne!(snap.previous(), Some(snap.current()));
    }
}
