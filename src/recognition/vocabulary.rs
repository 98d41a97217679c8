//! Vocabulary correction for engines without a user dictionary.
//!
//! A vocabulary file lists domain terms, one per line:
//!
//! ```text
//! # comments and blank lines are ignored
//! 发票号玛 -> 发票号码
//! 增值税专用发票
//! Acme Corp → ACME Corporation
//! ```
//!
//! `a -> b` (or `a → b`) rewrites `a` to `b`; a bare term maps to itself and
//! only takes part in fuzzy matching.
//!
//! Correction runs in two passes. The exact pass replaces known phrases,
//! longest first, in a single scan so a replacement is never re-matched. The
//! fuzzy pass then looks at each whitespace-separated token that is not
//! already a known term and swaps it for the closest vocabulary entry when
//! their similarity reaches the threshold.

use crate::error::{DocStructError, Recovered};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Default minimum similarity for a fuzzy replacement.
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.8;

static RE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+").unwrap());

/// Entry counts, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VocabularyStats {
    pub entries: usize,
    pub corrections: usize,
    pub terms: usize,
}

#[derive(Debug, Clone)]
pub struct Vocabulary {
    path: Option<PathBuf>,
    /// Original → corrected, in file order. A later line wins.
    entries: Vec<(String, String)>,
    fuzzy_threshold: f64,
}

impl Vocabulary {
    /// Parse vocabulary text.
    pub fn parse(text: &str) -> Self {
        let mut vocab = Self {
            path: None,
            entries: Vec::new(),
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
        };
        for line in text.lines() {
            if let Some((original, corrected)) = parse_line(line) {
                vocab.insert(original, corrected);
            }
        }
        vocab
    }

    /// Load a vocabulary file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DocStructError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DocStructError::config(path, format!("cannot read vocabulary: {e}")))?;
        let mut vocab = Self::parse(&text);
        vocab.path = Some(path.to_path_buf());
        debug!("Loaded {} vocabulary entries from {}", vocab.entries.len(), path.display());
        Ok(vocab)
    }

    pub fn with_fuzzy_threshold(mut self, threshold: f64) -> Self {
        self.fuzzy_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, original: String, corrected: String) {
        match self.entries.iter_mut().find(|(o, _)| *o == original) {
            Some(entry) => entry.1 = corrected,
            None => self.entries.push((original, corrected)),
        }
    }

    /// Add a term and append it to the backing file, if there is one.
    pub async fn add_custom_word(
        &mut self,
        original: &str,
        corrected: Option<&str>,
    ) -> Result<(), DocStructError> {
        let original = original.trim();
        if original.is_empty() {
            return Err(DocStructError::InvalidConfig("vocabulary term is empty".into()));
        }
        let corrected = corrected.map(str::trim).filter(|c| !c.is_empty()).unwrap_or(original);

        if let Some(path) = &self.path {
            let line = if corrected == original {
                format!("{original}\n")
            } else {
                format!("{original} -> {corrected}\n")
            };
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| DocStructError::OutputWriteFailed {
                    path: path.clone(),
                    source: e,
                })?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| DocStructError::OutputWriteFailed {
                    path: path.clone(),
                    source: e,
                })?;
        }
        self.insert(original.to_string(), corrected.to_string());
        Ok(())
    }

    pub fn stats(&self) -> VocabularyStats {
        let corrections = self.entries.iter().filter(|(o, c)| o != c).count();
        VocabularyStats {
            entries: self.entries.len(),
            corrections,
            terms: self.entries.len() - corrections,
        }
    }

    /// Correct recognized text. Never fails: on any internal error the input
    /// comes back unchanged with a diagnostic.
    pub fn correct(&self, text: &str) -> Recovered<String> {
        if self.entries.is_empty() || text.is_empty() {
            return Recovered::Enhanced(text.to_string());
        }
        match self.exact_replace(text) {
            Ok(replaced) => Recovered::Enhanced(self.fuzzy_replace(&replaced)),
            Err(e) => {
                warn!("Vocabulary correction skipped: {e}");
                Recovered::fallback(text.to_string(), format!("vocabulary correction failed: {e}"))
            }
        }
    }

    /// Replace known phrases, longest first, in one pass.
    pub fn exact_replace(&self, text: &str) -> Result<String, regex::Error> {
        let mut rewrites: Vec<&(String, String)> =
            self.entries.iter().filter(|(o, c)| o != c).collect();
        if rewrites.is_empty() {
            return Ok(text.to_string());
        }
        rewrites.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));

        let alternation = rewrites
            .iter()
            .map(|(original, _)| bounded(original))
            .collect::<Vec<_>>()
            .join("|");
        let re = Regex::new(&alternation)?;
        let lookup: HashMap<&str, &str> = rewrites
            .iter()
            .map(|(o, c)| (o.as_str(), c.as_str()))
            .collect();

        Ok(re
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let hit = &caps[0];
                lookup.get(hit).copied().unwrap_or(hit).to_string()
            })
            .into_owned())
    }

    /// Swap near-miss tokens for their closest vocabulary entry. Whitespace
    /// between tokens is preserved.
    pub fn fuzzy_replace(&self, text: &str) -> String {
        let known: HashSet<&str> = self
            .entries
            .iter()
            .flat_map(|(o, c)| [o.as_str(), c.as_str()])
            .collect();

        RE_TOKEN
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let token = &caps[0];
                if known.contains(token) {
                    return token.to_string();
                }
                let mut best: Option<(&str, f64)> = None;
                for (original, corrected) in &self.entries {
                    let r = similarity(token, original);
                    if r >= self.fuzzy_threshold && best.map_or(true, |(_, b)| r > b) {
                        best = Some((corrected.as_str(), r));
                    }
                }
                best.map_or_else(|| token.to_string(), |(c, _)| c.to_string())
            })
            .into_owned()
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let split = line
        .split_once("->")
        .or_else(|| line.split_once('→'));
    match split {
        Some((a, b)) => {
            let (a, b) = (a.trim(), b.trim());
            (!a.is_empty() && !b.is_empty()).then(|| (a.to_string(), b.to_string()))
        }
        None => Some((line.to_string(), line.to_string())),
    }
}

/// Escape a phrase, adding `\b` only at edges that are ASCII alphanumeric so
/// CJK phrases still match inside running text.
fn bounded(phrase: &str) -> String {
    let mut out = String::new();
    if phrase.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        out.push_str(r"\b");
    }
    out.push_str(&regex::escape(phrase));
    if phrase.chars().last().is_some_and(|c| c.is_ascii_alphanumeric()) {
        out.push_str(r"\b");
    }
    out
}

/// Similarity ratio `2·M / (|a| + |b|)` where `M` is the length of the
/// longest common subsequence, over characters. 1.0 for identical strings.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            cur[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                cur[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    2.0 * prev[b.len()] as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parse_formats() {
        let v = Vocabulary::parse("# header\n\n发票号玛 -> 发票号码\nAcme → ACME\n增值税\nbroken ->\n");
        assert_eq!(v.stats(), VocabularyStats { entries: 3, corrections: 2, terms: 1 });
    }

    #[test]
    fn exact_replacement_leaves_unrelated_text() {
        let v = Vocabulary::parse("发票号玛 -> 发票号码");
        let out = v.correct("发票号玛：12345 发票号码 号玛");
        assert_eq!(out.value(), "发票号码：12345 发票号码 号玛");
    }

    #[test]
    fn longest_phrase_wins() {
        let v = Vocabulary::parse("税额 -> TAX\n税额合计 -> TOTAL_TAX");
        assert_eq!(v.exact_replace("税额合计 与 税额").unwrap(), "TOTAL_TAX 与 TAX");
    }

    #[test]
    fn ascii_phrases_respect_word_boundaries() {
        let v = Vocabulary::parse("cat -> dog");
        assert_eq!(v.exact_replace("cat concat cat.").unwrap(), "dog concat dog.");
    }

    #[test]
    fn replacement_is_not_rematched() {
        let v = Vocabulary::parse("a -> b\nb -> c");
        assert_eq!(v.exact_replace("a b").unwrap(), "b c");
    }

    #[test]
    fn fuzzy_fixes_near_miss_tokens() {
        let v = Vocabulary::parse("Corporation");
        assert_eq!(v.correct("Acme Corporatlon\nLtd").into_value(), "Acme Corporation\nLtd");
    }

    #[test]
    fn fuzzy_ignores_distant_tokens() {
        let v = Vocabulary::parse("Corporation");
        assert_eq!(v.correct("Corp. Ltd").into_value(), "Corp. Ltd");
    }

    #[test]
    fn similarity_ratio() {
        assert_eq!(similarity("abc", "abc"), 1.0);
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("abcd", "abxd"), 0.75);
        assert_eq!(similarity("abc", "xyz"), 0.0);
    }

    #[tokio::test]
    async fn add_word_appends_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("words.txt");
        std::fs::write(&path, "增值税\n").unwrap();

        let mut v = Vocabulary::load(&path).await.unwrap();
        v.add_custom_word("专票", Some("专用发票")).await.unwrap();
        v.add_custom_word("INV", None).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "增值税\n专票 -> 专用发票\nINV\n");
        assert_eq!(v.stats().entries, 3);

        let reloaded = Vocabulary::load(&path).await.unwrap();
        assert_eq!(reloaded.stats(), v.stats());
    }

    #[tokio::test]
    async fn missing_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = Vocabulary::load(dir.path().join("none.txt")).await.unwrap_err();
        assert!(matches!(err, DocStructError::ConfigError { .. }));
    }
}
