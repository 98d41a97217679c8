//! Evidence extraction: dates, amounts, phone numbers, e-mails and ids found
//! in cleaned text.
//!
//! Entities are corroborating evidence for the confidence scorer, not the
//! extracted values themselves. Several patterns compete per kind and every
//! match is kept; duplicates are removed by `(text, start, end)`.
//!
//! An optional [`EntityTagger`] adds matches from a statistical model. Its
//! results are merged into the pattern results, never replacing them, and a
//! tagger failure only costs its own contribution.

use crate::error::Recovered;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// One match in the cleaned text.
///
/// `start` and `end` are UTF-8 byte offsets, so `&text[start..end]` is the
/// match. On CJK text they differ from character positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Entities grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySet {
    pub dates: Vec<Entity>,
    pub amounts: Vec<Entity>,
    pub phone_numbers: Vec<Entity>,
    pub emails: Vec<Entity>,
    pub ids: Vec<Entity>,
}

impl EntitySet {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.dates.len()
            + self.amounts.len()
            + self.phone_numbers.len()
            + self.emails.len()
            + self.ids.len()
    }

    fn dedup(&mut self) {
        for list in [
            &mut self.dates,
            &mut self.amounts,
            &mut self.phone_numbers,
            &mut self.emails,
            &mut self.ids,
        ] {
            let mut seen = HashSet::new();
            list.retain(|e| seen.insert((e.text.clone(), e.start, e.end)));
        }
    }
}

// ── Statistical tagger seam ──────────────────────────────────────────────

/// A labelled span produced by an [`EntityTagger`]. `start` and `end` are
/// byte offsets into the tagged text, like [`Entity`]'s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEntity {
    pub text: String,
    pub start: usize,
    pub end: usize,
    /// Model label such as `DATE`, `TIME`, `MONEY`.
    pub label: String,
}

/// A named-entity model. Loaded once by its owner and released explicitly.
pub trait EntityTagger: Send + Sync {
    fn tag(&self, text: &str) -> Result<Vec<TaggedEntity>, String>;

    /// Free model resources. Called once by [`EntityExtractor::close`].
    fn release(&self) {}
}

// ── Pattern tables ───────────────────────────────────────────────────────

struct Pattern {
    regex: Regex,
    label: &'static str,
    format: Option<&'static str>,
    /// Reject matches that touch another digit on either side.
    digit_bounded: bool,
}

fn pattern(re: &str, label: &'static str, format: Option<&'static str>) -> Pattern {
    Pattern {
        regex: Regex::new(re).unwrap(),
        label,
        format,
        digit_bounded: false,
    }
}

/// A pattern for a fixed-length number that must not be part of a longer
/// digit run. The check looks at the neighbours instead of consuming them,
/// so back-to-back numbers separated by one character are all found.
fn bounded(re: &str, label: &'static str) -> Pattern {
    Pattern {
        digit_bounded: true,
        ..pattern(re, label, None)
    }
}

fn touches_digit(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    before.is_some_and(|c| c.is_ascii_digit()) || after.is_some_and(|c| c.is_ascii_digit())
}

static DATE_PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    vec![
        pattern(r"\d{4}[-/]\d{1,2}[-/]\d{1,2}", "DATE", Some("YYYY-MM-DD")),
        pattern(r"\d{4}年\d{1,2}月\d{1,2}日", "DATE", Some("YYYY年MM月DD日")),
        pattern(r"\d{1,2}[-/]\d{1,2}[-/]\d{4}", "DATE", Some("MM-DD-YYYY")),
    ]
});

static AMOUNT_PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    vec![
        pattern(
            r"[￥¥]\s*\d{1,3}(?:[,，]\d{3})*(?:\.\d{1,2})?|[￥¥]\s*\d+(?:\.\d{1,2})?",
            "MONEY",
            Some("currency_symbol"),
        ),
        pattern(r"\d+(?:[,，]\d{3})*(?:\.\d{1,2})?\s*[元圆]", "MONEY", Some("yuan")),
        pattern(r"\b\d{1,3}(?:[,，]\d{3})+(?:\.\d{2})?\b|\b\d+\.\d{2}\b", "MONEY", Some("number")),
    ]
});

static PHONE_PATTERNS: Lazy<Vec<Pattern>> =
    Lazy::new(|| vec![bounded(r"1[3-9]\d{9}", "PHONE")]);

static EMAIL_PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    vec![pattern(
        r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
        "EMAIL",
        None,
    )]
});

static ID_PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    vec![
        bounded(r"\d{17}[\dXx]", "ID_CARD"),
        pattern(r"\b[A-Za-z]{2,}-\d+(?:-\d+)*\b", "INVOICE_NUMBER", None),
    ]
});

/// Run every pattern of one kind and keep every match.
fn run_patterns(patterns: &[Pattern], text: &str) -> Vec<Entity> {
    let mut found = Vec::new();
    for p in patterns {
        for m in p.regex.find_iter(text) {
            if p.digit_bounded && touches_digit(text, m.start(), m.end()) {
                continue;
            }
            found.push(Entity {
                text: m.as_str().to_string(),
                start: m.start(),
                end: m.end(),
                label: p.label.to_string(),
                format: p.format.map(str::to_string),
            });
        }
    }
    found
}

/// Pattern-only extraction. Never fails.
pub fn extract_patterns(text: &str) -> EntitySet {
    let mut set = EntitySet {
        dates: run_patterns(&DATE_PATTERNS, text),
        amounts: run_patterns(&AMOUNT_PATTERNS, text),
        phone_numbers: run_patterns(&PHONE_PATTERNS, text),
        emails: run_patterns(&EMAIL_PATTERNS, text),
        ids: run_patterns(&ID_PATTERNS, text),
    };
    set.dedup();
    set
}

// ── Extractor service ────────────────────────────────────────────────────

/// Evidence extractor owned by the structuring orchestrator.
#[derive(Clone, Default)]
pub struct EntityExtractor {
    tagger: Option<Arc<dyn EntityTagger>>,
}

impl std::fmt::Debug for EntityExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityExtractor")
            .field("tagger", &self.tagger.is_some())
            .finish()
    }
}

impl EntityExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tagger(tagger: Arc<dyn EntityTagger>) -> Self {
        Self {
            tagger: Some(tagger),
        }
    }

    /// Extract entities. The pattern pass always runs; a failing tagger
    /// yields the pattern results with a diagnostic.
    pub fn extract(&self, text: &str) -> Recovered<EntitySet> {
        let mut set = extract_patterns(text);
        let Some(tagger) = &self.tagger else {
            return Recovered::Enhanced(set);
        };

        match tagger.tag(text) {
            Ok(tagged) => {
                debug!("Entity tagger returned {} spans", tagged.len());
                for t in tagged {
                    let target = match t.label.as_str() {
                        "DATE" | "TIME" => &mut set.dates,
                        "MONEY" => &mut set.amounts,
                        _ => continue,
                    };
                    target.push(Entity {
                        text: t.text,
                        start: t.start,
                        end: t.end,
                        label: t.label,
                        format: None,
                    });
                }
                set.dedup();
                Recovered::Enhanced(set)
            }
            Err(e) => {
                warn!("Entity tagger failed, using pattern matches only: {e}");
                Recovered::fallback(set, format!("entity tagger failed: {e}"))
            }
        }
    }

    /// Release the tagger, if any. Later calls use patterns only.
    pub fn close(&mut self) {
        if let Some(tagger) = self.tagger.take() {
            tagger.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn finds_all_three_date_formats() {
        let set = extract_patterns("开票 2024-01-05，到期 2024年2月1日，US 03/15/2024");
        let formats: Vec<_> = set.dates.iter().filter_map(|d| d.format.as_deref()).collect();
        assert!(formats.contains(&"YYYY-MM-DD"));
        assert!(formats.contains(&"YYYY年MM月DD日"));
        assert!(formats.contains(&"MM-DD-YYYY"));
    }

    #[test]
    fn amounts_union_competing_patterns() {
        let set = extract_patterns("合计 ￥1,234.50 即 1234.50元");
        assert!(set.amounts.iter().any(|a| a.format.as_deref() == Some("currency_symbol")));
        assert!(set.amounts.iter().any(|a| a.format.as_deref() == Some("yuan")));
        assert!(set.amounts.iter().all(|a| a.label == "MONEY"));
    }

    #[test]
    fn phone_email_and_ids() {
        let text = "电话 13812345678 邮箱 a.b@example.com 发票 INV-2024-001 身份证 11010519491231002X";
        let set = extract_patterns(text);
        assert_eq!(set.phone_numbers.len(), 1);
        assert_eq!(set.phone_numbers[0].text, "13812345678");
        assert_eq!(&text[set.phone_numbers[0].start..set.phone_numbers[0].end], "13812345678");
        assert_eq!(set.emails[0].text, "a.b@example.com");
        assert!(set.ids.iter().any(|i| i.text == "INV-2024-001" && i.label == "INVOICE_NUMBER"));
        assert!(set.ids.iter().any(|i| i.text == "11010519491231002X" && i.label == "ID_CARD"));
    }

    #[test]
    fn adjacent_phones_are_both_found() {
        let set = extract_patterns("13812345678,13912345678");
        let phones: Vec<_> = set.phone_numbers.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(phones, vec!["13812345678", "13912345678"]);
        assert_eq!(set.phone_numbers[1].start, 12);
    }

    #[test]
    fn adjacent_id_cards_are_both_found() {
        let set = extract_patterns("11010519491231002X 110105194912310038");
        let ids: Vec<_> = set
            .ids
            .iter()
            .filter(|i| i.label == "ID_CARD")
            .map(|i| i.text.as_str())
            .collect();
        assert_eq!(ids, vec!["11010519491231002X", "110105194912310038"]);
    }

    #[test]
    fn numbers_inside_longer_digit_runs_are_not_phones() {
        assert!(extract_patterns("0138123456789").phone_numbers.is_empty());
        assert!(extract_patterns("1101051949123100381").ids.iter().all(|i| i.label != "ID_CARD"));
    }

    #[test]
    fn full_width_grouping_is_an_amount() {
        let set = extract_patterns("总计 1，234.50");
        assert!(set
            .amounts
            .iter()
            .any(|a| a.text == "1，234.50" && a.format.as_deref() == Some("number")));
    }

    #[test]
    fn nothing_found_is_empty_not_error() {
        let set = extract_patterns("");
        assert!(set.is_empty());
        assert!(extract_patterns("纯文本，没有任何数字").is_empty());
    }

    #[test]
    fn duplicates_removed_per_kind() {
        let mut set = EntitySet::default();
        let e = Entity {
            text: "2024-01-01".into(),
            start: 0,
            end: 10,
            label: "DATE".into(),
            format: None,
        };
        set.dates = vec![e.clone(), e];
        set.dedup();
        assert_eq!(set.dates.len(), 1);
    }

    struct Tagger {
        fail: bool,
        released: AtomicBool,
    }

    impl EntityTagger for Tagger {
        fn tag(&self, text: &str) -> Result<Vec<TaggedEntity>, String> {
            if self.fail {
                return Err("model not loaded".into());
            }
            let start = text.find("yesterday").ok_or("no date")?;
            Ok(vec![
                TaggedEntity {
                    text: "yesterday".into(),
                    start,
                    end: start + 9,
                    label: "DATE".into(),
                },
                TaggedEntity {
                    text: "Acme".into(),
                    start: 0,
                    end: 4,
                    label: "ORG".into(),
                },
            ])
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn tagger_results_are_additive() {
        let tagger = Arc::new(Tagger {
            fail: false,
            released: AtomicBool::new(false),
        });
        let mut extractor = EntityExtractor::with_tagger(tagger.clone());
        let out = extractor.extract("Acme paid yesterday, 2024-01-01");
        assert!(!out.is_fallback());
        let dates = &out.value().dates;
        assert_eq!(dates.len(), 2);
        assert!(dates.iter().any(|d| d.text == "yesterday"));

        extractor.close();
        assert!(tagger.released.load(Ordering::SeqCst));
        assert_eq!(extractor.extract("yesterday").value().dates.len(), 0);
    }

    #[test]
    fn tagger_failure_keeps_pattern_matches() {
        let extractor = EntityExtractor::with_tagger(Arc::new(Tagger {
            fail: true,
            released: AtomicBool::new(false),
        }));
        let out = extractor.extract("2024-01-01");
        assert!(out.is_fallback());
        assert_eq!(out.value().dates.len(), 1);
    }
}
