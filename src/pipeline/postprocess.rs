//! Text cleaning: deterministic normalisation of recognized text before it
//! reaches entity extraction and the structuring prompt.
//!
//! ## Why clean at all?
//!
//! Recognition output carries artefacts that mean nothing to a reader but
//! confuse downstream matching:
//!
//! - Windows `\r\n` line endings from engines running on other hosts
//! - Runs of spaces where the engine guessed at column gaps
//! - Zero-width characters and BOMs picked up from the image encoder
//! - Stray glyphs (`|`, `~`, `^`) produced by table rules and stains
//!
//! The confidence scorer checks whether a provider value appears verbatim in
//! the text, so every rule here must be cheap, idempotent and
//! order-independent of the document content.
//!
//! ## Rule Order
//!
//! Invisible characters go first so that whitespace rules see clean input.
//! Line endings are normalised before special characters are stripped, so a
//! lone `\r` is never mistaken for noise, and spaces are collapsed after
//! stripping so removed glyphs leave no double gaps.

use crate::config::TextCleaning;
use once_cell::sync::Lazy;
use regex::Regex;

/// Apply the enabled cleaning rules to recognized text.
///
/// Rules (applied in order, each gated by its [`TextCleaning`] switch where
/// one exists):
/// 1. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 2. `normalize_whitespace`: CRLF/CR → LF, three or more newlines → two
/// 3. `remove_special_chars`: drop everything except word characters,
///    whitespace, CJK punctuation and the ASCII punctuation used in dates,
///    amounts, e-mails and ids
/// 4. `remove_extra_spaces`: runs of spaces and tabs → one space, trailing
///    spaces removed per line
/// 5. Trim the whole text
pub fn clean_text(input: &str, rules: &TextCleaning) -> String {
    let mut s = remove_invisible_chars(input);
    if rules.normalize_whitespace {
        s = normalise_line_endings(&s);
        s = collapse_blank_lines(&s);
    }
    if rules.remove_special_chars {
        s = remove_special_chars(&s);
    }
    if rules.remove_extra_spaces {
        s = collapse_spaces(&s);
    }
    s.trim().to_string()
}

// ── Rule 1: Strip invisible Unicode ──────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|&c| {
            !matches!(
                c,
                '\u{200B}' // zero-width space
                | '\u{200C}' // zero-width non-joiner
                | '\u{200D}' // zero-width joiner
                | '\u{FEFF}' // BOM
                | '\u{00AD}' // soft hyphen
                | '\u{2060}' // word joiner
            )
        })
        .collect()
}

// ── Rule 2: Whitespace normalisation ─────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 3: Special characters ───────────────────────────────────────────────

/// Everything outside this class is dropped. `\w` already covers CJK
/// ideographs; the explicit list adds full-width punctuation plus the ASCII
/// separators that dates (`2024/01/02`), amounts (`1,234.50`), e-mails and
/// invoice numbers (`INV-001`) depend on.
static RE_SPECIAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^\w\s，。、；：！？“”‘’（）【】《》￥¥%.,:/@\-+#]").unwrap()
});

fn remove_special_chars(input: &str) -> String {
    RE_SPECIAL.replace_all(input, "").to_string()
}

// ── Rule 4: Extra spaces ─────────────────────────────────────────────────────

static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{3000}]+").unwrap());

fn collapse_spaces(input: &str) -> String {
    input
        .lines()
        .map(|line| RE_SPACES.replace_all(line, " ").trim_end().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}
