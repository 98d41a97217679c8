//! Local Tesseract engine, driven through its command-line binary.
//!
//! The PNG goes in on stdin and TSV comes back on stdout:
//!
//! ```text
//! tesseract stdin stdout -l chi_sim+eng --oem 3 --psm 6 [--user-words f] tsv
//! ```
//!
//! TSV carries one row per page, block, paragraph, line and word, each with
//! its box and (for words) a 0–100 confidence, so no rescaling is needed.

use super::TesseractSettings;
use crate::error::DocStructError;
use crate::output::{percent, BoundingBox, ImageSize, Position, RecognitionResult, TextBlock};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// TSV row level of a single word.
const WORD_LEVEL: u32 = 5;

#[derive(Debug, Clone)]
pub struct TesseractEngine {
    name: String,
    settings: TesseractSettings,
}

impl TesseractEngine {
    pub fn new(name: impl Into<String>, settings: TesseractSettings) -> Self {
        Self {
            name: name.into(),
            settings,
        }
    }

    pub fn settings(&self) -> &TesseractSettings {
        &self.settings
    }

    /// `true` when the binary runs.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.settings.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn command(&self) -> Command {
        let s = &self.settings;
        let mut cmd = Command::new(&s.binary);
        cmd.arg("stdin")
            .arg("stdout")
            .arg("-l")
            .arg(&s.languages)
            .arg("--oem")
            .arg(s.oem.to_string())
            .arg("--psm")
            .arg(s.psm.to_string());
        if let Some(words) = s.custom_words_path.as_ref().filter(|p| p.is_file()) {
            cmd.arg("--user-words").arg(words);
        }
        if let Some(patterns) = s.custom_patterns_path.as_ref().filter(|p| p.is_file()) {
            cmd.arg("--user-patterns").arg(patterns);
        }
        cmd.arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    pub async fn recognize(&self, image: &[u8]) -> Result<RecognitionResult, DocStructError> {
        let size = image_size(image).map_err(|detail| self.failure(detail))?;

        let mut child = self.command().spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DocStructError::EngineUnavailable {
                    engine: self.name.clone(),
                    reason: format!("'{}' not found on PATH", self.settings.binary),
                }
            } else {
                self.failure(format!("cannot start tesseract: {e}"))
            }
        })?;

        // Tesseract reads the whole image before writing anything.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(image)
                .await
                .map_err(|e| self.failure(format!("writing image to tesseract: {e}")))?;
        }

        let limit = Duration::from_secs(self.settings.timeout_secs.max(1));
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| self.failure(format!("no result within {}s", limit.as_secs())))?
            .map_err(|e| self.failure(format!("tesseract did not finish: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.failure(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let page = parse_tsv(&tsv, size).map_err(|detail| self.failure(detail))?;
        info!(
            engine = %self.name,
            "Recognized {} words, confidence {:.1}",
            page.blocks.len(),
            page.confidence
        );

        Ok(RecognitionResult {
            text: page.text,
            confidence: page.confidence,
            languages: self
                .settings
                .languages
                .split('+')
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            engine: self.name.clone(),
            blocks: page.blocks,
            image_size: size,
        })
    }

    fn failure(&self, detail: impl Into<String>) -> DocStructError {
        DocStructError::RecognitionFailure {
            engine: self.name.clone(),
            detail: detail.into(),
        }
    }
}

fn image_size(image: &[u8]) -> Result<ImageSize, String> {
    let img = image::load_from_memory(image).map_err(|e| format!("cannot decode image: {e}"))?;
    Ok(ImageSize {
        width: img.width(),
        height: img.height(),
    })
}

/// Text, blocks and mean confidence from one TSV page.
#[derive(Debug, Clone, PartialEq)]
pub struct TsvPage {
    pub text: String,
    pub blocks: Vec<TextBlock>,
    pub confidence: f64,
}

/// Parse Tesseract TSV output.
///
/// Words are joined with spaces inside a line, lines with `\n`, and
/// paragraphs or blocks with a blank line. Words with confidence above zero
/// and visible text become [`TextBlock`]s; the page confidence is their
/// mean.
pub fn parse_tsv(tsv: &str, size: ImageSize) -> Result<TsvPage, String> {
    let mut lines = tsv.lines();
    let header = lines.next().ok_or("tesseract produced no output")?;
    if !header.starts_with("level") {
        return Err(format!("unexpected TSV header: {header:?}"));
    }

    let mut text = String::new();
    let mut blocks = Vec::new();
    let mut last_line: Option<(u32, u32, u32)> = None;

    for row in lines {
        let cols: Vec<&str> = row.splitn(12, '\t').collect();
        if cols.len() < 11 {
            continue;
        }
        let num = |i: usize| cols[i].trim().parse::<i64>().unwrap_or(-1);
        if num(0) != WORD_LEVEL as i64 {
            continue;
        }
        let word = cols.get(11).map(|t| t.trim()).unwrap_or("");
        if word.is_empty() {
            continue;
        }
        let (block, par, line) = (num(2) as u32, num(3) as u32, num(4) as u32);

        match last_line {
            Some((b, p, _)) if (b, p) != (block, par) => text.push_str("\n\n"),
            Some(prev) if prev != (block, par, line) => text.push('\n'),
            Some(_) => text.push(' '),
            None => {}
        }
        last_line = Some((block, par, line));
        text.push_str(word);

        let conf: f64 = cols[10].trim().parse().unwrap_or(-1.0);
        if conf > 0.0 {
            let clamp = |v: i64| v.max(0) as u32;
            let bbox = BoundingBox::new(clamp(num(6)), clamp(num(7)), clamp(num(8)), clamp(num(9)), size);
            blocks.push(TextBlock {
                text: word.to_string(),
                confidence: percent(conf),
                position: Position::of(&bbox, size),
                bbox,
                block_num: block,
                line_num: line,
                word_num: num(5).max(0) as u32,
            });
        }
    }

    let confidence = if blocks.is_empty() {
        0.0
    } else {
        blocks.iter().map(|b| b.confidence as f64).sum::<f64>() / blocks.len() as f64
    };
    debug!("Parsed TSV: {} chars, {} words", text.len(), blocks.len());
    Ok(TsvPage {
        text,
        blocks,
        confidence,
    })
}
