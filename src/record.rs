//! The persisted dialog record and the contract between model output and it.
//!
//! Parsing is two-staged: anything that is not a JSON object is *malformed*
//! (the request is worth repeating), while a JSON object that breaks the record
//! rules is *invalid* (the theme is abandoned).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::prompts::PromptInstance;

/// One line of the output dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogRecord {
    pub theme: String,
    pub dialog: Vec<String>,
    pub language: String,
}

/// Limits a record must satisfy.
#[derive(Debug, Clone)]
pub struct RecordBounds {
    pub min_lines: usize,
    pub max_lines: usize,
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("invalid dialog: {0}")]
    Invalid(String),
}

impl DialogRecord {
    /// Check the record invariants against `bounds`.
    pub fn validate(&self, bounds: &RecordBounds) -> Result<(), RecordError> {
        if !bounds.languages.iter().any(|l| l == &self.language) {
            return Err(RecordError::Invalid(format!(
                "language `{}` is not configured",
                self.language
            )));
        }
        if let Some(idx) = self.dialog.iter().position(|l| l.trim().is_empty()) {
            return Err(RecordError::Invalid(format!("dialog line {idx} is empty")));
        }
        let n = self.dialog.len();
        if n == 0 || n < bounds.min_lines || n > bounds.max_lines {
            return Err(RecordError::Invalid(format!(
                "dialog has {n} lines, expected {}..={}",
                bounds.min_lines, bounds.max_lines
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct DialogJson {
    #[serde(default)]
    dialog: Option<Vec<String>>,
    #[serde(default)]
    language: Option<String>,
}

/// Parse a model response for `prompt` into a validated record.
///
/// The record's theme is always the sampled theme text, not whatever the
/// model echoed back.
pub fn parse_dialog_response(
    raw: &str,
    prompt: &PromptInstance,
    bounds: &RecordBounds,
) -> Result<DialogRecord, RecordError> {
    let json_str = extract_json(raw)
        .ok_or_else(|| RecordError::Malformed("no JSON object in response".into()))?;

    let value: serde_json::Value =
        serde_json::from_str(json_str).map_err(|e| RecordError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(RecordError::Malformed("top-level JSON is not an object".into()));
    }

    let parsed: DialogJson =
        serde_json::from_value(value).map_err(|e| RecordError::Invalid(e.to_string()))?;

    let language = parsed
        .language
        .map(|l| l.trim().to_string())
        .ok_or_else(|| RecordError::Invalid("missing 'language'".into()))?;
    if language != prompt.language_code {
        return Err(RecordError::Invalid(format!(
            "language `{language}` does not match requested `{}`",
            prompt.language_code
        )));
    }

    let dialog: Vec<String> = parsed
        .dialog
        .ok_or_else(|| RecordError::Invalid("missing 'dialog'".into()))?
        .iter()
        .map(|line| sanitize_line(line))
        .collect();

    let record = DialogRecord {
        theme: prompt.theme_text.clone(),
        dialog,
        language,
    };
    record.validate(bounds)?;
    Ok(record)
}

static SPEAKER_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:[-*•]\s+|(?:user|assistant|speaker\s*\d+|person\s*\d+|[ab])\s*[:：]\s*)")
        .expect("Invalid speaker prefix regex")
});

const QUOTE_PAIRS: &[(char, char)] = &[('"', '"'), ('\'', '\''), ('«', '»'), ('“', '”'), ('„', '“')];

/// Trim a dialog line and drop speaker labels and wrapping quotes.
pub fn sanitize_line(line: &str) -> String {
    let mut text = line.trim();
    if let Some(m) = SPEAKER_PREFIX.find(text) {
        text = text[m.end()..].trim_start();
    }
    for (open, close) in QUOTE_PAIRS {
        if text.chars().count() >= 2 && text.starts_with(*open) && text.ends_with(*close) {
            text = text[open.len_utf8()..text.len() - close.len_utf8()].trim();
            break;
        }
    }
    text.to_string()
}

/// First balanced JSON object in `raw`, ignoring braces inside strings.
pub fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let remainder = &raw[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&remainder[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
