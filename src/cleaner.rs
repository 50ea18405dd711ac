//! Offline dataset cleanup.
//!
//! `analyze_file` counts dialog lines carrying generation artifacts (stray
//! Han/kana characters in a non-CJK dialog, U+FFFD replacement characters).
//! `DialogCleaner` asks the model to repair exactly those lines and writes a
//! corrected copy of the dataset.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

use crate::completion::CompletionClient;
use crate::config::Language;
use crate::prompts::clean_messages;

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_CLEAN_TEMPERATURE: f32 = 0.1;

/// Languages whose dialogs legitimately contain Han or kana.
const CJK_LANGUAGES: &[&str] = &["zh", "ja"];

static CJK_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\p{Han}\p{Hiragana}\p{Katakana}]").expect("Invalid CJK regex"));

#[derive(Debug, thiserror::Error)]
pub enum CleanError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Whether a dialog line in `language` carries generation artifacts.
pub fn has_artifacts(text: &str, language: &str) -> bool {
    if text.contains('\u{FFFD}') {
        return true;
    }
    let base = language.split('-').next().unwrap_or(language);
    !CJK_LANGUAGES.contains(&base) && CJK_CHARS.is_match(text)
}

fn dialog_lines(value: &Value) -> Option<Vec<&str>> {
    value
        .get("dialog")?
        .as_array()?
        .iter()
        .map(Value::as_str)
        .collect()
}

fn language_of(value: &Value) -> &str {
    value.get("language").and_then(Value::as_str).unwrap_or("")
}

// =============================================================================
// Analysis
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LanguageArtifacts {
    pub records: u64,
    pub with_artifacts: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArtifactReport {
    pub total_records: u64,
    pub records_with_artifacts: u64,
    pub artifact_lines: u64,
    /// Input lines that are not a dialog record.
    pub unreadable_lines: u64,
    pub per_language: BTreeMap<String, LanguageArtifacts>,
}

/// Scan a dataset for artifacts. Reads only; no network.
pub async fn analyze_file(path: impl AsRef<Path>) -> Result<ArtifactReport, CleanError> {
    let path = path.as_ref();
    let read_err = |source| CleanError::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).await.map_err(read_err)?;
    let mut lines = BufReader::new(file).lines();

    let mut report = ArtifactReport::default();
    while let Some(line) = lines.next_line().await.map_err(read_err)? {
        if line.trim().is_empty() {
            continue;
        }
        let Some(value) = serde_json::from_str::<Value>(&line).ok() else {
            report.unreadable_lines += 1;
            continue;
        };
        let Some(dialog) = dialog_lines(&value) else {
            report.unreadable_lines += 1;
            continue;
        };
        let language = language_of(&value);
        let bad = dialog
            .iter()
            .filter(|l| has_artifacts(l, language))
            .count() as u64;

        report.total_records += 1;
        report.artifact_lines += bad;
        let entry = report
            .per_language
            .entry(language.to_string())
            .or_default();
        entry.records += 1;
        if bad > 0 {
            report.records_with_artifacts += 1;
            entry.with_artifacts += 1;
        }
    }
    Ok(report)
}

// =============================================================================
// Cleaning
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub lines_read: u64,
    pub records_cleaned: u64,
    /// Lines kept verbatim because cleaning them failed.
    pub lines_failed: u64,
    /// Lines without artifacts, copied unchanged.
    pub lines_passed_through: u64,
}

#[derive(Debug, Deserialize)]
struct CleanedText {
    #[serde(default)]
    cleaned_text: Option<String>,
}

#[derive(Debug)]
enum LineOutcome {
    Cleaned(String),
    Unchanged(String),
    Failed(String),
}

pub struct DialogCleaner {
    client: Arc<CompletionClient>,
    language_names: BTreeMap<String, String>,
    batch_size: usize,
    temperature: f32,
}

impl DialogCleaner {
    pub fn new(client: Arc<CompletionClient>, languages: &[Language]) -> Self {
        Self {
            client,
            language_names: languages
                .iter()
                .map(|l| (l.code.clone(), l.name.clone()))
                .collect(),
            batch_size: DEFAULT_BATCH_SIZE,
            temperature: DEFAULT_CLEAN_TEMPERATURE,
        }
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Copy `input` to `output`, repairing artifact lines. Lines of one batch
    /// are processed concurrently; output order matches input order.
    pub async fn clean_file(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<CleanReport, CleanError> {
        let (input, output) = (input.as_ref(), output.as_ref());
        let read_err = |source| CleanError::Read {
            path: input.to_path_buf(),
            source,
        };
        let write_err = |source| CleanError::Write {
            path: output.to_path_buf(),
            source,
        };

        let mut lines = BufReader::new(File::open(input).await.map_err(read_err)?).lines();
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        let mut writer = BufWriter::new(File::create(output).await.map_err(write_err)?);

        let mut report = CleanReport::default();
        let mut batch = Vec::with_capacity(self.batch_size);
        loop {
            let next = lines.next_line().await.map_err(read_err)?;
            let done = next.is_none();
            if let Some(line) = next {
                if !line.trim().is_empty() {
                    report.lines_read += 1;
                    batch.push(line);
                }
            }
            if batch.len() >= self.batch_size || (done && !batch.is_empty()) {
                let outcomes = join_all(batch.drain(..).map(|l| self.clean_line(l))).await;
                for outcome in outcomes {
                    let line = match outcome {
                        LineOutcome::Cleaned(l) => {
                            report.records_cleaned += 1;
                            l
                        }
                        LineOutcome::Unchanged(l) => {
                            report.lines_passed_through += 1;
                            l
                        }
                        LineOutcome::Failed(l) => {
                            report.lines_failed += 1;
                            l
                        }
                    };
                    writer.write_all(line.as_bytes()).await.map_err(write_err)?;
                    writer.write_all(b"\n").await.map_err(write_err)?;
                }
                writer.flush().await.map_err(write_err)?;
                debug!(lines_read = report.lines_read, "Cleaned batch");
            }
            if done {
                break;
            }
        }

        writer.flush().await.map_err(write_err)?;
        writer.get_ref().sync_all().await.map_err(write_err)?;

        info!(
            lines_read = report.lines_read,
            records_cleaned = report.records_cleaned,
            lines_failed = report.lines_failed,
            "Cleaning finished"
        );
        Ok(report)
    }

    async fn clean_line(&self, line: String) -> LineOutcome {
        let mut value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Unparseable input line kept as-is");
                return LineOutcome::Failed(line);
            }
        };
        let language = language_of(&value).to_string();
        let Some(dialog) = dialog_lines(&value) else {
            warn!("Input line has no dialog array; kept as-is");
            return LineOutcome::Failed(line);
        };
        let mut dialog: Vec<String> = dialog.into_iter().map(str::to_string).collect();

        let targets: Vec<usize> = dialog
            .iter()
            .enumerate()
            .filter(|(_, text)| has_artifacts(text, &language))
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            return LineOutcome::Unchanged(line);
        }

        let language_name = self
            .language_names
            .get(&language)
            .cloned()
            .unwrap_or_else(|| language.clone());

        for idx in targets {
            let messages = clean_messages(&dialog[idx], &language_name);
            let cleaned = self
                .client
                .request_json::<CleanedText>(messages, self.temperature, None)
                .await;
            match cleaned {
                Ok(CleanedText {
                    cleaned_text: Some(text),
                }) if !text.trim().is_empty() => {
                    dialog[idx] = text.trim().to_string();
                }
                Ok(_) => {
                    warn!(language = %language, line = idx, "Empty correction; record kept as-is");
                    return LineOutcome::Failed(line);
                }
                Err(err) => {
                    warn!(
                        language = %language,
                        line = idx,
                        attempts = err.attempts(),
                        error = %err,
                        "Correction request failed; record kept as-is"
                    );
                    return LineOutcome::Failed(line);
                }
            }
        }

        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "dialog".to_string(),
                Value::Array(dialog.into_iter().map(Value::String).collect()),
            );
            obj.insert("cleaned".to_string(), Value::Bool(true));
        }
        match serde_json::to_string(&value) {
            Ok(cleaned) => LineOutcome::Cleaned(cleaned),
            Err(e) => {
                warn!(error = %e, "Failed to serialize cleaned record; kept as-is");
                LineOutcome::Failed(line)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_cjk_outside_cjk_languages() {
        assert!(has_artifacts("Привет, как 你 дела?", "ru"));
        assert!(has_artifacts("Hello カ there", "en"));
        assert!(!has_artifacts("你好，最近怎么样？", "zh"));
        assert!(!has_artifacts("こんにちは", "ja"));
        assert!(!has_artifacts("Plain English line.", "en"));
    }

    #[test]
    fn replacement_char_is_always_an_artifact() {
        assert!(has_artifacts("broken \u{FFFD} text", "en"));
        assert!(has_artifacts("你好\u{FFFD}", "zh"));
    }

    #[test]
    fn dialog_lines_requires_string_array() {
        let ok: Value = serde_json::json!({"dialog": ["a", "b"]});
        assert_eq!(dialog_lines(&ok), Some(vec!["a", "b"]));
        let mixed: Value = serde_json::json!({"dialog": ["a", 1]});
        assert_eq!(dialog_lines(&mixed), None);
    }
}
