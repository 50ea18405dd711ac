//! Run configuration: a single JSON document loaded at startup.
//!
//! Everything is read-only once [`GeneratorConfig::validate`] has passed.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::openai::DEFAULT_BASE_URL;
use crate::gateway::RetryPolicy;

/// Env vars consulted, in order, when `api.api_key` is absent.
pub const API_KEY_ENV_VARS: [&str; 2] = ["DIALOG_HARNESS_API_KEY", "OPENAI_API_KEY"];

pub const MAX_THREADS: usize = 64;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("Invalid placeholder regex"));
static LANGUAGE_CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z]{2,3}(-[A-Za-z0-9]{2,8})?$").expect("Invalid language code regex")
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config field `{field}`: {message}")]
    Invalid { field: String, message: String },
    #[error("template placeholder `{{{placeholder}}}` has no candidate words")]
    MissingWords { placeholder: String },
    #[error("no API key: set api.api_key or one of {API_KEY_ENV_VARS:?}")]
    MissingApiKey,
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub generation: GenerationConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub prompt_templates: PromptTemplates,
    #[serde(default)]
    pub output_schema: OutputSchema,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub temperature: Range<f32>,
    #[serde(default)]
    pub dialog_lines: Range<usize>,
    pub languages: Vec<Language>,
    #[serde(default)]
    pub target_count: Option<u64>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default)]
    pub request_delay_ms: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

/// Inclusive `{min, max}` bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range<T> {
    pub min: T,
    pub max: T,
}

impl Default for Range<f32> {
    fn default() -> Self {
        Self { min: 0.7, max: 1.0 }
    }
}

impl Default for Range<usize> {
    fn default() -> Self {
        Self { min: 4, max: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    pub code: String,
    pub name: String,
}

impl Language {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplates {
    /// Base user prompt. Placeholders: `{language_name}`, `{theme}`,
    /// `{min_lines}`, `{max_lines}`, `{output_example}`.
    pub base: String,
    #[serde(default)]
    pub system: Option<String>,
    /// Theme templates with `{placeholder}` tokens.
    pub templates: Vec<String>,
    /// Word banks keyed by placeholder name.
    pub words: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSchema {
    #[serde(default)]
    pub example: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_filename")]
    pub filename: PathBuf,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: f64,
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
    #[serde(default = "default_true")]
    pub fsync: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            filename: default_filename(),
            max_file_size_mb: default_max_file_size_mb(),
            backup_count: default_backup_count(),
            fsync: true,
        }
    }
}

impl OutputConfig {
    pub fn max_file_bytes(&self) -> u64 {
        (self.max_file_size_mb * 1024.0 * 1024.0).round() as u64
    }
}

fn default_threads() -> usize {
    4
}
fn default_max_consecutive_errors() -> u32 {
    10
}
fn default_stats_interval_secs() -> u64 {
    10
}
fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_retry_max_delay_ms() -> u64 {
    10_000
}
fn default_filename() -> PathBuf {
    PathBuf::from("dialogues.jsonl")
}
fn default_max_file_size_mb() -> f64 {
    100.0
}
fn default_backup_count() -> usize {
    5
}
fn default_true() -> bool {
    true
}

// =============================================================================
// LOADING & VALIDATION
// =============================================================================

/// Placeholder names referenced by `template`, in order of appearance.
pub fn placeholders(template: &str) -> impl Iterator<Item = &str> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
}

impl GeneratorConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: GeneratorConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.generation;

        if g.threads == 0 || g.threads > MAX_THREADS {
            return Err(ConfigError::invalid(
                "generation.threads",
                format!("must be in 1..={MAX_THREADS}, got {}", g.threads),
            ));
        }

        let t = g.temperature;
        if !(0.0..=2.0).contains(&t.min) || !(0.0..=2.0).contains(&t.max) || t.min > t.max {
            return Err(ConfigError::invalid(
                "generation.temperature",
                format!("need 0 <= min <= max <= 2, got {}..{}", t.min, t.max),
            ));
        }

        let lines = g.dialog_lines;
        if lines.min < 1 || lines.min > lines.max {
            return Err(ConfigError::invalid(
                "generation.dialog_lines",
                format!("need 1 <= min <= max, got {}..{}", lines.min, lines.max),
            ));
        }

        if g.languages.is_empty() {
            return Err(ConfigError::invalid("generation.languages", "must not be empty"));
        }
        let mut seen = HashSet::new();
        for lang in &g.languages {
            if !LANGUAGE_CODE_RE.is_match(&lang.code) {
                return Err(ConfigError::invalid(
                    "generation.languages",
                    format!("invalid language code `{}`", lang.code),
                ));
            }
            if lang.name.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "generation.languages",
                    format!("language `{}` has an empty name", lang.code),
                ));
            }
            if !seen.insert(lang.code.as_str()) {
                return Err(ConfigError::invalid(
                    "generation.languages",
                    format!("duplicate language code `{}`", lang.code),
                ));
            }
        }

        if g.target_count == Some(0) {
            return Err(ConfigError::invalid("generation.target_count", "must be > 0"));
        }
        if g.max_duration_secs == Some(0) {
            return Err(ConfigError::invalid("generation.max_duration_secs", "must be > 0"));
        }
        if g.max_consecutive_errors == 0 {
            return Err(ConfigError::invalid(
                "generation.max_consecutive_errors",
                "must be > 0",
            ));
        }
        if g.stats_interval_secs == 0 {
            return Err(ConfigError::invalid("generation.stats_interval_secs", "must be > 0"));
        }

        self.validate_api()?;
        self.validate_templates()?;
        self.validate_output()
    }

    fn validate_api(&self) -> Result<(), ConfigError> {
        let api = &self.api;
        if !(api.base_url.starts_with("http://") || api.base_url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "api.base_url",
                format!("must be an http(s) URL, got `{}`", api.base_url),
            ));
        }
        if api.model.trim().is_empty() {
            return Err(ConfigError::invalid("api.model", "must not be empty"));
        }
        if api.timeout_secs == 0 {
            return Err(ConfigError::invalid("api.timeout_secs", "must be > 0"));
        }
        if api.max_tokens == 0 {
            return Err(ConfigError::invalid("api.max_tokens", "must be > 0"));
        }
        if api.max_retries == 0 {
            return Err(ConfigError::invalid(
                "api.max_retries",
                "counts total attempts and must be >= 1",
            ));
        }
        if api.retry_base_delay_ms > api.retry_max_delay_ms {
            return Err(ConfigError::invalid(
                "api.retry_base_delay_ms",
                "must not exceed api.retry_max_delay_ms",
            ));
        }
        Ok(())
    }

    fn validate_templates(&self) -> Result<(), ConfigError> {
        let p = &self.prompt_templates;
        if p.base.trim().is_empty() {
            return Err(ConfigError::invalid("prompt_templates.base", "must not be empty"));
        }
        if p.templates.is_empty() {
            return Err(ConfigError::invalid(
                "prompt_templates.templates",
                "must not be empty",
            ));
        }
        for template in &p.templates {
            for name in placeholders(template) {
                let bank = p.words.get(name).filter(|w| !w.is_empty());
                if bank.is_none() {
                    return Err(ConfigError::MissingWords {
                        placeholder: name.to_string(),
                    });
                }
            }
        }
        // Candidates are substituted verbatim, so one containing a token would survive.
        for (name, bank) in &p.words {
            if let Some(word) = bank.iter().find(|w| PLACEHOLDER_RE.is_match(w)) {
                return Err(ConfigError::invalid(
                    format!("prompt_templates.words.{name}"),
                    format!("candidate `{word}` contains a placeholder token"),
                ));
            }
        }
        Ok(())
    }

    fn validate_output(&self) -> Result<(), ConfigError> {
        let out = &self.output;
        if out.filename.as_os_str().is_empty() {
            return Err(ConfigError::invalid("output.filename", "must not be empty"));
        }
        if !out.max_file_size_mb.is_finite() || out.max_file_size_mb <= 0.0 {
            return Err(ConfigError::invalid(
                "output.max_file_size_mb",
                format!("must be > 0, got {}", out.max_file_size_mb),
            ));
        }
        Ok(())
    }

    /// Config key first, then the env vars in [`API_KEY_ENV_VARS`].
    pub fn api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = self.api.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Ok(key.clone());
        }
        API_KEY_ENV_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
            .ok_or(ConfigError::MissingApiKey)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.api.max_retries,
            base_delay: Duration::from_millis(self.api.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.api.retry_max_delay_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn language_codes(&self) -> Vec<String> {
        self.generation
            .languages
            .iter()
            .map(|l| l.code.clone())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "generation": {
                "threads": 2,
                "temperature": {"min": 0.5, "max": 0.9},
                "dialog_lines": {"min": 2, "max": 6},
                "languages": [
                    {"code": "en", "name": "English"},
                    {"code": "ru", "name": "Russian"}
                ]
            },
            "api": {"api_key": "test-key", "model": "test-model"},
            "prompt_templates": {
                "base": "Write a dialog in {language_name} about {theme}. Use {min_lines}-{max_lines} lines.\n{output_example}",
                "templates": ["{person} talks about {topic}", "a chat on {topic}"],
                "words": {
                    "person": ["a baker", "a pilot"],
                    "topic": ["weather", "trains", "tea"]
                }
            }
        })
    }

    pub(crate) fn sample() -> GeneratorConfig {
        GeneratorConfig::from_json_str(&sample_json().to_string()).unwrap()
    }

    fn with(f: impl FnOnce(&mut serde_json::Value)) -> Result<GeneratorConfig, ConfigError> {
        let mut v = sample_json();
        f(&mut v);
        GeneratorConfig::from_json_str(&v.to_string())
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = sample();
        assert_eq!(config.api.base_url, "https://api.openai.com/v1");
        assert_eq!(config.api.max_retries, 3);
        assert_eq!(config.api.max_tokens, 2000);
        assert_eq!(config.output.filename, PathBuf::from("dialogues.jsonl"));
        assert_eq!(config.output.backup_count, 5);
        assert_eq!(config.output.max_file_bytes(), 100 * 1024 * 1024);
        assert_eq!(config.generation.max_consecutive_errors, 10);
        assert!(config.output.fsync);
    }

    #[test]
    fn rejects_missing_word_bank() {
        let err = with(|v| {
            v["prompt_templates"]["templates"] = serde_json::json!(["about {mood}"]);
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingWords { ref placeholder } if placeholder == "mood"));
    }

    #[test]
    fn rejects_empty_word_bank() {
        let err = with(|v| v["prompt_templates"]["words"]["topic"] = serde_json::json!([]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingWords { .. }));
    }

    #[test]
    fn rejects_duplicate_languages_and_bad_ranges() {
        assert!(with(|v| {
            v["generation"]["languages"] = serde_json::json!([
                {"code": "en", "name": "English"},
                {"code": "en", "name": "English again"}
            ])
        })
        .is_err());
        assert!(with(|v| v["generation"]["threads"] = 0.into()).is_err());
        assert!(with(|v| v["generation"]["threads"] = 65.into()).is_err());
        assert!(with(|v| v["generation"]["temperature"] = serde_json::json!({"min": 1.5, "max": 1.0})).is_err());
        assert!(with(|v| v["generation"]["temperature"] = serde_json::json!({"min": 0.0, "max": 2.5})).is_err());
        assert!(with(|v| v["generation"]["dialog_lines"] = serde_json::json!({"min": 0, "max": 3})).is_err());
        assert!(with(|v| v["api"]["max_retries"] = 0.into()).is_err());
        assert!(with(|v| v["output"] = serde_json::json!({"max_file_size_mb": 0})).is_err());
    }

    #[test]
    fn rejects_placeholder_inside_candidate() {
        let err = with(|v| v["prompt_templates"]["words"]["topic"] = serde_json::json!(["{person}"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn config_api_key_wins_over_env() {
        let config = sample();
        assert_eq!(config.api_key().unwrap(), "test-key");
    }

    #[test]
    fn fractional_file_size_is_allowed() {
        let config = with(|v| v["output"] = serde_json::json!({"max_file_size_mb": 0.5})).unwrap();
        assert_eq!(config.output.max_file_bytes(), 512 * 1024);
    }

    #[test]
    fn demo_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/config.json");
        let config = GeneratorConfig::load(path).unwrap();
        assert_eq!(config.language_codes(), vec!["en", "ru", "de"]);
        assert_eq!(config.generation.target_count, Some(1000));
    }

    #[test]
    fn placeholders_lists_tokens() {
        let names: Vec<_> = placeholders("{a} and {b_2} but not {}").collect();
        assert_eq!(names, vec!["a", "b_2"]);
    }
}
