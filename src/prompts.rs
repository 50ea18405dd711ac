//! Prompt rendering for dialogue generation and cleanup.
//!
//! Pure string work. Provider-agnostic.

use crate::gateway::Message;

// =============================================================================
// Prompt instance
// =============================================================================

/// One fully rendered generation request, built per task.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptInstance {
    /// Theme after placeholder substitution.
    pub theme_text: String,
    pub language_code: String,
    pub language_name: String,
    pub temperature: f32,
    /// Inclusive `(min, max)` number of dialog lines requested.
    pub target_line_range: (usize, usize),
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Replace every `{key}` in `template` with its value. Unknown tokens stay as-is.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

// =============================================================================
// Generation prompts
// =============================================================================

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert at writing natural, realistic dialogues. \
Always answer with a single valid JSON object and nothing else.";

/// Example payload shown to the model when the config has none.
pub fn default_output_example(language_code: &str) -> serde_json::Value {
    serde_json::json!({
        "theme": "short description of the conversation",
        "dialog": [
            "first line of the dialog",
            "reply to the first line"
        ],
        "language": language_code,
    })
}

/// The `{output_example}` section appended to the base prompt.
pub fn format_section(example: &serde_json::Value, min_lines: usize, max_lines: usize) -> String {
    let pretty = serde_json::to_string_pretty(example).unwrap_or_else(|_| example.to_string());
    format!(
        "Return JSON in exactly this shape:\n{pretty}\n\
         The \"dialog\" array must contain between {min_lines} and {max_lines} lines, \
         each one a single utterance without speaker names."
    )
}

// =============================================================================
// Cleanup prompts
// =============================================================================

pub const CLEAN_SYSTEM_PROMPT: &str = "You fix corrupted text in dialog lines. \
Remove stray characters from other scripts and broken symbols, keep the meaning and language, \
and answer with JSON {\"cleaned_text\": \"...\"}.";

pub fn clean_messages(text: &str, language_name: &str) -> Vec<Message> {
    let user = format!(
        "The following {language_name} dialog line contains artifacts. \
         Return the corrected line.\n\n<line>\n{text}\n</line>"
    );
    vec![Message::system(CLEAN_SYSTEM_PROMPT), Message::user(user)]
}

// =============================================================================
// TESTS
// =============================================================================
