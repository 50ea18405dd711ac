//! Theme sampling: config in, one [`PromptInstance`] out.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::{placeholders, ConfigError, GeneratorConfig, Language, Range};
use crate::prompts::{
    default_output_example, format_section, render, PromptInstance, DEFAULT_SYSTEM_PROMPT,
};

/// Read-only sampler shared by all workers. Randomness comes in per call.
#[derive(Debug, Clone)]
pub struct ThemeBuilder {
    templates: Vec<String>,
    words: BTreeMap<String, Vec<String>>,
    languages: Vec<Language>,
    temperature: Range<f32>,
    dialog_lines: Range<usize>,
    base: String,
    system: String,
    example: Option<serde_json::Value>,
}

impl ThemeBuilder {
    pub fn new(config: &GeneratorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let p = &config.prompt_templates;
        Ok(Self {
            templates: p.templates.clone(),
            words: p.words.clone(),
            languages: config.generation.languages.clone(),
            temperature: config.generation.temperature,
            dialog_lines: config.generation.dialog_lines,
            base: p.base.clone(),
            system: p
                .system
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            example: config.output_schema.example.clone(),
        })
    }

    /// Sample one prompt instance.
    pub fn build<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<PromptInstance, ConfigError> {
        let template = self
            .templates
            .choose(rng)
            .ok_or_else(|| ConfigError::invalid("prompt_templates.templates", "empty"))?;
        let theme_text = self.fill_template(template, rng)?;

        let language = self
            .languages
            .choose(rng)
            .ok_or_else(|| ConfigError::invalid("generation.languages", "empty"))?;

        let temperature = if self.temperature.min < self.temperature.max {
            rng.gen_range(self.temperature.min..=self.temperature.max)
        } else {
            self.temperature.min
        };

        let (min_lines, max_lines) = (self.dialog_lines.min, self.dialog_lines.max);
        let example = self
            .example
            .clone()
            .unwrap_or_else(|| default_output_example(&language.code));
        let output_example = format_section(&example, min_lines, max_lines);

        let min_text = min_lines.to_string();
        let max_text = max_lines.to_string();
        let user = render(
            &self.base,
            &[
                ("language_name", language.name.as_str()),
                ("language_code", language.code.as_str()),
                ("theme", theme_text.as_str()),
                ("min_lines", min_text.as_str()),
                ("max_lines", max_text.as_str()),
                ("output_example", output_example.as_str()),
            ],
        );

        Ok(PromptInstance {
            theme_text,
            language_code: language.code.clone(),
            language_name: language.name.clone(),
            temperature,
            target_line_range: (min_lines, max_lines),
            system: self.system.clone(),
            user,
        })
    }

    /// Substitute every placeholder of `template` with a sampled candidate.
    ///
    /// Each occurrence is sampled independently, so `{topic} vs {topic}` may
    /// produce two different words.
    pub fn fill_template<R: Rng + ?Sized>(
        &self,
        template: &str,
        rng: &mut R,
    ) -> Result<String, ConfigError> {
        let mut out = String::with_capacity(template.len() + 32);
        let mut rest = template;
        for name in placeholders(template) {
            let token = format!("{{{name}}}");
            let Some(pos) = rest.find(&token) else {
                continue;
            };
            let word = self
                .words
                .get(name)
                .and_then(|bank| bank.choose(rng))
                .ok_or_else(|| ConfigError::MissingWords {
                    placeholder: name.to_string(),
                })?;
            out.push_str(&rest[..pos]);
            out.push_str(word);
            rest = &rest[pos + token.len()..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Number of distinct theme strings the templates can produce (upper bound,
    /// duplicates across templates are not collapsed).
    pub fn combination_count(&self) -> u128 {
        self.templates
            .iter()
            .map(|t| {
                placeholders(t)
                    .map(|name| self.words.get(name).map_or(0, |b| b.len() as u128))
                    .fold(1u128, |acc, n| acc.saturating_mul(n))
            })
            .fold(0u128, |acc, n| acc.saturating_add(n))
    }

    pub fn templates(&self) -> &[String] {
        &self.templates
    }

    pub fn word_banks(&self) -> &BTreeMap<String, Vec<String>> {
        &self.words
    }

    pub fn languages(&self) -> &[Language] {
        &self.languages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn built_prompt_has_no_unresolved_placeholders() {
        let builder = ThemeBuilder::new(&sample()).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let p = builder.build(&mut rng).unwrap();
            assert!(!p.theme_text.contains('{'), "{}", p.theme_text);
            assert!(["en", "ru"].contains(&p.language_code.as_str()));
            assert!((0.5..=0.9).contains(&p.temperature));
            assert_eq!(p.target_line_range, (2, 6));
            assert!(p.user.contains(&p.theme_text));
            assert!(p.user.contains(&p.language_name));
            assert!(p.user.contains("between 2 and 6"));
        }
    }

    #[test]
    fn every_language_and_template_gets_sampled() {
        let builder = ThemeBuilder::new(&sample()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut langs = std::collections::HashSet::new();
        let mut chats = 0;
        for _ in 0..200 {
            let p = builder.build(&mut rng).unwrap();
            langs.insert(p.language_code);
            if p.theme_text.starts_with("a chat on") {
                chats += 1;
            }
        }
        assert_eq!(langs.len(), 2);
        assert!(chats > 0 && chats < 200);
    }

    #[test]
    fn repeated_placeholder_is_filled_each_time() {
        let builder = ThemeBuilder::new(&sample()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let text = builder.fill_template("{topic} vs {topic}", &mut rng).unwrap();
        assert!(!text.contains('{'));
        assert!(text.contains(" vs "));
    }

    #[test]
    fn unknown_placeholder_is_a_config_error() {
        let builder = ThemeBuilder::new(&sample()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let err = builder.fill_template("{nope}", &mut rng).unwrap_err();
        assert!(matches!(err, ConfigError::MissingWords { .. }));
    }

    #[test]
    fn combination_count_sums_templates() {
        let builder = ThemeBuilder::new(&sample()).unwrap();
        // person(2) * topic(3) + topic(3)
        assert_eq!(builder.combination_count(), 9);
    }
}
