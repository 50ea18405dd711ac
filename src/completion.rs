//! One prompt in, one validated [`DialogRecord`] out.
//!
//! The client owns the retry loop. Every attempt, failed or not, is reported
//! to the usage sink; the store is never touched here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::GeneratorConfig;
use crate::gateway::{
    AttemptOutcome, AttemptRecord, ChatProvider, ChatRequest, ChatResponse, FinishReason,
    Message, ProviderError, RetryPolicy, UsageSink,
};
use crate::prompts::PromptInstance;
use crate::record::{extract_json, parse_dialog_response, DialogRecord, RecordBounds, RecordError};
use crate::stats::FailureKind;

#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub model: String,
    pub max_tokens: u32,
    pub retry: RetryPolicy,
    pub bounds: RecordBounds,
}

impl CompletionConfig {
    pub fn from_config(config: &GeneratorConfig) -> Self {
        Self {
            model: config.api.model.clone(),
            max_tokens: config.api.max_tokens,
            retry: config.retry_policy(),
            bounds: RecordBounds {
                min_lines: config.generation.dialog_lines.min,
                max_lines: config.generation.dialog_lines.max,
                languages: config.language_codes(),
            },
        }
    }
}

/// Why [`CompletionClient::generate`] gave up.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("transient failure after {attempts} attempt(s): {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: ProviderError,
    },
    #[error("malformed response after {attempts} attempt(s): {message}")]
    Malformed { attempts: u32, message: String },
    #[error("validation failed on attempt {attempts}: {message}")]
    Validation { attempts: u32, message: String },
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl GenerateError {
    /// Statistic bucket, `None` for cancellation.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Transient { .. } => Some(FailureKind::Transient),
            Self::Malformed { .. } => Some(FailureKind::Malformed),
            Self::Validation { .. } => Some(FailureKind::Validation),
            Self::Cancelled { .. } => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Transient { attempts, .. }
            | Self::Malformed { attempts, .. }
            | Self::Validation { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// Progress callbacks for the attempt loop.
pub trait AttemptObserver: Send + Sync {
    fn on_request(&self, _attempt: u32) {}
    fn on_validate(&self, _attempt: u32) {}
}

#[derive(Clone)]
pub struct CompletionClient {
    provider: Arc<dyn ChatProvider>,
    usage: Arc<dyn UsageSink>,
    config: CompletionConfig,
}

impl CompletionClient {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        usage: Arc<dyn UsageSink>,
        config: CompletionConfig,
    ) -> Self {
        Self {
            provider,
            usage,
            config,
        }
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.config
    }

    /// Generate one dialog for `prompt`.
    ///
    /// Transport failures and malformed bodies are retried up to
    /// `retry.max_attempts` attempts in total. A well-formed body that breaks
    /// the record rules is returned immediately as [`GenerateError::Validation`].
    pub async fn generate(
        &self,
        prompt: &PromptInstance,
        cancel: Option<&AtomicBool>,
        observer: Option<&dyn AttemptObserver>,
    ) -> Result<DialogRecord, GenerateError> {
        let bounds = &self.config.bounds;
        self.with_retries(
            prompt.to_messages(),
            prompt.temperature,
            cancel,
            observer,
            |raw| parse_dialog_response(raw, prompt, bounds),
        )
        .await
    }

    /// Request an arbitrary JSON object. Unparseable output is retried like a
    /// malformed dialog.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        messages: Vec<Message>,
        temperature: f32,
        cancel: Option<&AtomicBool>,
    ) -> Result<T, GenerateError> {
        self.with_retries(messages, temperature, cancel, None, |raw| {
            let json = extract_json(raw)
                .ok_or_else(|| RecordError::Malformed("no JSON object in response".into()))?;
            serde_json::from_str(json).map_err(|e| RecordError::Malformed(e.to_string()))
        })
        .await
    }

    async fn with_retries<T, F>(
        &self,
        messages: Vec<Message>,
        temperature: f32,
        cancel: Option<&AtomicBool>,
        observer: Option<&dyn AttemptObserver>,
        parse: F,
    ) -> Result<T, GenerateError>
    where
        F: Fn(&str) -> Result<T, RecordError>,
    {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                return Err(GenerateError::Cancelled { attempts: attempt });
            }
            attempt += 1;
            if let Some(o) = observer {
                o.on_request(attempt);
            }

            let request =
                ChatRequest::json_object(&self.config.model, messages.clone(), temperature)
                    .max_tokens(self.config.max_tokens);
            let started = Instant::now();

            let failure = match self.provider.chat(&request).await {
                Ok(response) => {
                    if let Some(o) = observer {
                        o.on_validate(attempt);
                    }
                    match parse(&response.content) {
                        Ok(value) => {
                            self.record_usage(attempt, &response, AttemptOutcome::Accepted)
                                .await;
                            return Ok(value);
                        }
                        Err(RecordError::Invalid(message)) => {
                            let outcome = AttemptOutcome::Failed("validation");
                            self.record_usage(attempt, &response, outcome).await;
                            return Err(GenerateError::Validation {
                                attempts: attempt,
                                message,
                            });
                        }
                        Err(RecordError::Malformed(message)) => {
                            if response.finish_reason == FinishReason::Length {
                                warn!(
                                    attempt,
                                    max_tokens = self.config.max_tokens,
                                    output_tokens = response.output_tokens,
                                    "Completion cut off at max_tokens; response is truncated"
                                );
                            }
                            let outcome = AttemptOutcome::Failed("malformed_response");
                            self.record_usage(attempt, &response, outcome).await;
                            GenerateError::Malformed {
                                attempts: attempt,
                                message,
                            }
                        }
                    }
                }
                Err(err) => {
                    let outcome = AttemptOutcome::Failed(err.code());
                    let record = AttemptRecord::new(&self.config.model, attempt, outcome)
                        .latency(started.elapsed())
                        .request_id(err.request_id());
                    self.usage.record(record).await;

                    let retryable = err.is_retryable();
                    let failure = GenerateError::Transient {
                        attempts: attempt,
                        source: err,
                    };
                    if !retryable {
                        return Err(failure);
                    }
                    failure
                }
            };

            if attempt >= max_attempts {
                return Err(failure);
            }

            let delay = self.retry_delay(attempt, &failure);
            debug!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Completion attempt failed; retrying"
            );
            sleep(delay).await;
        }
    }

    fn retry_delay(&self, attempt: u32, failure: &GenerateError) -> Duration {
        let policy = &self.config.retry;
        let backoff = {
            let mut rng = rand::thread_rng();
            policy.delay_for(attempt - 1, &mut rng)
        };
        let hinted = match failure {
            GenerateError::Transient { source, .. } => source.retry_after(),
            _ => None,
        };
        match hinted {
            Some(hint) => backoff.max(hint.min(policy.max_delay)),
            None => backoff,
        }
    }

    async fn record_usage(&self, attempt: u32, response: &ChatResponse, outcome: AttemptOutcome) {
        let record = AttemptRecord::new(&self.config.model, attempt, outcome).usage(response);
        self.usage.record(record).await;
    }
}
