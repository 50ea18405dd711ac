//! Per-attempt accounting.
//!
//! The completion client reports every request it sends, accepted or not.
//! [`crate::stats::RunStats`] aggregates the reports; [`NoopUsageSink`] drops them.

use std::time::Duration;

use async_trait::async_trait;

use super::types::ChatResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Accepted,
    /// Failure label, e.g. `timeout` or `validation`.
    Failed(&'static str),
}

/// One request sent to the completion service.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub model: String,
    /// 1-based within one task's retry loop.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency: Duration,
    pub request_id: Option<String>,
}

impl AttemptRecord {
    pub fn new(model: &str, attempt: u32, outcome: AttemptOutcome) -> Self {
        Self {
            model: model.to_string(),
            attempt,
            outcome,
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::ZERO,
            request_id: None,
        }
    }

    /// Copy token counts and latency from the response.
    pub fn usage(mut self, response: &ChatResponse) -> Self {
        self.input_tokens = response.input_tokens;
        self.output_tokens = response.output_tokens;
        self.latency = response.latency;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn request_id(mut self, id: Option<&str>) -> Self {
        self.request_id = id.map(str::to_string);
        self
    }
}

/// Receives attempt records. Implementations must not fail the caller.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: AttemptRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: AttemptRecord) {}
}
