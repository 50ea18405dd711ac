//! Failures of a single completion call, classified for the retry loop.

use std::time::Duration;

use thiserror::Error;

/// What the remote side said about a failed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub status: Option<u16>,
    /// Provider error code from the JSON body, e.g. `rate_limit_exceeded`.
    pub code: Option<String>,
    /// `x-request-id` response header.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn from_status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn and_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn and_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 429. Worth retrying once `retry_after` has passed.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        retry_after: Duration,
        context: ErrorContext,
    },

    /// The service refused the request as such; repeating it cannot help.
    #[error("request rejected: {message}")]
    Rejected {
        message: String,
        context: ErrorContext,
    },

    #[error("upstream failure: {message}")]
    Upstream {
        message: String,
        retryable: bool,
        context: ErrorContext,
    },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Client could not be built (bad key, missing env var).
    #[error("client setup failed: {0}")]
    Setup(String),
}

impl ProviderError {
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::RateLimited {
            retry_after,
            context: ErrorContext::default(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn upstream(message: impl Into<String>, retryable: bool) -> Self {
        Self::Upstream {
            message: message.into(),
            retryable,
            context: ErrorContext::default(),
        }
    }

    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup(message.into())
    }

    /// Attach remote context. No-op for variants that carry none.
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        match &mut self {
            Self::RateLimited { context, .. }
            | Self::Rejected { context, .. }
            | Self::Upstream { context, .. } => *context = ctx,
            Self::Timeout(_) | Self::Transport(_) | Self::Setup(_) => {}
        }
        self
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) => true,
            Self::Upstream { retryable, .. } => *retryable,
            // Builder errors mean the request itself is broken.
            Self::Transport(e) => !e.is_builder(),
            Self::Rejected { .. } | Self::Setup(_) => false,
        }
    }

    /// Minimum wait the service asked for.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short label used in attempt records and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Rejected { .. } => "rejected",
            Self::Upstream { .. } => "upstream",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::Setup(_) => "setup",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::Rejected { context, .. }
            | Self::Upstream { context, .. } => Some(context),
            Self::Timeout(_) | Self::Transport(_) | Self::Setup(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context()?.request_id.as_deref()
    }
}
