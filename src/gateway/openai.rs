//! HTTP adapter for OpenAI-compatible `chat/completions` endpoints.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{ErrorContext, ProviderError};
use super::types::{ChatRequest, ChatResponse, FinishReason, Message};

/// Anything that can answer a chat request. The HTTP adapter in production,
/// scripted stubs in tests.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Bodies above this are refused rather than buffered.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Roughly 125k tokens of prompt.
const MAX_INPUT_CHARS: usize = 500_000;

/// Wait used when a 429 has no usable Retry-After.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OpenAiCompatAdapter {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl OpenAiCompatAdapter {
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key.into()))
            .map_err(|_| ProviderError::setup("API key contains invalid header characters"))?;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::setup(format!("cannot build HTTP client: {e}")))?;

        let base_url = base_url.into();
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn send_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Transport(err)
        }
    }

    /// Read the body chunk by chunk, refusing anything over [`MAX_BODY_BYTES`].
    async fn read_capped(&self, mut response: reqwest::Response) -> Result<String, ProviderError> {
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.send_error(e))? {
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(ProviderError::upstream(
                    format!("response body exceeds {MAX_BODY_BYTES} bytes"),
                    false,
                ));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    fn status_error(
        &self,
        status: StatusCode,
        retry_after: Duration,
        body: &str,
        ctx: ErrorContext,
    ) -> ProviderError {
        let wire = serde_json::from_str::<WireResponse>(body)
            .ok()
            .and_then(|r| r.error);
        let ctx = ctx.and_code(wire.as_ref().and_then(WireError::code_string));
        let message = wire
            .and_then(|e| e.message)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

        let err = match status.as_u16() {
            429 => ProviderError::rate_limited(retry_after),
            408 => return ProviderError::Timeout(self.timeout),
            400..=499 => ProviderError::rejected(message),
            code => ProviderError::upstream(message, code >= 500),
        };
        err.with_context(ctx)
    }
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Delta-seconds Retry-After. HTTP dates and values no `Duration` can hold
/// fall back to [`DEFAULT_RETRY_AFTER`].
fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

// -----------------------------------------------------------------------------
// Wire format
// -----------------------------------------------------------------------------

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireFormat>,
}

#[derive(Serialize)]
struct WireFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl<'a> From<&'a ChatRequest> for WireRequest<'a> {
    fn from(req: &'a ChatRequest) -> Self {
        Self {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: req.json_object.then_some(WireFormat {
                kind: "json_object",
            }),
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: Option<WireMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

impl WireMessage {
    /// Message text, or the first non-empty tool-call argument string for
    /// models that answer JSON mode through a tool call.
    fn into_text(self) -> String {
        match self.content {
            Some(text) if !text.trim().is_empty() => text,
            _ => self
                .tool_calls
                .into_iter()
                .filter_map(|call| call.function.and_then(|f| f.arguments))
                .find(|args| !args.trim().is_empty())
                .unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct WireToolCall {
    function: Option<WireFunction>,
}

#[derive(Deserialize)]
struct WireFunction {
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct WireError {
    message: Option<String>,
    /// String on OpenAI, a number on some compatible servers.
    code: Option<serde_json::Value>,
}

impl WireError {
    fn code_string(&self) -> Option<String> {
        match self.code.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let chars = req.input_chars();
        if chars > MAX_INPUT_CHARS {
            return Err(ProviderError::rejected(format!(
                "prompt has {chars} chars, limit is {MAX_INPUT_CHARS}"
            )));
        }

        let started = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .json(&WireRequest::from(req))
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        let status = response.status();
        let hinted_wait = retry_after(response.headers());
        let ctx = ErrorContext::from_status(status.as_u16())
            .and_request_id(request_id(response.headers()));
        let body = self.read_capped(response).await?;

        if !status.is_success() {
            return Err(self.status_error(status, hinted_wait, &body, ctx));
        }

        // A 2xx with a broken envelope usually comes from a flaky proxy.
        let parsed: WireResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::upstream(format!("unreadable response envelope: {e}"), true)
                .with_context(ctx.clone())
        })?;
        if let Some(error) = parsed.error {
            let ctx = ctx.and_code(error.code_string());
            return Err(
                ProviderError::upstream(error.message.unwrap_or_default(), true).with_context(ctx),
            );
        }
        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(ProviderError::upstream("response has no choices", true).with_context(ctx));
        };

        let usage = parsed.usage.unwrap_or(WireUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
        });
        let latency = started.elapsed();
        debug!(
            model = %req.model,
            latency_ms = latency.as_millis() as u64,
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            "Completion received"
        );

        Ok(ChatResponse {
            content: choice.message.map(WireMessage::into_text).unwrap_or_default(),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            latency,
            finish_reason: FinishReason::parse(choice.finish_reason.as_deref()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_ignores_trailing_slash() {
        let adapter =
            OpenAiCompatAdapter::with_config("k", "http://localhost:1/v1/", Duration::from_secs(1))
                .unwrap();
        assert_eq!(adapter.endpoint(), "http://localhost:1/v1/chat/completions");
    }

    #[test]
    fn retry_after_accepts_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), DEFAULT_RETRY_AFTER);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers), Duration::from_secs(2));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), DEFAULT_RETRY_AFTER);
        for junk in ["1e30", "-1", "inf", "NaN"] {
            headers.insert(RETRY_AFTER, HeaderValue::from_static(junk));
            assert_eq!(retry_after(&headers), DEFAULT_RETRY_AFTER, "{junk}");
        }
    }

    #[test]
    fn wire_request_asks_for_json_object() {
        let req = ChatRequest::json_object(
            "m",
            vec![Message::system("s"), Message::user("u")],
            0.5,
        )
        .max_tokens(10);
        let v = serde_json::to_value(WireRequest::from(&req)).unwrap();
        assert_eq!(v["response_format"]["type"], "json_object");
        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["max_tokens"], 10);

        let plain = ChatRequest::plain("m", Vec::new(), 0.0);
        let v = serde_json::to_value(WireRequest::from(&plain)).unwrap();
        assert!(v.get("response_format").is_none());
        assert!(v.get("max_tokens").is_none());
    }

    #[test]
    fn tool_call_arguments_stand_in_for_empty_content() {
        let msg: WireMessage = serde_json::from_value(serde_json::json!({
            "content": "  ",
            "tool_calls": [{"function": {"arguments": ""}}, {"function": {"arguments": "{\"a\":1}"}}]
        }))
        .unwrap();
        assert_eq!(msg.into_text(), "{\"a\":1}");
    }
}
