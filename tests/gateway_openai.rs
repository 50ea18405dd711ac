use std::time::Duration;

use dialog_harness::gateway::{
    ChatProvider, ChatRequest, FinishReason, Message, OpenAiCompatAdapter, ProviderError,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenAiCompatAdapter {
    OpenAiCompatAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap()
}

fn request() -> ChatRequest {
    ChatRequest::json_object(
        "gpt-4o-mini",
        vec![Message::system("be brief"), Message::user("hi")],
        0.7,
    )
    .max_tokens(100)
}

#[tokio::test]
async fn parses_success_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "max_tokens": 100,
            "response_format": { "type": "json_object" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "{\"dialog\": []}" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 34 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request()).await.unwrap();
    assert_eq!(resp.content, "{\"dialog\": []}");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 12);
    assert_eq!(resp.output_tokens, 34);
}

#[tokio::test]
async fn falls_back_to_tool_call_arguments_when_content_empty() {
    let server = MockServer::start().await;
    let args = r#"{"theme": "x"}"#;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{"function": {"arguments": args}}]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request()).await.unwrap();
    assert_eq!(resp.content, args);
    assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
    assert_eq!(resp.input_tokens, 0);
}

#[tokio::test]
async fn classifies_http_429_as_rate_limit_and_keeps_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "req-42")
                .insert_header("retry-after", "3")
                .set_body_json(json!({
                    "error": { "message": "slow down", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(err.is_retryable());
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
        } => {
            assert_eq!(retry_after, Duration::from_secs(3));
            assert_eq!(context.status, Some(429));
            assert_eq!(context.code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(context.request_id.as_deref(), Some("req-42"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn unrepresentable_retry_after_falls_back_to_default_wait() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1e30"))
        .mount(&server)
        .await;

    // Run inside a task so a panic would surface as a JoinError.
    let adapter = adapter(&server);
    let joined = tokio::spawn(async move { adapter.chat(&request()).await }).await;

    let err = joined.expect("chat task panicked").unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.code(), "upstream");
    assert_eq!(err.context().and_then(|c| c.status), Some(503));
}

#[tokio::test]
async fn client_errors_are_not_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "unknown model", "code": 400 }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(!err.is_retryable());
    match err {
        ProviderError::Rejected { message, context } => {
            assert_eq!(message, "unknown model");
            assert_eq!(context.status, Some(400));
            assert_eq!(context.code.as_deref(), Some("400"));
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn broken_envelope_on_success_status_is_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy error</html>"))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn slow_server_maps_to_timeout() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(2))
                .set_body_json(json!({ "choices": [] })),
        )
        .mount(&server)
        .await;

    let adapter =
        OpenAiCompatAdapter::with_config("sk-test", server.uri(), Duration::from_millis(200))
            .unwrap();
    let err = adapter.chat(&request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Timeout(..)), "got {err:?}");
    assert!(err.is_retryable());
}
