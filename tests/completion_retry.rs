use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dialog_harness::completion::{CompletionClient, CompletionConfig, GenerateError};
use dialog_harness::gateway::{
    ChatProvider, ChatRequest, ChatResponse, ErrorContext, FinishReason, ProviderError,
    RetryPolicy,
};
use dialog_harness::{FailureKind, PromptInstance, RecordBounds, RunStats};
use serde::Deserialize;

type Scripted = Result<ChatResponse, ProviderError>;

/// Replays a fixed script of responses, then answers with `fallback`.
struct ScriptedProvider {
    script: Mutex<VecDeque<Scripted>>,
    fallback: fn() -> Scripted,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(script: Vec<Scripted>, fallback: fn() -> Scripted) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(self.fallback)
    }
}

fn server_error() -> Scripted {
    Err(ProviderError::upstream("HTTP 503", true))
}

fn good_dialog() -> Scripted {
    Ok(ChatResponse::text(
        r#"{"theme": "ignored", "dialog": ["Hi!", "Hello.", "How are you?"], "language": "en"}"#,
    ))
}

fn prompt() -> PromptInstance {
    PromptInstance {
        theme_text: "two friends plan a trip".into(),
        language_code: "en".into(),
        language_name: "English".into(),
        temperature: 0.8,
        target_line_range: (2, 6),
        system: "You write dialogs.".into(),
        user: "Write a dialog.".into(),
    }
}

fn make_client(
    provider: Arc<ScriptedProvider>,
    stats: Arc<RunStats>,
    attempts: u32,
) -> CompletionClient {
    CompletionClient::new(
        provider,
        stats,
        CompletionConfig {
            model: "test-model".into(),
            max_tokens: 500,
            retry: RetryPolicy::immediate(attempts),
            bounds: RecordBounds {
                min_lines: 2,
                max_lines: 6,
                languages: vec!["en".into(), "ru".into()],
            },
        },
    )
}

#[tokio::test]
async fn transient_failures_below_the_limit_end_in_success() {
    let provider = ScriptedProvider::new(vec![server_error(), server_error()], good_dialog);
    let stats = Arc::new(RunStats::new(&["en"]));
    let client = make_client(provider.clone(), stats.clone(), 3);

    let record = client.generate(&prompt(), None, None).await.unwrap();

    assert_eq!(record.theme, "two friends plan a trip");
    assert_eq!(record.language, "en");
    assert_eq!(record.dialog.len(), 3);
    assert_eq!(provider.calls(), 3);
    assert_eq!(stats.requests_failed(), 2);
    assert_eq!(stats.requests_ok(), 1);
}

#[tokio::test]
async fn truncated_completion_is_retried_and_its_tokens_counted() {
    let cut_off = ChatResponse {
        input_tokens: 40,
        output_tokens: 500,
        finish_reason: FinishReason::Length,
        ..ChatResponse::text(r#"{"theme": "x", "dialog": ["Hi!", "Hel"#)
    };
    let provider = ScriptedProvider::new(vec![Ok(cut_off)], good_dialog);
    let stats = Arc::new(RunStats::new(&["en"]));
    let client = make_client(provider.clone(), stats.clone(), 3);

    let record = client.generate(&prompt(), None, None).await.unwrap();

    assert_eq!(record.dialog.len(), 3);
    assert_eq!(provider.calls(), 2);
    assert_eq!(stats.requests_failed(), 1);
    assert_eq!(stats.tokens(), (40, 500));
    assert_eq!(stats.snapshot().total_tokens, 540);
}

#[tokio::test]
async fn exhausting_attempts_reports_transient_failure() {
    let provider = ScriptedProvider::new(Vec::new(), server_error);
    let stats = Arc::new(RunStats::new(&["en"]));
    let client = make_client(provider.clone(), stats.clone(), 4);

    let err = client.generate(&prompt(), None, None).await.unwrap_err();

    assert!(matches!(err, GenerateError::Transient { attempts: 4, .. }), "got {err:?}");
    assert_eq!(err.kind(), Some(FailureKind::Transient));
    assert_eq!(provider.calls(), 4);
    assert_eq!(stats.requests_failed(), 4);
    assert_eq!(stats.requests_ok(), 0);
}

#[tokio::test]
async fn rate_limit_hint_is_capped_by_max_delay() {
    fn limited() -> Scripted {
        Err(ProviderError::rate_limited(Duration::from_secs(30))
            .with_context(ErrorContext::from_status(429)))
    }
    let provider = ScriptedProvider::new(vec![limited()], good_dialog);
    let stats = Arc::new(RunStats::new(&["en"]));
    let client = make_client(provider.clone(), stats.clone(), 2);

    let started = std::time::Instant::now();
    let record = client.generate(&prompt(), None, None).await.unwrap();

    assert_eq!(record.language, "en");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(stats.requests_failed(), 1);
}

#[tokio::test]
async fn non_retryable_errors_stop_after_one_attempt() {
    fn rejected() -> Scripted {
        Err(ProviderError::rejected("unknown model"))
    }
    let provider = ScriptedProvider::new(Vec::new(), rejected);
    let stats = Arc::new(RunStats::new(&["en"]));
    let client = make_client(provider.clone(), stats.clone(), 5);

    let err = client.generate(&prompt(), None, None).await.unwrap_err();

    assert!(matches!(err, GenerateError::Transient { attempts: 1, .. }), "got {err:?}");
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn malformed_output_is_retried() {
    fn prose() -> Scripted {
        Ok(ChatResponse::text("Sure! Here is a lovely dialog about travel."))
    }
    let provider = ScriptedProvider::new(vec![prose()], good_dialog);
    let stats = Arc::new(RunStats::new(&["en"]));
    let client = make_client(provider.clone(), stats.clone(), 3);

    let record = client.generate(&prompt(), None, None).await.unwrap();
    assert_eq!(record.dialog, vec!["Hi!", "Hello.", "How are you?"]);
    assert_eq!(provider.calls(), 2);
    assert_eq!(stats.requests_failed(), 1);

    let provider = ScriptedProvider::new(Vec::new(), prose);
    let client = make_client(provider.clone(), Arc::new(RunStats::new(&["en"])), 2);
    let err = client.generate(&prompt(), None, None).await.unwrap_err();
    assert!(matches!(err, GenerateError::Malformed { attempts: 2, .. }), "got {err:?}");
}

#[tokio::test]
async fn validation_failures_are_not_retried() {
    fn wrong_language() -> Scripted {
        Ok(ChatResponse::text(
            r#"{"dialog": ["Привет", "Здравствуй"], "language": "ru"}"#,
        ))
    }
    let provider = ScriptedProvider::new(Vec::new(), wrong_language);
    let stats = Arc::new(RunStats::new(&["en"]));
    let client = make_client(provider.clone(), stats.clone(), 3);

    let err = client.generate(&prompt(), None, None).await.unwrap_err();

    assert!(matches!(err, GenerateError::Validation { attempts: 1, .. }), "got {err:?}");
    assert_eq!(err.kind(), Some(FailureKind::Validation));
    assert_eq!(provider.calls(), 1);
    assert_eq!(stats.requests_failed(), 1);
}

#[tokio::test]
async fn too_short_dialog_is_a_validation_failure() {
    fn one_line() -> Scripted {
        Ok(ChatResponse::text(r#"{"dialog": ["Hi."], "language": "en"}"#))
    }
    let provider = ScriptedProvider::new(Vec::new(), one_line);
    let client = make_client(provider.clone(), Arc::new(RunStats::new(&["en"])), 3);

    let err = client.generate(&prompt(), None, None).await.unwrap_err();
    assert!(matches!(err, GenerateError::Validation { .. }), "got {err:?}");
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn cancellation_is_checked_before_each_attempt() {
    let provider = ScriptedProvider::new(Vec::new(), server_error);
    let client = make_client(provider.clone(), Arc::new(RunStats::new(&["en"])), 3);
    let cancel = AtomicBool::new(true);

    let err = client
        .generate(&prompt(), Some(&cancel), None)
        .await
        .unwrap_err();

    assert!(matches!(err, GenerateError::Cancelled { attempts: 0 }));
    assert_eq!(err.kind(), None);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn request_json_deserializes_fenced_objects() {
    #[derive(Debug, Deserialize)]
    struct Cleaned {
        cleaned_text: String,
    }
    fn fenced() -> Scripted {
        Ok(ChatResponse::text(
            "```json\n{\"cleaned_text\": \"Fixed line\"}\n```",
        ))
    }
    let provider = ScriptedProvider::new(Vec::new(), fenced);
    let client = make_client(provider, Arc::new(RunStats::new(&["en"])), 1);

    let value: Cleaned = client
        .request_json(prompt().to_messages(), 0.1, None)
        .await
        .unwrap();
    assert_eq!(value.cleaned_text, "Fixed line");
}
