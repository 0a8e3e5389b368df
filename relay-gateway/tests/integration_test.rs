//! Integration tests for the OpenAI-compatible streaming client.
//!
//! Runs the provider against a mock HTTP backend serving SSE bodies.

use relay_gateway::{ChatRequest, CompatibleProvider, CompletionProvider, StreamEvent, Turn};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request() -> ChatRequest {
    ChatRequest {
        model: "deepseek-chat".into(),
        messages: vec![Turn::system("Be brief"), Turn::user("Hello")],
        max_tokens: Some(256),
        temperature: Some(1.3),
    }
}

fn chunk(content: &str) -> String {
    let body = json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    });
    format!("data: {body}\n\n")
}

async fn collect(provider: &CompatibleProvider) -> Vec<StreamEvent> {
    let mut stream = provider.open_stream(request()).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = stream.next_event().await.unwrap() {
        events.push(event);
    }
    events
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stream_yields_deltas_until_done() {
    let server = MockServer::start().await;
    let body = format!(
        ": keep-alive\n\n{}{}{}data: [DONE]\n\n",
        chunk("Hel"),
        chunk("lo"),
        chunk("!")
    );

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({"model": "deepseek-chat", "stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = CompatibleProvider::new("deepseek", &server.uri(), "test-key");
    let text: String = collect(&provider)
        .await
        .into_iter()
        .flat_map(|e| e.deltas)
        .collect();

    assert_eq!(text, "Hello!");
}

#[tokio::test]
async fn test_stream_without_done_ends_cleanly() {
    let server = MockServer::start().await;
    let body = format!("{}data: {}", chunk("partial"), json!({"choices": [{"delta": {"content": " tail"}}]}));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = CompatibleProvider::new("deepseek", &server.uri(), "test-key");
    let events = collect(&provider).await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[1].deltas, vec![" tail".to_string()]);
}

#[tokio::test]
async fn test_events_after_done_are_ignored() {
    let server = MockServer::start().await;
    let body = format!("{}data: [DONE]\n\n{}", chunk("a"), chunk("b"));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = CompatibleProvider::new("deepseek", &server.uri(), "test-key");
    let events = collect(&provider).await;

    assert_eq!(events, vec![StreamEvent::delta("a")]);
}

#[tokio::test]
async fn test_error_payload_mid_stream_is_error() {
    let server = MockServer::start().await;
    let body = format!(
        "{}data: {}\n\n",
        chunk("a"),
        json!({"error": {"message": "upstream overloaded"}})
    );

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = CompatibleProvider::new("deepseek", &server.uri(), "test-key");
    let mut stream = provider.open_stream(request()).await.unwrap();

    assert_eq!(stream.next_event().await.unwrap(), Some(StreamEvent::delta("a")));
    let err = stream.next_event().await.unwrap_err();
    assert!(err.message.contains("upstream overloaded"));
}

#[tokio::test]
async fn test_open_fails_with_status() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let provider = CompatibleProvider::new("deepseek", &server.uri(), "bad-key");
    let err = provider.open_stream(request()).await.err().unwrap();

    assert_eq!(err.status_code, Some(401));
    assert!(err.message.contains("invalid api key"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Balance
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_balance_returns_first_entry() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/user/balance"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "is_available": true,
            "balance_infos": [
                {"currency": "CNY", "total_balance": "110.00", "granted_balance": "10.00", "topped_up_balance": "100.00"}
            ]
        })))
        .mount(&server)
        .await;

    let provider = CompatibleProvider::new("deepseek", &server.uri(), "test-key");
    let balance = provider.balance().await.unwrap();

    assert_eq!(balance.currency, "CNY");
    assert_eq!(balance.total_balance, "110.00");
}

#[tokio::test]
async fn test_balance_empty_is_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/user/balance"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"balance_infos": []})))
        .mount(&server)
        .await;

    let provider = CompatibleProvider::new("deepseek", &server.uri(), "test-key");
    assert!(provider.balance().await.is_err());
}
