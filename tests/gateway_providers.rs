use std::time::Duration;

use quill_harness::gateway::{
    AnthropicAdapter, Attribution, ChatModel, ChatProvider, ChatRequest, FinishReason, Message,
    OpenAiAdapter, ProviderError,
};
use quill_harness::Retryable;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn openai(server: &MockServer) -> OpenAiAdapter {
    OpenAiAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap()
}

fn anthropic(server: &MockServer) -> AnthropicAdapter {
    AnthropicAdapter::with_config("sk-ant-test", server.uri(), Duration::from_secs(5)).unwrap()
}

fn request(model: ChatModel) -> ChatRequest {
    ChatRequest::new(
        model,
        vec![
            Message::system("You are an expert book outliner."),
            Message::user("Outline a story about a lighthouse keeper."),
        ],
        Attribution::new("test"),
    )
    .temperature(0.7)
    .max_tokens(256)
}

#[tokio::test]
async fn openai_parses_content_usage_and_request_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "gpt-4", "max_tokens": 256})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-request-id", "req_123")
                .set_body_json(json!({
                    "choices": [{
                        "message": { "content": "Act I: the storm." },
                        "finish_reason": "stop"
                    }],
                    "usage": { "prompt_tokens": 12, "completion_tokens": 5 }
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let resp = openai(&server)
        .chat(&request(ChatModel::openai("gpt-4")))
        .await
        .unwrap();
    assert_eq!(resp.content, "Act I: the storm.");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 12);
    assert_eq!(resp.output_tokens, 5);
    assert_eq!(resp.request_id.as_deref(), Some("req_123"));
}

#[tokio::test]
async fn openai_rate_limit_is_transient_with_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_json(json!({"error": {"message": "slow down", "code": "rate_limit"}})),
        )
        .mount(&server)
        .await;

    let err = openai(&server)
        .chat(&request(ChatModel::openai("gpt-4")))
        .await
        .unwrap_err();
    match &err {
        ProviderError::RateLimited { retry_after, .. } => {
            assert_eq!(*retry_after, Duration::from_secs(7));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn openai_server_error_is_retryable_and_bad_request_is_not() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "flaky"})))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "broken"})))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"error": {"message": "unknown model"}})),
        )
        .mount(&server)
        .await;

    let adapter = openai(&server);
    let err = adapter
        .chat(&request(ChatModel::openai("flaky")))
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "{err:?}");

    let err = adapter
        .chat(&request(ChatModel::openai("broken")))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::InvalidRequest { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn openai_refusal_and_missing_choices_are_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "prude"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": null, "refusal": "I can't help with that." } }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "empty"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&server)
        .await;

    let adapter = openai(&server);
    let err = adapter
        .chat(&request(ChatModel::openai("prude")))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Refused { .. }));

    let err = adapter
        .chat(&request(ChatModel::openai("empty")))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::MalformedResponse { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn anthropic_sends_system_out_of_band_and_joins_text_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("x-api-key", "sk-ant-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "model": "claude-3-opus-20240229",
            "system": "You are an expert book outliner.",
            "messages": [{"role": "user", "content": "Outline a story about a lighthouse keeper."}],
            "max_tokens": 256
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("request-id", "msg_abc")
                .set_body_json(json!({
                    "content": [
                        {"type": "text", "text": "Act I. "},
                        {"type": "text", "text": "Act II."}
                    ],
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 20, "output_tokens": 4}
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let resp = anthropic(&server)
        .chat(&request(ChatModel::anthropic("claude-3-opus-20240229")))
        .await
        .unwrap();
    assert_eq!(resp.content, "Act I. Act II.");
    assert_eq!(resp.input_tokens, 20);
    assert_eq!(resp.request_id.as_deref(), Some("msg_abc"));
}

#[tokio::test]
async fn anthropic_overloaded_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_json(json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        })))
        .mount(&server)
        .await;

    let err = anthropic(&server)
        .chat(&request(ChatModel::anthropic("claude-3-opus-20240229")))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.code(), "provider_error");
}

#[tokio::test]
async fn anthropic_rejects_system_only_requests() {
    let server = MockServer::start().await;
    let req = ChatRequest::new(
        ChatModel::anthropic("claude-3-opus-20240229"),
        vec![Message::system("alone")],
        Attribution::new("test"),
    );
    let err = anthropic(&server).chat(&req).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidRequest { .. }));
}
