//! Integration tests for the OpenAI-compatible client against a mock server.

use futures::StreamExt;
use quire_abstraction::{CompletionParams, FinishReason, Message, UpstreamClient, UpstreamError};
use quire_models::CompatibleClient;
use std::time::Duration;

fn params() -> CompletionParams {
    CompletionParams { temperature: Some(0.2), max_tokens: Some(64), ..CompletionParams::new("test-model") }
}

#[tokio::test]
async fn test_complete_success() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .match_header("authorization", "Bearer secret")
        .match_body(mockito::Matcher::PartialJsonString(
            r#"{"model":"test-model","messages":[{"role":"user","content":"Hi"}],"max_tokens":64}"#.to_string(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "model": "test-model-0613",
                "choices": [{"message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
            }"#,
        )
        .create_async()
        .await;

    let client = CompatibleClient::with_api_key(format!("{}/v1", server.url()), "secret").unwrap();
    let completion = client.complete(&[Message::user("Hi")], &params()).await.unwrap();

    assert_eq!(completion.text, "Hello!");
    assert_eq!(completion.finish_reason, FinishReason::Stop);
    assert_eq!(completion.usage.unwrap().total_tokens, 7);
    assert_eq!(completion.model.as_deref(), Some("test-model-0613"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_rate_limited_with_retry_after() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(429)
        .with_header("retry-after", "3")
        .with_body("slow down")
        .create_async()
        .await;

    let client = CompatibleClient::without_auth(format!("{}/v1", server.url())).unwrap();
    let err = client.complete(&[Message::user("Hi")], &params()).await.unwrap_err();

    assert_eq!(
        err,
        UpstreamError::RateLimited { retry_after: Some(Duration::from_secs(3)), message: "slow down".into() }
    );
    assert!(err.is_fallback_eligible());
}

async fn error_for_status(status: usize) -> UpstreamError {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(status)
        .with_body("nope")
        .create_async()
        .await;

    let client = CompatibleClient::without_auth(format!("{}/v1", server.url())).unwrap();
    client.complete(&[Message::user("Hi")], &params()).await.unwrap_err()
}

#[tokio::test]
async fn test_status_codes_are_classified() {
    assert!(matches!(error_for_status(401).await, UpstreamError::Unauthorized(_)));
    assert!(matches!(error_for_status(403).await, UpstreamError::Forbidden(_)));
    assert!(matches!(error_for_status(400).await, UpstreamError::InvalidRequest(_)));
    assert!(matches!(error_for_status(503).await, UpstreamError::Server { status: 503, .. }));
}

#[tokio::test]
async fn test_malformed_body_is_not_retriable() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_body("{not json")
        .create_async()
        .await;

    let client = CompatibleClient::without_auth(format!("{}/v1", server.url())).unwrap();
    let err = client.complete(&[Message::user("Hi")], &params()).await.unwrap_err();

    assert!(matches!(err, UpstreamError::MalformedResponse(_)));
    assert!(!err.is_retriable());
}

#[tokio::test]
async fn test_unreachable_server_is_network_error() {
    // Port 9 (discard) on loopback is not expected to accept connections.
    let client = CompatibleClient::without_auth("http://127.0.0.1:9/v1").unwrap();
    let err = client.complete(&[Message::user("Hi")], &params()).await.unwrap_err();

    assert!(matches!(err, UpstreamError::Network(_)), "got {err:?}");
}

#[tokio::test]
async fn test_streaming_success() {
    let mut server = mockito::Server::new_async().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"length\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .match_body(mockito::Matcher::PartialJsonString(r#"{"stream":true}"#.to_string()))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let client = CompatibleClient::without_auth(format!("{}/v1", server.url())).unwrap();
    let mut stream = client.complete_stream(&[Message::user("Say hello")], &params()).await.unwrap();

    let mut text = String::new();
    let mut last = None;
    while let Some(item) = stream.next().await {
        let delta = item.unwrap();
        text.push_str(&delta.delta);
        last = Some(delta);
    }

    assert_eq!(text, "Hello world");
    let last = last.unwrap();
    assert!(last.done);
    assert_eq!(last.finish_reason, Some(FinishReason::Length));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_streaming_open_failure() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(502)
        .with_body("bad gateway")
        .create_async()
        .await;

    let client = CompatibleClient::without_auth(format!("{}/v1", server.url())).unwrap();
    let result = client.complete_stream(&[Message::user("Hi")], &params()).await;

    assert!(matches!(result, Err(UpstreamError::Server { status: 502, .. })));
}
