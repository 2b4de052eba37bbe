//! Wire-level tests for the OpenAI-compatible provider against a mock
//! HTTP server.

use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use engram::config::LlmConfig;
use engram::llm::{ChatOptions, CompletionOptions, LlmClient, LlmError, OpenAiCompatClient};

fn client_for(server: &MockServer) -> OpenAiCompatClient {
    OpenAiCompatClient::new(LlmConfig {
        base_url: server.base_url(),
        api_key: Some("test-key".to_string()),
        request_timeout: Duration::from_secs(5),
        ..LlmConfig::default()
    })
    .expect("client builds")
}

#[tokio::test]
async fn completion_extracts_the_first_choice() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("authorization", "Bearer test-key");
            then.status(200).json_body(json!({
                "choices": [
                    { "message": { "role": "assistant", "content": "IMPORTANCE_SCORE: 0.7" } }
                ]
            }));
        })
        .await;

    let client = client_for(&server);
    let reply = client
        .completion("score this", &CompletionOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, "IMPORTANCE_SCORE: 0.7");
    mock.assert_async().await;
}

#[tokio::test]
async fn memory_context_is_prepended_verbatim_before_the_user_message() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .body_contains("RELEVANT MEMORIES")
                .body_contains("USER MESSAGE: hello there");
            then.status(200).json_body(json!({
                "choices": [{ "message": { "content": "hi!" } }]
            }));
        })
        .await;

    let client = client_for(&server);
    let options = ChatOptions::default().with_memory_context("RELEVANT MEMORIES\n- likes tea");
    let reply = client
        .send_message("u1", "s1", "hello there", &options)
        .await
        .unwrap();
    assert_eq!(reply.text, "hi!");
    mock.assert_async().await;
}

#[tokio::test]
async fn embeddings_are_reordered_by_index() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/embeddings");
            then.status(200).json_body(json!({
                "data": [
                    { "index": 1, "embedding": [0.0, 1.0] },
                    { "index": 0, "embedding": [1.0, 0.0] }
                ]
            }));
        })
        .await;

    let client = client_for(&server);
    let vectors = client
        .embed_batch(&["first".to_string(), "second".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
}

#[tokio::test]
async fn embedding_count_mismatch_is_malformed() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/embeddings");
            then.status(200).json_body(json!({
                "data": [{ "index": 0, "embedding": [1.0, 0.0] }]
            }));
        })
        .await;

    let client = client_for(&server);
    let err = client
        .embed_batch(&["first".to_string(), "second".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Malformed(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn server_errors_are_retryable_client_errors_are_not() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(503).body("overloaded");
        })
        .await;

    let client = client_for(&server);
    let err = client
        .completion("hi", &CompletionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Http { status: 503, .. }));
    assert!(err.is_retryable());

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(400).body("bad request");
        })
        .await;
    let client = client_for(&server);
    let err = client
        .completion("hi", &CompletionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Http { status: 400, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn missing_choices_is_malformed() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({ "choices": [] }));
        })
        .await;

    let client = client_for(&server);
    let err = client
        .completion("hi", &CompletionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Malformed(_)));
}
