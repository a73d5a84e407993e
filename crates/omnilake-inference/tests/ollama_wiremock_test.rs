//! Ollama backend against a mocked HTTP server.

#![cfg(feature = "ollama")]

use omnilake_inference::{
    EmbeddingBackend, Error, GenerationBackend, GenerationOptions, OllamaBackend,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend_for(server: &MockServer) -> OllamaBackend {
    OllamaBackend::with_config(
        server.uri(),
        "test-embed".to_string(),
        "test-gen".to_string(),
        3,
    )
}

#[tokio::test]
async fn test_generate_posts_chat_request() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({
            "model": "test-gen",
            "stream": false,
            "messages": [{"role": "user", "content": "hello"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {"role": "assistant", "content": "hi there"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    assert_eq!(backend.generate("hello").await.unwrap(), "hi there");
}

#[tokio::test]
async fn test_generate_with_options_overrides_model_and_caps_tokens() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({
            "model": "judge-model",
            "options": {"num_predict": 100},
            "messages": [
                {"role": "system", "content": "be strict"},
                {"role": "user", "content": "judge this"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {"role": "assistant", "content": "SUCCESS"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let options = GenerationOptions {
        model: Some("judge-model".to_string()),
        system: Some("be strict".to_string()),
        max_tokens: Some(100),
    };
    let answer = backend
        .generate_with_options("judge this", &options)
        .await
        .unwrap();
    assert_eq!(answer, "SUCCESS");
}

#[tokio::test]
async fn test_generate_error_status_is_inference_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
        .mount(&server)
        .await;

    let err = backend_for(&server).generate("hello").await.unwrap_err();
    match err {
        Error::Inference(msg) => {
            assert!(msg.contains("500"), "{msg}");
            assert!(msg.contains("model not loaded"), "{msg}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_embed_texts_parses_embeddings() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({"model": "test-embed", "input": ["a", "b"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let vectors = backend_for(&server)
        .embed_texts(&["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[1].as_slice(), &[0.4, 0.5, 0.6]);
}

#[tokio::test]
async fn test_embed_count_mismatch_is_embedding_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[0.1, 0.2, 0.3]]
        })))
        .mount(&server)
        .await;

    let err = backend_for(&server)
        .embed_texts(&["a".to_string(), "b".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Embedding(_)));
}

#[tokio::test]
async fn test_health_check() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
        .mount(&server)
        .await;

    assert!(backend_for(&server).health_check().await.unwrap());
}
