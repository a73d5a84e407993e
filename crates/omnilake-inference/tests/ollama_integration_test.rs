//! Live Ollama tests.
//!
//! ```bash
//! OLLAMA_BASE=http://localhost:11434 cargo test -p omnilake-inference --features integration
//! ```

#![cfg(all(feature = "integration", feature = "ollama"))]

use omnilake_inference::prompts::judge_prompt;
use omnilake_inference::{
    parse_judgment, EmbeddingBackend, GenerationBackend, GenerationOptions, OllamaBackend,
};

#[tokio::test]
async fn test_live_embedding_dimension() {
    let backend = OllamaBackend::from_env();
    let vectors = backend
        .embed_texts(&["the lake holds entries".to_string()])
        .await
        .expect("embedding should succeed");
    assert_eq!(vectors[0].as_slice().len(), backend.dimension());
}

#[tokio::test]
async fn test_live_judgment_is_parseable() {
    let backend = OllamaBackend::from_env();
    let prompt = judge_prompt("The content mentions a cat.", "The cat sat on the mat.");
    let options = GenerationOptions::default().with_max_tokens(10);
    let answer = backend
        .generate_with_options(&prompt, &options)
        .await
        .expect("generation should succeed");
    // Small models sometimes add punctuation; only well-formed answers are asserted.
    if let Ok(judgment) = parse_judgment(&answer) {
        assert!(judgment.is_success());
    }
}
