//! Mock inference backend for deterministic testing.
//!
//! Generation answers come from substring mappings checked in insertion
//! order, falling back to a fixed response. Embeddings are derived from the
//! text's characters, so equal texts always embed equally.
//!
//! ## Usage
//!
//! ```rust
//! use omnilake_inference::mock::MockInferenceBackend;
//! use omnilake_inference::GenerationBackend;
//!
//! # async fn example() {
//! let backend = MockInferenceBackend::new()
//!     .with_fixed_response("summary")
//!     .with_response_mapping("VALIDATION INSTRUCTIONS:", "SUCCESS");
//!
//! assert_eq!(backend.generate("anything").await.unwrap(), "summary");
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use omnilake_core::{EmbeddingBackend, Error, GenerationBackend, GenerationOptions, Result, Vector};

type Responder = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Mock inference backend for testing.
#[derive(Clone)]
pub struct MockInferenceBackend {
    config: Arc<MockConfig>,
    call_log: Arc<Mutex<Vec<MockCall>>>,
}

#[derive(Clone)]
struct MockConfig {
    dimension: usize,
    mappings: Vec<(String, String)>,
    responder: Option<Arc<Responder>>,
    default_response: String,
    latency_ms: u64,
    fail_on: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub operation: String,
    pub input: String,
    /// Model requested through [`GenerationOptions`], if any.
    pub model: Option<String>,
    pub timestamp: std::time::Instant,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            dimension: 8,
            mappings: Vec::new(),
            responder: None,
            default_response: "Mock response".to_string(),
            latency_ms: 0,
            fail_on: Vec::new(),
        }
    }
}

impl MockInferenceBackend {
    /// Create a new mock backend with default configuration.
    pub fn new() -> Self {
        Self {
            config: Arc::new(MockConfig::default()),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the embedding dimension.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        Arc::make_mut(&mut self.config).dimension = dimension;
        self
    }

    /// Set the response used when no mapping matches.
    pub fn with_fixed_response(mut self, response: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).default_response = response.into();
        self
    }

    /// Answer `output` to any prompt containing `needle`. Earlier mappings win.
    pub fn with_response_mapping(
        mut self,
        needle: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Arc::make_mut(&mut self.config)
            .mappings
            .push((needle.into(), output.into()));
        self
    }

    /// Compute answers from the prompt; consulted before the mappings.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.config).responder = Some(Arc::new(responder));
        self
    }

    /// Set simulated latency for all operations.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        Arc::make_mut(&mut self.config).latency_ms = latency_ms;
        self
    }

    /// Fail every call whose input contains `needle`.
    pub fn with_failure_on(mut self, needle: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).fail_on.push(needle.into());
        self
    }

    /// Get all logged calls for assertion.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.log().clone()
    }

    /// Clear the call log.
    pub fn clear_calls(&self) {
        self.log().clear()
    }

    /// Get number of embed calls.
    pub fn embed_call_count(&self) -> usize {
        self.count("embed")
    }

    /// Get number of generation calls.
    pub fn generate_call_count(&self) -> usize {
        self.count("generate")
    }

    fn count(&self, operation: &str) -> usize {
        self.log().iter().filter(|c| c.operation == operation).count()
    }

    fn log(&self) -> MutexGuard<'_, Vec<MockCall>> {
        self.call_log.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log_call(&self, operation: &str, input: &str, model: Option<&str>) {
        self.log().push(MockCall {
            operation: operation.to_string(),
            input: input.to_string(),
            model: model.map(str::to_string),
            timestamp: std::time::Instant::now(),
        });
    }

    fn should_fail(&self, input: &str) -> bool {
        self.config.fail_on.iter().any(|n| input.contains(n))
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.config.latency_ms)).await;
        }
    }

    fn respond(&self, prompt: &str) -> String {
        if let Some(answer) = self.config.responder.as_ref().and_then(|r| r(prompt)) {
            return answer;
        }
        self.config
            .mappings
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| self.config.default_response.clone())
    }
}

impl Default for MockInferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic unit vector derived from the characters of `text`.
pub fn mock_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dimension.max(1)];
    let len = vec.len();
    for (i, c) in text.chars().enumerate() {
        vec[(c as usize + i) % len] += 0.1;
    }
    let magnitude: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        vec.iter_mut().for_each(|x| *x /= magnitude);
    }
    vec
}

#[async_trait]
impl EmbeddingBackend for MockInferenceBackend {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            self.log_call("embed", text, None);
            self.simulate_latency().await;
            if self.should_fail(text) {
                return Err(Error::Embedding("Simulated failure for testing".into()));
            }
            out.push(Vector::from(mock_embedding(text, self.config.dimension)));
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}

#[async_trait]
impl GenerationBackend for MockInferenceBackend {
    async fn generate_with_options(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String> {
        self.log_call("generate", prompt, options.model.as_deref());
        self.simulate_latency().await;
        if self.should_fail(prompt) {
            return Err(Error::Inference("Simulated failure for testing".into()));
        }
        Ok(self.respond(prompt))
    }

    fn model_name(&self) -> &str {
        "mock-gen"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_backend_embed() {
        let backend = MockInferenceBackend::new().with_dimension(16);
        let vectors = backend.embed_texts(&["test".to_string()]).await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].as_slice().len(), 16);
        assert_eq!(backend.embed_call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_backend_deterministic() {
        let a = mock_embedding("quantum computing", 32);
        let b = mock_embedding("quantum computing", 32);
        assert_eq!(a, b);
        assert_ne!(a, mock_embedding("something else", 32));
    }

    #[tokio::test]
    async fn test_mock_backend_generate_fixed_response() {
        let backend = MockInferenceBackend::new().with_fixed_response("Custom response");
        assert_eq!(backend.generate("test prompt").await.unwrap(), "Custom response");
    }

    #[tokio::test]
    async fn test_mock_backend_mapping_is_substring_first_wins() {
        let backend = MockInferenceBackend::new()
            .with_response_mapping("hello", "world")
            .with_response_mapping("hello there", "never");
        assert_eq!(backend.generate("oh hello there").await.unwrap(), "world");
    }

    #[tokio::test]
    async fn test_mock_backend_responder_precedes_mappings() {
        let backend = MockInferenceBackend::new()
            .with_response_mapping("x", "mapped")
            .with_responder(|p| p.starts_with('x').then(|| p.to_uppercase()));
        assert_eq!(backend.generate("xyz").await.unwrap(), "XYZ");
        assert_eq!(backend.generate("axe").await.unwrap(), "mapped");
    }

    #[tokio::test]
    async fn test_mock_backend_failure_and_call_log() {
        let backend = MockInferenceBackend::new().with_failure_on("boom");
        assert!(backend.generate("boom").await.is_err());
        let options = GenerationOptions::default().with_model(Some("judge"));
        backend.generate_with_options("fine", &options).await.unwrap();

        let calls = backend.get_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].model.as_deref(), Some("judge"));
        backend.clear_calls();
        assert_eq!(backend.generate_call_count(), 0);
    }
}
