//! Ollama backend: `/api/chat` for generation, `/api/embed` for embeddings.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use omnilake_core::{
    defaults, EmbeddingBackend, Error, GenerationBackend, GenerationOptions, Result, Vector,
};

/// Calls slower than this are logged at WARN.
const SLOW_CALL: Duration = Duration::from_secs(30);

/// Connection settings for one Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub gen_model: String,
    pub embed_model: String,
    /// Length of the vectors `embed_model` produces.
    pub dimension: usize,
    pub gen_timeout: Duration,
    pub embed_timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::OLLAMA_URL.to_string(),
            gen_model: defaults::GEN_MODEL.to_string(),
            embed_model: defaults::EMBED_MODEL.to_string(),
            dimension: defaults::EMBED_DIMENSION,
            gen_timeout: Duration::from_secs(defaults::GEN_TIMEOUT_SECS),
            embed_timeout: Duration::from_secs(defaults::EMBED_TIMEOUT_SECS),
        }
    }
}

impl OllamaConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `OLLAMA_BASE` | `http://127.0.0.1:11434` |
    /// | `OLLAMA_GEN_MODEL` | `llama3.1:8b` |
    /// | `OLLAMA_EMBED_MODEL` | `nomic-embed-text` |
    /// | `OLLAMA_EMBED_DIM` | `768` |
    /// | `OMNILAKE_GEN_TIMEOUT_SECS` | `120` |
    /// | `OMNILAKE_EMBED_TIMEOUT_SECS` | `30` |
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("OLLAMA_BASE") {
            config.base_url = url;
        }
        if let Ok(model) = std::env::var("OLLAMA_GEN_MODEL") {
            config.gen_model = model;
        }
        if let Ok(model) = std::env::var("OLLAMA_EMBED_MODEL") {
            config.embed_model = model;
        }
        if let Some(dim) = env_number("OLLAMA_EMBED_DIM") {
            config.dimension = dim as usize;
        }
        if let Some(secs) = env_number("OMNILAKE_GEN_TIMEOUT_SECS") {
            config.gen_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_number("OMNILAKE_EMBED_TIMEOUT_SECS") {
            config.embed_timeout = Duration::from_secs(secs);
        }
        config
    }
}

fn env_number(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

/// Ollama inference backend. Serves both [`GenerationBackend`] and
/// [`EmbeddingBackend`] from one HTTP client.
pub struct OllamaBackend {
    client: Client,
    config: OllamaConfig,
}

impl OllamaBackend {
    pub fn new(mut config: OllamaConfig) -> Self {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        info!(
            subsystem = "inference",
            component = "ollama",
            base_url = %config.base_url,
            gen_model = %config.gen_model,
            embed_model = %config.embed_model,
            "Ollama backend configured"
        );
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Backend for `base_url` with explicit models and default timeouts.
    pub fn with_config(
        base_url: String,
        embed_model: String,
        gen_model: String,
        dimension: usize,
    ) -> Self {
        Self::new(OllamaConfig {
            base_url,
            gen_model,
            embed_model,
            dimension,
            ..OllamaConfig::default()
        })
    }

    pub fn from_env() -> Self {
        Self::new(OllamaConfig::from_env())
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// True when `/api/tags` answers with a success status.
    pub async fn health_check(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.config.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        Ok(matches!(response, Ok(r) if r.status().is_success()))
    }

    /// POST `body` to `endpoint` and decode the JSON answer. Transport,
    /// status and decode failures all go through `to_error` so generation
    /// and embedding keep their own error variants.
    async fn post<B, R>(
        &self,
        endpoint: &str,
        body: &B,
        timeout: Duration,
        to_error: fn(String) -> Error,
    ) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}{}", self.config.base_url, endpoint))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| to_error(format!("{} unreachable: {}", endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(to_error(format!("{} returned {}: {}", endpoint, status, detail)));
        }

        let decoded = response
            .json::<R>()
            .await
            .map_err(|e| to_error(format!("{} sent an unreadable body: {}", endpoint, e)))?;

        let elapsed = started.elapsed();
        if elapsed > SLOW_CALL {
            warn!(endpoint, duration_ms = elapsed.as_millis() as u64, "Slow Ollama call");
        } else {
            debug!(endpoint, duration_ms = elapsed.as_millis() as u64, "Ollama call complete");
        }
        Ok(decoded)
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new(OllamaConfig::default())
    }
}

// =============================================================================
// WIRE FORMAT
// =============================================================================

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<Turn<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Sampling>,
}

#[derive(Serialize)]
struct Turn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct Sampling {
    num_predict: u32,
}

#[derive(Deserialize)]
struct ChatReply {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: String,
}

#[derive(Serialize)]
struct EmbedBody<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedReply {
    embeddings: Vec<Vec<f32>>,
}

fn chat_body<'a>(model: &'a str, prompt: &'a str, options: &'a GenerationOptions) -> ChatBody<'a> {
    let system = options
        .system
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|content| Turn {
            role: "system",
            content,
        });
    let messages = system
        .into_iter()
        .chain(std::iter::once(Turn {
            role: "user",
            content: prompt,
        }))
        .collect();

    ChatBody {
        model,
        messages,
        stream: false,
        options: options.max_tokens.map(|num_predict| Sampling { num_predict }),
    }
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    #[instrument(skip(self, prompt, options), fields(subsystem = "inference", component = "ollama", op = "generate", prompt_len = prompt.len()))]
    async fn generate_with_options(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String> {
        let model = options.model.as_deref().unwrap_or(&self.config.gen_model);
        let body = chat_body(model, prompt, options);
        let reply: ChatReply = self
            .post("/api/chat", &body, self.config.gen_timeout, Error::Inference)
            .await?;
        Ok(reply.message.content)
    }

    fn model_name(&self) -> &str {
        &self.config.gen_model
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    #[instrument(skip(self, texts), fields(subsystem = "inference", component = "ollama", op = "embed_texts", input_count = texts.len()))]
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbedBody {
            model: &self.config.embed_model,
            input: texts,
        };
        let reply: EmbedReply = self
            .post("/api/embed", &body, self.config.embed_timeout, Error::Embedding)
            .await?;

        if reply.embeddings.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "asked for {} embeddings, Ollama returned {}",
                texts.len(),
                reply.embeddings.len()
            )));
        }
        Ok(reply.embeddings.into_iter().map(Vector::from).collect())
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        &self.config.embed_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_models() {
        let backend = OllamaBackend::default();
        assert_eq!(backend.base_url(), defaults::OLLAMA_URL);
        assert_eq!(GenerationBackend::model_name(&backend), defaults::GEN_MODEL);
        assert_eq!(EmbeddingBackend::model_name(&backend), defaults::EMBED_MODEL);
        assert_eq!(backend.dimension(), defaults::EMBED_DIMENSION);
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let backend =
            OllamaBackend::with_config("http://ollama:11434/".into(), "e".into(), "g".into(), 8);
        assert_eq!(backend.base_url(), "http://ollama:11434");
    }

    #[test]
    fn test_chat_body_shape() {
        let plain = GenerationOptions::default();
        let value = serde_json::to_value(chat_body("m", "hi", &plain)).unwrap();
        assert!(value.get("options").is_none());
        assert_eq!(value["messages"].as_array().unwrap().len(), 1);
        assert_eq!(value["messages"][0]["role"], "user");

        let judged = GenerationOptions {
            model: None,
            system: Some("be strict".into()),
            max_tokens: Some(100),
        };
        let value = serde_json::to_value(chat_body("m", "hi", &judged)).unwrap();
        assert_eq!(value["options"]["num_predict"], 100);
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hi");
    }

    #[test]
    fn test_empty_system_prompt_is_dropped() {
        let options = GenerationOptions {
            system: Some(String::new()),
            ..GenerationOptions::default()
        };
        let value = serde_json::to_value(chat_body("m", "hi", &options)).unwrap();
        assert_eq!(value["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_embed_empty_input_skips_request() {
        let backend =
            OllamaBackend::with_config("http://127.0.0.1:1".into(), "e".into(), "g".into(), 8);
        assert!(backend.embed_texts(&[]).await.unwrap().is_empty());
    }
}
