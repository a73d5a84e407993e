//! # omnilake-inference
//!
//! Inference backends for OmniLake.
//!
//! This crate provides:
//! - An Ollama backend implementing both embedding and generation
//! - A deterministic mock backend for tests (feature `mock`)
//! - The fixed prompt formats used by processors, responders and
//!   validation gates
//! - Parsing of SUCCESS/FAILURE judgments
//!
//! ## Features
//!
//! - `ollama` (default): Ollama backend
//! - `mock`: deterministic in-process backend
//! - `integration`: tests against a live Ollama server
//!
//! ## Example
//!
//! ```rust,no_run
//! use omnilake_inference::{GenerationBackend, OllamaBackend};
//!
//! # async fn example() -> omnilake_inference::Result<()> {
//! let backend = OllamaBackend::from_env();
//! let text = backend.generate("Say hello").await?;
//! println!("{}", text);
//! # Ok(())
//! # }
//! ```

pub mod judge;
pub mod prompts;

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export core types
pub use omnilake_core::*;

pub use judge::{parse_judgment, Judgment};

#[cfg(feature = "ollama")]
pub use ollama::{OllamaBackend, OllamaConfig};

#[cfg(any(test, feature = "mock"))]
pub use mock::MockInferenceBackend;
