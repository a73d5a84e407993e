//! Processors turn a request's gathered entries into one processed entry.
//!
//! SUMMARIZATION and KNOWLEDGE_GRAPH finish within one event. INCEPTION
//! launches sub-chains and finishes when their callbacks arrive.

pub mod inception;
pub mod knowledge_graph;
pub mod summarization;

use uuid::Uuid;

pub use inception::InceptionProcessor;
pub use knowledge_graph::{KnowledgeGraph, KnowledgeGraphProcessor};
pub use summarization::Summarizer;

/// The stored result of processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingOutput {
    pub entry_id: Uuid,
    pub content: String,
}

/// What a processor did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// The processed entry is ready for the response stage.
    Completed(ProcessingOutput),
    /// Sub-chains are running; their callbacks resume the request.
    Deferred,
}
