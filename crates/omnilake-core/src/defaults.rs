//! Centralized default constants for OmniLake.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers. Organized by domain area.

// =============================================================================
// EVENT QUEUE / WORKER
// =============================================================================

/// Broadcast channel capacity for worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Polling interval when the event queue is empty (milliseconds).
pub const EVENT_POLL_INTERVAL_MS: u64 = 500;

/// Maximum events processed concurrently by one worker.
pub const EVENT_MAX_CONCURRENT: usize = 4;

/// Delivery attempts before an event is dead-lettered.
pub const EVENT_MAX_ATTEMPTS: i32 = 5;

/// Linear backoff step between retried deliveries (milliseconds).
pub const EVENT_RETRY_BACKOFF_MS: i64 = 2_000;

/// Hard ceiling on one handler invocation (seconds).
pub const EVENT_HANDLER_TIMEOUT_SECS: u64 = 600;

// =============================================================================
// DATABASE
// =============================================================================

/// Connections held by the pool. Each concurrent event handler holds at
/// most one, so this leaves headroom over [`EVENT_MAX_CONCURRENT`] for the API.
pub const DB_MAX_CONNECTIONS: u32 = 12;

/// Seconds to wait for a free pooled connection.
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Seconds an idle pooled connection is kept open.
pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;

// =============================================================================
// LOOKUPS
// =============================================================================

/// Default `max_entries` for BASIC and VECTOR lookups.
pub const LOOKUP_MAX_ENTRIES: i64 = 10;

/// Age after which an outstanding lookup countdown is force-completed (seconds).
pub const LOOKUP_TIMEOUT_SECS: u64 = 900;

/// Interval between timeout sweeps (seconds).
pub const LOOKUP_SWEEP_INTERVAL_SECS: u64 = 60;

/// Age after which a request stuck in PROCESSING is failed (seconds).
pub const PROCESSING_TIMEOUT_SECS: u64 = 1800;

/// Timeout for a single web page fetch (seconds).
pub const WEB_FETCH_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// ARCHIVES
// =============================================================================

/// Storage type backed by the vector index.
pub const STORAGE_TYPE_VECTOR: &str = "VECTOR";

/// Storage type with plain newest-first retrieval.
pub const STORAGE_TYPE_BASIC: &str = "BASIC";

/// Storage type fed by website retrieval.
pub const STORAGE_TYPE_WEB_SITE: &str = "WEB_SITE";

/// Source type recorded for pages fetched by WEB_SITE lookups.
pub const SOURCE_TYPE_WEB_SITE: &str = "WEB_SITE";

// =============================================================================
// INFERENCE
// =============================================================================

/// Default Ollama API base URL.
pub const OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Default generation model.
pub const GEN_MODEL: &str = "llama3.1:8b";

/// Default embedding model.
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Embedding dimension for the default embedding model.
pub const EMBED_DIMENSION: usize = 768;

/// Timeout for generation requests (seconds).
pub const GEN_TIMEOUT_SECS: u64 = 120;

/// Timeout for embedding requests (seconds).
pub const EMBED_TIMEOUT_SECS: u64 = 30;

/// Token cap for validation judgments, which answer with a single word.
pub const VALIDATION_MAX_TOKENS: u32 = 100;

// =============================================================================
// PROCESSING
// =============================================================================

/// Entries per group when summaries are re-summarized.
pub const SUMMARY_MAX_GROUP_SIZE: usize = 5;

/// Summarization rounds allowed before giving up.
pub const SUMMARY_MAX_RECURSION_DEPTH: u32 = 10;

/// Knowledge graph: minimum connections before splitting into communities.
pub const KG_COMMUNITY_THRESHOLD_MIN: usize = 50;

/// Knowledge graph: maximum connections per filtering group.
pub const KG_COMMUNITY_MAX_GROUP_SIZE: usize = 150;

/// Knowledge graph: edges lighter than this are dropped.
pub const KG_MINIMALLY_CONSIDERED_WEIGHT: u32 = 1;

/// Knowledge graph: percentage of densest communities kept.
pub const KG_TOP_N_COMMUNITIES_PERCENT: u32 = 80;

// =============================================================================
// RESPONSES
// =============================================================================

/// Separator used by WRAP responses when none is configured.
pub const WRAP_SEPARATOR: &str = "\n\n";
