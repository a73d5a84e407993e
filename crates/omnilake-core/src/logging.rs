//! Structured logging schema and field name constants for OmniLake.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation can query a lake request or chain across every
//! handler that touched it.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), stage and step completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration, high-volume data (entry ids, graph edges) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "api", "db", "inference", "jobs"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "coordinator", "executor", "chain", "maintenance", "sweep", "worker"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "add_lookup_results", "begin_maintenance", "resolve", "claim_next"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job type enum variant.
pub const JOB_TYPE: &str = "job_type";

/// Lake request UUID.
pub const LAKE_REQUEST_ID: &str = "lake_request_id";

/// Chain request UUID.
pub const CHAIN_REQUEST_ID: &str = "chain_request_id";

/// Chain step name.
pub const STEP_NAME: &str = "step_name";

/// Archive identifier.
pub const ARCHIVE_ID: &str = "archive_id";

/// Entry UUID.
pub const ENTRY_ID: &str = "entry_id";

/// Queue event UUID.
pub const EVENT_ID: &str = "event_id";

/// Queue event type.
pub const EVENT_TYPE: &str = "event_type";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of entries returned by a lookup or query.
pub const RESULT_COUNT: &str = "result_count";

/// Lookups still outstanding for a lake request.
pub const REMAINING_LOOKUPS: &str = "remaining_lookups";

/// Delivery attempt number of a queue event.
pub const ATTEMPT: &str = "attempt";

// ─── Model fields ──────────────────────────────────────────────────────────

/// Model name used for inference.
pub const MODEL: &str = "model";

/// Prompt length in characters.
pub const PROMPT_LEN: &str = "prompt_len";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Whether an operation succeeded.
pub const SUCCESS: &str = "success";

/// Error message on failure.
pub const ERROR_MSG: &str = "error";
