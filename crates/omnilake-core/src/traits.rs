//! Core traits for OmniLake abstractions.
//!
//! These traits define the storage and inference seams of the engine.
//! PostgreSQL and in-memory implementations live in `omnilake-db`; the
//! Ollama and mock backends live in `omnilake-inference`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::*;

// =============================================================================
// JOB LEDGER
// =============================================================================

/// Storage for the job ledger.
///
/// Implementations provide the primitive conditional updates; the default
/// methods build child creation and failure propagation on top of them.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job.
    async fn create(&self, job: &Job) -> Result<()>;

    /// Fetch a job by its composite key.
    async fn get(&self, job_type: JobType, job_id: Uuid) -> Result<Option<Job>>;

    /// Overwrite the mutable fields of a job.
    async fn update(&self, job: &Job) -> Result<()>;

    /// PENDING -> IN_PROGRESS, stamping `started`. Returns false if the job
    /// was not PENDING.
    async fn mark_in_progress(&self, key: JobKey) -> Result<bool>;

    /// Move a non-terminal job to a terminal status, stamping `ended`.
    /// Returns false if the job was already terminal.
    async fn finish(
        &self,
        key: JobKey,
        status: JobStatus,
        status_message: Option<&str>,
        result: Option<JsonValue>,
    ) -> Result<bool>;

    /// Jobs whose parent is `parent`.
    async fn list_children(&self, parent: JobKey) -> Result<Vec<Job>>;

    /// Create a PENDING child of `parent`.
    async fn create_child(&self, parent: JobKey, job_type: JobType) -> Result<Job> {
        let job = Job::new(job_type).with_parent(parent);
        self.create(&job).await?;
        Ok(job)
    }

    async fn complete(&self, key: JobKey, status_message: Option<&str>) -> Result<bool> {
        self.finish(key, JobStatus::Completed, status_message, None)
            .await
    }

    /// Fail a job and, per `propagation`, its ancestors. Each ancestor gets
    /// `"<child_type>/<child_id> failed: <message>"`. Terminal jobs are
    /// never overwritten; propagation stops at the first one.
    async fn fail(
        &self,
        key: JobKey,
        message: &str,
        propagation: FailurePropagation,
    ) -> Result<bool> {
        let changed = self
            .finish(key, JobStatus::Failed, Some(message), None)
            .await?;
        if !changed || propagation == FailurePropagation::Suppressed {
            return Ok(changed);
        }

        let mut child = key;
        let mut message = message.to_string();
        loop {
            let Some(job) = self.get(child.job_type, child.job_id).await? else {
                break;
            };
            let Some(parent) = job.parent_key() else {
                break;
            };
            message = format!("{} failed: {}", child, message);
            if !self
                .finish(parent, JobStatus::Failed, Some(&message), None)
                .await?
            {
                break;
            }
            if propagation == FailurePropagation::Parent {
                break;
            }
            child = parent;
        }
        Ok(changed)
    }

    /// Fetch a job that must exist.
    async fn require(&self, key: JobKey) -> Result<Job> {
        self.get(key.job_type, key.job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", key)))
    }
}

// =============================================================================
// ARCHIVES, ENTRIES, SOURCES
// =============================================================================

#[async_trait]
pub trait ArchiveRepository: Send + Sync {
    /// Insert a new archive. Duplicate ids fail with `InvalidInput`.
    async fn create(&self, archive: &Archive) -> Result<()>;

    async fn get(&self, archive_id: &str) -> Result<Option<Archive>>;

    async fn list(&self) -> Result<Vec<Archive>>;

    /// Conditional status change; false if the archive was not in `from`.
    async fn transition_status(
        &self,
        archive_id: &str,
        from: ArchiveStatus,
        to: ArchiveStatus,
    ) -> Result<bool>;

    /// Add `token` to the holder set and set MAINTENANCE, atomically.
    /// Fails with `ArchiveBusy` from CREATING or DELETING.
    async fn begin_maintenance(&self, archive_id: &str, token: &str) -> Result<MaintenanceOutcome>;

    /// Remove `token` from the holder set, atomically; an emptied set
    /// returns the archive to ACTIVE.
    async fn end_maintenance(&self, archive_id: &str, token: &str) -> Result<MaintenanceOutcome>;

    /// Fetch an archive that must exist.
    async fn require(&self, archive_id: &str) -> Result<Archive> {
        self.get(archive_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("archive {}", archive_id)))
    }
}

#[async_trait]
pub trait EntryRepository: Send + Sync {
    async fn create(&self, entry: NewEntry) -> Result<Entry>;

    async fn get(&self, entry_id: Uuid) -> Result<Option<Entry>>;

    /// Entries that exist among `entry_ids`, in the given order.
    async fn get_many(&self, entry_ids: &[Uuid]) -> Result<Vec<Entry>>;

    /// Record archive membership. The archive status must permit
    /// `operation`, checked in the same statement.
    async fn index(
        &self,
        archive_id: &str,
        entry_id: Uuid,
        operation: ArchiveOperation,
    ) -> Result<()>;

    /// Archive entries, tag matches first, then newest `effective_on` first.
    async fn list_archive_entries(
        &self,
        archive_id: &str,
        prioritize_tags: &[String],
        limit: i64,
    ) -> Result<Vec<Uuid>>;

    /// Every entry id indexed in the archive.
    async fn archive_entry_ids(&self, archive_id: &str) -> Result<Vec<Uuid>>;

    /// Archive entries that are the original of a source but no longer its
    /// latest content.
    async fn superseded_originals(&self, archive_id: &str) -> Result<Vec<Uuid>>;

    /// Drop archive membership; returns the number removed.
    async fn remove_from_archive(&self, archive_id: &str, entry_ids: &[Uuid]) -> Result<u64>;

    /// Fetch an entry that must exist.
    async fn require(&self, entry_id: Uuid) -> Result<Entry> {
        self.get(entry_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("entry {}", entry_id)))
    }
}

#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn get(&self, source_type: &str, source_id: &str) -> Result<Option<Source>>;

    /// Insert or replace a source.
    async fn put(&self, source: &Source) -> Result<()>;
}

// =============================================================================
// LAKE REQUESTS AND CHAINS
// =============================================================================

#[async_trait]
pub trait LakeRequestRepository: Send + Sync {
    async fn create(&self, request: &LakeRequest) -> Result<()>;

    async fn get(&self, lake_request_id: Uuid) -> Result<Option<LakeRequest>>;

    /// Report one lookup completion: union `entry_ids` into
    /// `response_sources` and decrement `remaining_lookups`, as one atomic
    /// update. Returns the post-decrement count, or `None` when the request
    /// is no longer awaiting lookups.
    async fn add_lookup_results(
        &self,
        lake_request_id: Uuid,
        entry_ids: &[Uuid],
    ) -> Result<Option<i32>>;

    /// Atomically zero an outstanding countdown. True only for the caller
    /// that performed the change.
    async fn force_complete_lookups(&self, lake_request_id: Uuid) -> Result<bool>;

    /// Requests stuck in LOOKUP: lookups outstanding since before
    /// `older_than`, or a countdown that reached zero before `older_than`
    /// without the request leaving LOOKUP.
    async fn list_stalled_lookups(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Requests in PROCESSING, with no inception chains outstanding, whose
    /// stage last changed before `older_than`.
    async fn list_stalled_processing(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Conditional stage change; false if the request was not in `from`.
    async fn transition_stage(
        &self,
        lake_request_id: Uuid,
        from: LakeRequestStage,
        to: LakeRequestStage,
    ) -> Result<bool>;

    /// Set `request_status` while the request is not closed.
    async fn set_request_status(&self, lake_request_id: Uuid, status: JobStatus) -> Result<()>;

    /// Write the response entry only while it is unset.
    async fn set_response_entry(&self, lake_request_id: Uuid, entry_id: Uuid) -> Result<bool>;

    /// Move to CLOSED with a terminal status. False if already closed.
    async fn close(&self, lake_request_id: Uuid, status: JobStatus) -> Result<bool>;

    async fn set_remaining_chains(&self, lake_request_id: Uuid, count: i32) -> Result<()>;

    /// Decrement `remaining_chains`; returns the post-decrement value, or
    /// `None` if no sub-chains were outstanding.
    async fn record_chain_completion(&self, lake_request_id: Uuid) -> Result<Option<i32>>;

    /// Fetch a request that must exist.
    async fn require(&self, lake_request_id: Uuid) -> Result<LakeRequest> {
        self.get(lake_request_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("lake request {}", lake_request_id)))
    }
}

#[async_trait]
pub trait ChainRepository: Send + Sync {
    async fn create(&self, chain: &ChainRequest) -> Result<()>;

    async fn get(&self, chain_request_id: Uuid) -> Result<Option<ChainRequest>>;

    /// Persist `chain` if the stored version still equals `chain.version`;
    /// the stored version is then bumped. False on a version conflict.
    async fn save(&self, chain: &ChainRequest) -> Result<bool>;

    /// Chains whose callback targets the lake request.
    async fn list_by_callback(&self, lake_request_id: Uuid) -> Result<Vec<ChainRequest>>;

    async fn require(&self, chain_request_id: Uuid) -> Result<ChainRequest> {
        self.get(chain_request_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("chain request {}", chain_request_id)))
    }
}

// =============================================================================
// EVENT QUEUE
// =============================================================================

/// Durable queue of engine events.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Enqueue an event, available immediately.
    async fn publish(&self, event: LakeEvent) -> Result<Uuid>;

    /// Enqueue with an explicit delivery limit and delay.
    async fn publish_with(
        &self,
        event: LakeEvent,
        max_attempts: i32,
        delay_ms: i64,
    ) -> Result<Uuid>;

    /// Claim the oldest available PENDING event of the given types, marking
    /// it RUNNING and counting the attempt. Concurrent claimers never
    /// receive the same event.
    async fn claim_next(&self, event_types: &[LakeEventType]) -> Result<Option<QueuedEvent>>;

    async fn complete(&self, event_id: Uuid) -> Result<()>;

    /// Return the event to PENDING after `delay_ms`.
    async fn retry(&self, event_id: Uuid, error: &str, delay_ms: i64) -> Result<()>;

    /// Dead-letter the event.
    async fn fail(&self, event_id: Uuid, error: &str) -> Result<()>;

    async fn get(&self, event_id: Uuid) -> Result<Option<QueuedEvent>>;

    /// PENDING or RUNNING events.
    async fn pending_count(&self) -> Result<i64>;
}

// =============================================================================
// VECTOR INDEX
// =============================================================================

/// Per-archive similarity index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, archive_id: &str, entry_id: Uuid, embedding: Vector) -> Result<()>;

    /// Nearest entries by cosine distance; entries carrying any of
    /// `prioritize_tags` rank first.
    async fn query(
        &self,
        archive_id: &str,
        embedding: &Vector,
        prioritize_tags: &[String],
        limit: i64,
    ) -> Result<Vec<Uuid>>;

    async fn remove(&self, archive_id: &str, entry_ids: &[Uuid]) -> Result<u64>;
}

// =============================================================================
// INFERENCE TRAITS
// =============================================================================

/// Backend for generating text embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Returns one embedding per input text.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>>;

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Per-call generation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationOptions {
    /// Overrides the backend's default model.
    pub model: Option<String>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
}

impl GenerationOptions {
    pub fn with_model(mut self, model: Option<&str>) -> Self {
        self.model = model.map(str::to_string);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Backend for text generation (LLM).
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate_with_options(&self, prompt: &str, options: &GenerationOptions)
        -> Result<String>;

    /// Generate text given a prompt.
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_with_options(prompt, &GenerationOptions::default())
            .await
    }

    /// Generate text with system context.
    async fn generate_with_system(&self, system: &str, prompt: &str) -> Result<String> {
        let options = GenerationOptions {
            system: Some(system.to_string()),
            ..Default::default()
        };
        self.generate_with_options(prompt, &options).await
    }

    fn model_name(&self) -> &str;
}
