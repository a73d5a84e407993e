//! Core data models for OmniLake.
//!
//! These types are shared across all OmniLake crates. Jobs, archives,
//! entries and sources live here; the request, chain and queue types are
//! split into submodules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::uuid_utils::new_v7;
use crate::{Error, Result};

pub mod chain;
pub mod deferred;
pub mod event;
pub mod lake_request;
pub mod lookup;
pub mod processing;
pub mod response;

pub use chain::*;
pub use deferred::*;
pub use event::*;
pub use lake_request::*;
pub use lookup::*;
pub use processing::*;
pub use response::*;

pub use pgvector::Vector;

// =============================================================================
// JOB TYPES
// =============================================================================

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal statuses are never overwritten.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(Error::InvalidInput(format!("Invalid job status: {}", s))),
        }
    }
}

/// Kind of tracked work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Umbrella job of a single lake request
    LakeRequest,
    /// Umbrella job of a chain
    LakeChainRequest,
    /// One dispatched lookup instruction
    LakeLookup,
    /// Recursive summarization processor
    LakeProcessorSummarizer,
    /// Knowledge graph processor
    LakeProcessorKnowledgeGraph,
    /// Inception processor (sub-chains)
    LakeProcessorChain,
    /// Response stage
    LakeResponder,
    /// Validation gate judgment of a chain step
    ChainRequestValidation,
    /// Removes superseded originals from an archive index
    ArchiveVacuum,
    /// Re-embeds every entry of a vector archive
    ArchiveReindex,
}

impl JobType {
    pub const ALL: [JobType; 10] = [
        JobType::LakeRequest,
        JobType::LakeChainRequest,
        JobType::LakeLookup,
        JobType::LakeProcessorSummarizer,
        JobType::LakeProcessorKnowledgeGraph,
        JobType::LakeProcessorChain,
        JobType::LakeResponder,
        JobType::ChainRequestValidation,
        JobType::ArchiveVacuum,
        JobType::ArchiveReindex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LakeRequest => "LAKE_REQUEST",
            Self::LakeChainRequest => "LAKE_CHAIN_REQUEST",
            Self::LakeLookup => "LAKE_LOOKUP",
            Self::LakeProcessorSummarizer => "LAKE_PROCESSOR_SUMMARIZER",
            Self::LakeProcessorKnowledgeGraph => "LAKE_PROCESSOR_KNOWLEDGE_GRAPH",
            Self::LakeProcessorChain => "LAKE_PROCESSOR_CHAIN",
            Self::LakeResponder => "LAKE_RESPONDER",
            Self::ChainRequestValidation => "CHAIN_REQUEST_VALIDATION",
            Self::ArchiveVacuum => "ARCHIVE_VACUUM",
            Self::ArchiveReindex => "ARCHIVE_REINDEX",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        JobType::ALL
            .iter()
            .find(|jt| jt.as_str() == s)
            .copied()
            .ok_or_else(|| Error::InvalidInput(format!("Invalid job type: {}", s)))
    }
}

/// Composite key of a job: jobs are addressed by `(job_type, job_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub job_type: JobType,
    pub job_id: Uuid,
}

impl JobKey {
    pub fn new(job_type: JobType, job_id: Uuid) -> Self {
        Self { job_type, job_id }
    }
}

/// Renders as `JOB_TYPE/job_id`, the form used for archive maintenance tokens.
impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.job_type, self.job_id)
    }
}

impl std::str::FromStr for JobKey {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let (job_type, job_id) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidInput(format!("Invalid job key: {}", s)))?;
        let job_id = Uuid::parse_str(job_id)
            .map_err(|e| Error::InvalidInput(format!("Invalid job id in {}: {}", s, e)))?;
        Ok(Self::new(job_type.parse()?, job_id))
    }
}

/// A tracked unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Weak back-reference used for failure propagation only.
    pub parent_job_id: Option<Uuid>,
    pub parent_job_type: Option<JobType>,
    pub created_on: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    pub status_message: Option<String>,
    pub result: Option<JsonValue>,
}

impl Job {
    /// Create a new PENDING job.
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_id: new_v7(),
            job_type,
            status: JobStatus::Pending,
            parent_job_id: None,
            parent_job_type: None,
            created_on: Utc::now(),
            started: None,
            ended: None,
            status_message: None,
            result: None,
        }
    }

    /// Create a PENDING job linked to `self` as its parent.
    pub fn child(&self, job_type: JobType) -> Self {
        Self::new(job_type).with_parent(self.key())
    }

    pub fn with_parent(mut self, parent: JobKey) -> Self {
        self.parent_job_id = Some(parent.job_id);
        self.parent_job_type = Some(parent.job_type);
        self
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.job_type, self.job_id)
    }

    pub fn parent_key(&self) -> Option<JobKey> {
        match (self.parent_job_type, self.parent_job_id) {
            (Some(job_type), Some(job_id)) => Some(JobKey::new(job_type, job_id)),
            _ => None,
        }
    }
}

/// How a job failure travels up the parent chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePropagation {
    /// The failure stays on this job.
    Suppressed,
    /// The direct parent is failed as well.
    Parent,
    /// Every ancestor is failed.
    #[default]
    Ancestors,
}

// =============================================================================
// ARCHIVE TYPES
// =============================================================================

/// Status of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveStatus {
    Active,
    Creating,
    Deleting,
    Maintenance,
}

impl ArchiveStatus {
    pub const ALL: [ArchiveStatus; 4] = [
        ArchiveStatus::Active,
        ArchiveStatus::Creating,
        ArchiveStatus::Deleting,
        ArchiveStatus::Maintenance,
    ];

    /// Statuses in which `operation` may proceed.
    pub fn permitting(operation: ArchiveOperation) -> Vec<ArchiveStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.permits(operation))
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Creating => "CREATING",
            Self::Deleting => "DELETING",
            Self::Maintenance => "MAINTENANCE",
        }
    }

    /// Whether an operation of the given kind may proceed in this status.
    pub fn permits(&self, operation: ArchiveOperation) -> bool {
        match operation {
            ArchiveOperation::Read | ArchiveOperation::Write => *self == Self::Active,
            ArchiveOperation::Provision => matches!(self, Self::Active | Self::Creating),
        }
    }
}

impl std::fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArchiveStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "CREATING" => Ok(Self::Creating),
            "DELETING" => Ok(Self::Deleting),
            "MAINTENANCE" => Ok(Self::Maintenance),
            _ => Err(Error::InvalidInput(format!("Invalid archive status: {}", s))),
        }
    }
}

/// Kinds of archive access gated by the archive status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOperation {
    /// Lookups against the archive.
    Read,
    /// Indexing new entries into the archive.
    Write,
    /// Writes performed while the archive is still being created.
    Provision,
}

/// Visibility of an archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveVisibility {
    #[default]
    Public,
    System,
}

impl ArchiveVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "PUBLIC",
            Self::System => "SYSTEM",
        }
    }
}

impl std::str::FromStr for ArchiveVisibility {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PUBLIC" => Ok(Self::Public),
            "SYSTEM" => Ok(Self::System),
            _ => Err(Error::InvalidInput(format!(
                "Invalid archive visibility: {}",
                s
            ))),
        }
    }
}

/// A named logical collection of entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    pub archive_id: String,
    pub description: Option<String>,
    pub status: ArchiveStatus,
    pub visibility: ArchiveVisibility,
    pub storage_type: String,
    pub retain_latest_originals_only: bool,
    pub tag_hint_instructions: Option<String>,
    /// Storage-type specific settings, e.g. `base_url` for WEB_SITE archives.
    pub configuration: JsonValue,
    /// `JOB_TYPE/job_id` tokens of the jobs holding the archive in maintenance.
    pub status_context_job_ids: Vec<String>,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

impl Archive {
    /// Fail with `ArchiveBusy` unless the status permits the operation.
    pub fn check(&self, operation: ArchiveOperation) -> Result<()> {
        if self.status.permits(operation) {
            Ok(())
        } else {
            Err(Error::ArchiveBusy {
                archive_id: self.archive_id.clone(),
                status: self.status,
            })
        }
    }

    /// String value of a configuration key.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.configuration.get(key).and_then(JsonValue::as_str)
    }

    pub fn is_vector(&self) -> bool {
        self.storage_type == crate::defaults::STORAGE_TYPE_VECTOR
    }
}

/// Request to create a new archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateArchiveRequest {
    pub archive_id: String,
    pub description: Option<String>,
    #[serde(default = "default_storage_type")]
    pub storage_type: String,
    #[serde(default)]
    pub visibility: ArchiveVisibility,
    #[serde(default)]
    pub retain_latest_originals_only: bool,
    pub tag_hint_instructions: Option<String>,
    #[serde(default = "empty_object")]
    pub configuration: JsonValue,
}

fn default_storage_type() -> String {
    crate::defaults::STORAGE_TYPE_VECTOR.to_string()
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Default::default())
}

impl CreateArchiveRequest {
    pub fn validate(&self) -> Result<()> {
        if self.archive_id.trim().is_empty() {
            return Err(Error::Validation("archive_id is required".into()));
        }
        if !self
            .archive_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::Validation(format!(
                "archive_id '{}' may only contain letters, digits, '_' and '-'",
                self.archive_id
            )));
        }
        match self.storage_type.as_str() {
            crate::defaults::STORAGE_TYPE_VECTOR | crate::defaults::STORAGE_TYPE_BASIC => Ok(()),
            crate::defaults::STORAGE_TYPE_WEB_SITE => {
                if self
                    .configuration
                    .get("base_url")
                    .and_then(JsonValue::as_str)
                    .is_none()
                {
                    return Err(Error::Validation(
                        "WEB_SITE archives require configuration.base_url".into(),
                    ));
                }
                Ok(())
            }
            other => Err(Error::Validation(format!(
                "unsupported storage_type '{}'",
                other
            ))),
        }
    }

    /// Build the archive record in CREATING status.
    pub fn into_archive(self) -> Archive {
        let now = Utc::now();
        Archive {
            archive_id: self.archive_id,
            description: self.description,
            status: ArchiveStatus::Creating,
            visibility: self.visibility,
            storage_type: self.storage_type,
            retain_latest_originals_only: self.retain_latest_originals_only,
            tag_hint_instructions: self.tag_hint_instructions,
            configuration: self.configuration,
            status_context_job_ids: Vec::new(),
            created_on: now,
            updated_on: now,
        }
    }
}

/// Result of a maintenance begin/end call.
#[derive(Debug, Clone, PartialEq)]
pub enum MaintenanceOutcome {
    /// The holder set changed; carries the archive after the update.
    Applied(Archive),
    /// The call was redundant; carries the archive as found.
    Unchanged(Archive),
}

impl MaintenanceOutcome {
    pub fn archive(&self) -> &Archive {
        match self {
            Self::Applied(a) | Self::Unchanged(a) => a,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

// =============================================================================
// ENTRY TYPES
// =============================================================================

/// A unit of content with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub entry_id: Uuid,
    pub content: String,
    pub char_count: i64,
    pub content_hash: String,
    /// Entry ids or source resource names this entry was derived from.
    pub sources: Vec<String>,
    /// `source_type/source_id` when this entry is the raw content of a source.
    pub original_of_source: Option<String>,
    pub tags: Vec<String>,
    pub effective_on: DateTime<Utc>,
    pub created_on: DateTime<Utc>,
}

/// Entry to be stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEntry {
    pub content: String,
    #[serde(default)]
    pub sources: Vec<String>,
    pub original_of_source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub effective_on: Option<DateTime<Utc>>,
}

impl NewEntry {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Record the given entries as this entry's sources.
    pub fn with_source_entries(mut self, entry_ids: &[Uuid]) -> Self {
        self.sources = entry_ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn with_effective_on(mut self, effective_on: DateTime<Utc>) -> Self {
        self.effective_on = Some(effective_on);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn original_of(mut self, source_type: &str, source_id: &str) -> Self {
        self.original_of_source = Some(format!("{}/{}", source_type, source_id));
        self
    }

    /// Materialize the entry with a fresh id.
    pub fn into_entry(self) -> Entry {
        let now = Utc::now();
        Entry {
            entry_id: new_v7(),
            char_count: self.content.chars().count() as i64,
            content_hash: content_hash(&self.content),
            content: self.content,
            sources: self.sources,
            original_of_source: self.original_of_source,
            tags: self.tags,
            effective_on: self.effective_on.unwrap_or(now),
            created_on: now,
        }
    }
}

/// SHA-256 hex digest of entry content.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// An external origin of content, e.g. a fetched web page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub source_type: String,
    pub source_id: String,
    #[serde(default = "empty_object")]
    pub source_arguments: JsonValue,
    pub latest_content_entry_id: Option<Uuid>,
    #[serde(default = "Utc::now")]
    pub added_on: DateTime<Utc>,
}

impl Source {
    /// The `source_type/source_id` resource name.
    pub fn resource_name(&self) -> String {
        format!("{}/{}", self.source_type, self.source_id)
    }
}

/// Rule for the `effective_on` date of a synthesized entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EffectiveOnRule {
    /// Time of synthesis.
    #[default]
    Runtime,
    /// Mean of the source entries' dates.
    Average,
    /// Latest source entry date.
    Newest,
    /// Earliest source entry date.
    Oldest,
}

impl EffectiveOnRule {
    /// Compute the effective date from the source entries' dates.
    pub fn compute(&self, dates: &[DateTime<Utc>]) -> DateTime<Utc> {
        let now = Utc::now();
        if dates.is_empty() {
            return now;
        }
        match self {
            Self::Runtime => now,
            Self::Newest => dates.iter().max().copied().unwrap_or(now),
            Self::Oldest => dates.iter().min().copied().unwrap_or(now),
            Self::Average => {
                let sum: i128 = dates.iter().map(|d| d.timestamp_millis() as i128).sum();
                let avg = (sum / dates.len() as i128) as i64;
                DateTime::<Utc>::from_timestamp_millis(avg).unwrap_or(now)
            }
        }
    }
}
