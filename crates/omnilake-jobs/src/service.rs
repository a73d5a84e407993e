//! The request surface: submission, description and archive management.
//!
//! Submissions are validated synchronously; anything accepted is handed to
//! the event pipeline and the caller gets identifiers back immediately.

use omnilake_core::{
    Archive, ArchiveOperation, ArchiveStatus, ChainDescription, ChainSubmitted,
    CreateArchiveRequest, Entry, Error, Job, JobType, LakeChainStep, LakeEvent,
    LakeRequestBody, LakeRequestDescription, LakeRequestSubmitted, NewEntry, PlaceholderPolicy,
    Result, Source,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::chain::{launch_chain, ChainOrchestrator};
use crate::chain_validation::validate_chain;
use crate::context::EngineContext;
use crate::executor::RequestExecutor;
use crate::maintenance::MaintenanceHandler;
use crate::storage::EntryStore;
use crate::sweep::{LookupTimeoutSweep, SweepConfig};
use crate::worker::{EventWorker, WorkerBuilder, WorkerConfig};

/// Body of a chain submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSubmission {
    pub chain: Vec<LakeChainStep>,
}

/// Body of an entry submission; `archive_id` indexes the new entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddEntryRequest {
    #[serde(flatten)]
    pub entry: NewEntry,
    #[serde(default)]
    pub archive_id: Option<String>,
}

#[derive(Clone)]
pub struct LakeService {
    ctx: EngineContext,
    executor: RequestExecutor,
    store: EntryStore,
}

impl LakeService {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            executor: RequestExecutor::new(ctx.clone()),
            store: EntryStore::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    // ========== Lake requests ==========

    #[instrument(skip_all)]
    pub async fn submit_lake_request(&self, body: LakeRequestBody) -> Result<LakeRequestSubmitted> {
        body.validate_standalone()?;
        self.executor.submit(body).await
    }

    pub async fn describe_lake_request(&self, lake_request_id: Uuid) -> Result<LakeRequestDescription> {
        let request = self
            .ctx
            .repos
            .lake_requests
            .get(lake_request_id)
            .await?
            .ok_or_else(|| Error::NotFound("lake request not found".into()))?;
        let response_body = match request.response_entry_id {
            Some(id) => self.ctx.repos.entries.get(id).await?.map(|e| e.content),
            None => None,
        };
        Ok(LakeRequestDescription {
            lake_request_id: request.lake_request_id,
            job_id: request.job_id,
            job_type: request.job_type,
            request_status: request.request_status,
            stage: request.stage,
            response_entry_id: request.response_entry_id,
            response_body,
            response_sources: request.response_sources,
            remaining_lookups: request.remaining_lookups,
        })
    }

    // ========== Chains ==========

    #[instrument(skip_all, fields(steps = submission.chain.len()))]
    pub async fn submit_chain_request(&self, submission: ChainSubmission) -> Result<ChainSubmitted> {
        let analysis = validate_chain(&submission.chain, PlaceholderPolicy::Forbidden)?;
        let chain = launch_chain(&self.ctx, submission.chain, None, None).await?;
        info!(
            chain_request_id = %chain.chain_request_id,
            warnings = analysis.warnings.len(),
            "Chain submitted"
        );
        Ok(ChainSubmitted {
            chain_request_id: chain.chain_request_id,
            job_id: chain.job_id,
            job_type: chain.job_type,
        })
    }

    pub async fn describe_chain_request(&self, chain_request_id: Uuid) -> Result<ChainDescription> {
        self.ctx
            .repos
            .chains
            .get(chain_request_id)
            .await?
            .map(|c| c.describe())
            .ok_or_else(|| Error::NotFound("chain request not found".into()))
    }

    pub async fn describe_job(&self, job_type: JobType, job_id: Uuid) -> Result<Job> {
        self.ctx
            .repos
            .jobs
            .get(job_type, job_id)
            .await?
            .ok_or_else(|| Error::NotFound("job not found".into()))
    }

    // ========== Archives ==========

    /// Store the archive as CREATING, then promote it to ACTIVE.
    #[instrument(skip_all, fields(archive_id = %request.archive_id))]
    pub async fn create_archive(&self, request: CreateArchiveRequest) -> Result<Archive> {
        request.validate()?;
        let archive = request.into_archive();
        let archive_id = archive.archive_id.clone();
        self.ctx.repos.archives.create(&archive).await?;
        self.ctx
            .repos
            .archives
            .transition_status(&archive_id, ArchiveStatus::Creating, ArchiveStatus::Active)
            .await?;
        info!(storage_type = %archive.storage_type, "Archive created");
        self.ctx.repos.archives.require(&archive_id).await
    }

    pub async fn describe_archive(&self, archive_id: &str) -> Result<Archive> {
        self.ctx
            .repos
            .archives
            .get(archive_id)
            .await?
            .ok_or_else(|| Error::NotFound("archive not found".into()))
    }

    /// Mark the archive DELETING. Refused while any maintenance holder is
    /// present.
    #[instrument(skip(self))]
    pub async fn delete_archive(&self, archive_id: &str) -> Result<Archive> {
        let archive = self.describe_archive(archive_id).await?;
        if archive.status == ArchiveStatus::Deleting {
            return Ok(archive);
        }
        if !self
            .ctx
            .repos
            .archives
            .transition_status(archive_id, ArchiveStatus::Active, ArchiveStatus::Deleting)
            .await?
        {
            let current = self.ctx.repos.archives.require(archive_id).await?;
            return Err(Error::ArchiveBusy {
                archive_id: archive_id.to_string(),
                status: current.status,
            });
        }
        info!("Archive marked for deletion");
        self.ctx.repos.archives.require(archive_id).await
    }

    /// Queue a vacuum of superseded originals.
    pub async fn vacuum_archive(&self, archive_id: &str) -> Result<Job> {
        self.describe_archive(archive_id).await?;
        let job = Job::new(JobType::ArchiveVacuum);
        self.ctx.repos.jobs.create(&job).await?;
        self.ctx
            .publish(LakeEvent::ArchiveVacuum {
                archive_id: archive_id.to_string(),
                job_id: job.job_id,
            })
            .await?;
        Ok(job)
    }

    /// Queue a rebuild of a VECTOR archive's index.
    pub async fn reindex_archive(&self, archive_id: &str) -> Result<Job> {
        let archive = self.describe_archive(archive_id).await?;
        if !archive.is_vector() {
            return Err(Error::Validation(format!(
                "archive {} has storage type {}; only VECTOR archives can be reindexed",
                archive_id, archive.storage_type
            )));
        }
        let job = Job::new(JobType::ArchiveReindex);
        self.ctx.repos.jobs.create(&job).await?;
        self.ctx
            .publish(LakeEvent::ArchiveReindex {
                archive_id: archive_id.to_string(),
                job_id: job.job_id,
            })
            .await?;
        Ok(job)
    }

    // ========== Entries and sources ==========

    pub async fn add_entry(&self, request: AddEntryRequest) -> Result<Entry> {
        if request.entry.content.trim().is_empty() {
            return Err(Error::Validation("entry content is required".into()));
        }
        if let Some(archive_id) = &request.archive_id {
            self.describe_archive(archive_id)
                .await?
                .check(ArchiveOperation::Write)?;
        }
        self.store
            .add_to(request.entry, request.archive_id.as_deref())
            .await
    }

    pub async fn get_entry(&self, entry_id: Uuid) -> Result<Entry> {
        self.ctx
            .repos
            .entries
            .get(entry_id)
            .await?
            .ok_or_else(|| Error::NotFound("entry not found".into()))
    }

    /// Insert or replace a source. A latest content entry must exist.
    pub async fn put_source(&self, source: Source) -> Result<Source> {
        if source.source_type.trim().is_empty() || source.source_id.trim().is_empty() {
            return Err(Error::Validation(
                "source_type and source_id are required".into(),
            ));
        }
        if let Some(entry_id) = source.latest_content_entry_id {
            self.get_entry(entry_id).await?;
        }
        self.ctx.repos.sources.put(&source).await?;
        Ok(source)
    }

    // ========== Background processing ==========

    /// A worker with every engine handler registered.
    pub async fn worker(&self, config: WorkerConfig) -> EventWorker {
        WorkerBuilder::new(self.ctx.repos.clone())
            .with_config(config)
            .with_handler(self.executor.clone())
            .with_handler(ChainOrchestrator::new(
                self.ctx.clone(),
                self.executor.clone(),
            ))
            .with_handler(MaintenanceHandler::new(self.ctx.clone()))
            .build()
            .await
    }

    pub fn sweep(&self, config: SweepConfig) -> LookupTimeoutSweep {
        LookupTimeoutSweep::new(self.ctx.clone(), config)
    }
}
