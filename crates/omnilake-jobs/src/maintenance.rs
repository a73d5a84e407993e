//! Archive maintenance: the reference-counted lock and the background jobs
//! that run under it.
//!
//! A holder token is the holding job's `JOB_TYPE/job_id`. The archive is in
//! MAINTENANCE while any token is present; the repository adds and removes
//! tokens with single conditional updates, so concurrent holders never lose
//! each other's tokens.

use std::future::Future;

use async_trait::async_trait;
use omnilake_core::{
    Error, FailurePropagation, JobKey, JobType, LakeEvent, LakeEventType, MaintenanceOutcome,
    Result,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::handler::{EventContext, EventHandler, HandlerResult};
use crate::storage::EntryStore;

#[derive(Clone)]
pub struct MaintenanceLock {
    ctx: EngineContext,
}

impl MaintenanceLock {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Add `holder` to the archive's holders. A token already present is a
    /// no-op. Fails with `ArchiveBusy` while the archive is CREATING or
    /// DELETING.
    pub async fn begin(&self, archive_id: &str, holder: JobKey) -> Result<MaintenanceOutcome> {
        let outcome = self
            .ctx
            .repos
            .archives
            .begin_maintenance(archive_id, &holder.to_string())
            .await?;
        if outcome.was_applied() {
            info!(
                %archive_id,
                %holder,
                holders = outcome.archive().status_context_job_ids.len(),
                "Maintenance begun"
            );
        } else {
            debug!(%archive_id, %holder, "Holder already present");
        }
        Ok(outcome)
    }

    /// Remove `holder`; the last holder out returns the archive to ACTIVE.
    pub async fn end(&self, archive_id: &str, holder: JobKey) -> Result<MaintenanceOutcome> {
        let outcome = self
            .ctx
            .repos
            .archives
            .end_maintenance(archive_id, &holder.to_string())
            .await?;
        if outcome.was_applied() {
            info!(
                %archive_id,
                %holder,
                status = %outcome.archive().status,
                "Maintenance ended"
            );
        } else {
            debug!(%archive_id, %holder, "Holder was not present");
        }
        Ok(outcome)
    }

    /// Run `work` holding the archive. The hold is released whatever the
    /// work's outcome; the work's error wins over a release error.
    pub async fn hold<T, F>(&self, archive_id: &str, holder: JobKey, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.begin(archive_id, holder).await?;
        let result = work.await;
        let released = self.end(archive_id, holder).await;
        match (result, released) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), released) => {
                if let Err(release_error) = released {
                    warn!(%archive_id, %holder, error = %release_error, "Failed to release maintenance hold");
                }
                Err(e)
            }
        }
    }
}

/// Handles maintenance events and the VACUUM and REINDEX jobs.
#[derive(Clone)]
pub struct MaintenanceHandler {
    ctx: EngineContext,
    lock: MaintenanceLock,
    store: EntryStore,
}

impl MaintenanceHandler {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            lock: MaintenanceLock::new(ctx.clone()),
            store: EntryStore::new(ctx.clone()),
            ctx,
        }
    }

    /// Run an archive job under the lock and record its outcome. A busy
    /// archive is retried while deliveries remain and fails the job after.
    #[instrument(skip(self))]
    async fn run_job(
        &self,
        job_type: JobType,
        archive_id: &str,
        job_id: Uuid,
        may_retry: bool,
    ) -> Result<()> {
        let key = JobKey::new(job_type, job_id);
        let Some(job) = self.ctx.repos.jobs.get(job_type, job_id).await? else {
            warn!("Maintenance job not found; ignoring");
            return Ok(());
        };
        if job.status.is_terminal() {
            debug!(status = %job.status, "Maintenance job already finished");
            return Ok(());
        }
        self.ctx.repos.jobs.mark_in_progress(key).await?;

        let outcome = match job_type {
            JobType::ArchiveVacuum => {
                self.lock.hold(archive_id, key, self.vacuum(archive_id)).await
            }
            JobType::ArchiveReindex => {
                self.lock.hold(archive_id, key, self.reindex(archive_id)).await
            }
            other => Err(Error::Internal(format!("{} is not a maintenance job", other))),
        };

        match outcome {
            Ok(message) => {
                info!(%archive_id, %message, "Maintenance job completed");
                self.ctx.repos.jobs.complete(key, Some(&message)).await?;
                Ok(())
            }
            Err(e) if e.is_retryable() && may_retry => Err(e),
            Err(e) => {
                self.ctx
                    .repos
                    .jobs
                    .fail(key, &e.to_string(), FailurePropagation::Ancestors)
                    .await?;
                Ok(())
            }
        }
    }

    async fn vacuum(&self, archive_id: &str) -> Result<String> {
        let archive = self.ctx.repos.archives.require(archive_id).await?;
        if !archive.retain_latest_originals_only {
            return Ok("archive keeps every original; nothing to remove".to_string());
        }
        let superseded = self
            .ctx
            .repos
            .entries
            .superseded_originals(archive_id)
            .await?;
        if superseded.is_empty() {
            return Ok("removed 0 entries".to_string());
        }
        let removed = self
            .ctx
            .repos
            .entries
            .remove_from_archive(archive_id, &superseded)
            .await?;
        self.ctx.repos.vectors.remove(archive_id, &superseded).await?;
        Ok(format!("removed {} entries", removed))
    }

    async fn reindex(&self, archive_id: &str) -> Result<String> {
        let archive = self.ctx.repos.archives.require(archive_id).await?;
        if !archive.is_vector() {
            return Err(Error::Processing(format!(
                "archive {} has storage type {} and no vector index",
                archive_id, archive.storage_type
            )));
        }
        let ids = self.ctx.repos.entries.archive_entry_ids(archive_id).await?;
        let entries = self.ctx.repos.entries.get_many(&ids).await?;
        let embedded = self.store.embed_into(archive_id, &entries).await?;
        Ok(format!("reindexed {} entries", embedded))
    }
}

#[async_trait]
impl EventHandler for MaintenanceHandler {
    fn event_types(&self) -> Vec<LakeEventType> {
        vec![
            LakeEventType::MaintenanceBegin,
            LakeEventType::MaintenanceEnd,
            LakeEventType::ArchiveVacuum,
            LakeEventType::ArchiveReindex,
        ]
    }

    async fn handle(&self, ctx: EventContext) -> HandlerResult {
        let may_retry = ctx.can_retry();
        let result = match ctx.event().clone() {
            LakeEvent::MaintenanceBegin { archive_id, holder } => {
                self.lock.begin(&archive_id, holder).await.map(|_| ())
            }
            LakeEvent::MaintenanceEnd { archive_id, holder } => {
                self.lock.end(&archive_id, holder).await.map(|_| ())
            }
            LakeEvent::ArchiveVacuum { archive_id, job_id } => {
                self.run_job(JobType::ArchiveVacuum, &archive_id, job_id, may_retry)
                    .await
            }
            LakeEvent::ArchiveReindex { archive_id, job_id } => {
                self.run_job(JobType::ArchiveReindex, &archive_id, job_id, may_retry)
                    .await
            }
            other => Err(Error::Internal(format!(
                "maintenance handler cannot handle {}",
                other.event_type()
            ))),
        };
        HandlerResult::from_result(result, &ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use omnilake_core::{ArchiveStatus, Job};
    use omnilake_db::{memory, test_fixtures};
    use omnilake_inference::MockInferenceBackend;

    async fn context_with(archive_id: &str) -> EngineContext {
        let backend = Arc::new(MockInferenceBackend::new());
        let ctx = EngineContext::new(memory::repositories(), backend.clone(), backend);
        ctx.repos
            .archives
            .create(&test_fixtures::active_archive(archive_id))
            .await
            .unwrap();
        ctx
    }

    fn holder(job_type: JobType) -> JobKey {
        Job::new(job_type).key()
    }

    #[tokio::test]
    async fn test_begin_then_end_restores_active() {
        let ctx = context_with("docs").await;
        let lock = MaintenanceLock::new(ctx.clone());
        let h = holder(JobType::ArchiveReindex);

        let begun = lock.begin("docs", h).await.unwrap();
        assert!(begun.was_applied());
        assert_eq!(begun.archive().status, ArchiveStatus::Maintenance);
        assert_eq!(begun.archive().status_context_job_ids, vec![h.to_string()]);

        let ended = lock.end("docs", h).await.unwrap();
        assert_eq!(ended.archive().status, ArchiveStatus::Active);
        assert!(ended.archive().status_context_job_ids.is_empty());
    }

    #[tokio::test]
    async fn test_two_holders_release_independently() {
        let ctx = context_with("docs").await;
        let lock = MaintenanceLock::new(ctx.clone());
        let a = holder(JobType::ArchiveReindex);
        let b = holder(JobType::ArchiveVacuum);

        lock.begin("docs", a).await.unwrap();
        lock.begin("docs", b).await.unwrap();
        let after_a = lock.end("docs", a).await.unwrap();
        assert_eq!(after_a.archive().status, ArchiveStatus::Maintenance);

        let after_b = lock.end("docs", b).await.unwrap();
        assert_eq!(after_b.archive().status, ArchiveStatus::Active);
    }

    #[tokio::test]
    async fn test_redundant_begin_is_noop() {
        let ctx = context_with("docs").await;
        let lock = MaintenanceLock::new(ctx.clone());
        let h = holder(JobType::ArchiveVacuum);

        lock.begin("docs", h).await.unwrap();
        let again = lock.begin("docs", h).await.unwrap();
        assert!(!again.was_applied());
        assert_eq!(again.archive().status_context_job_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_hold_releases_after_failed_work() {
        let ctx = context_with("docs").await;
        let lock = MaintenanceLock::new(ctx.clone());
        let h = holder(JobType::ArchiveReindex);

        let result: Result<()> = lock
            .hold("docs", h, async { Err(Error::Processing("boom".into())) })
            .await;
        assert!(matches!(result, Err(Error::Processing(_))));

        let archive = ctx.repos.archives.require("docs").await.unwrap();
        assert_eq!(archive.status, ArchiveStatus::Active);
    }

    #[tokio::test]
    async fn test_begin_on_deleting_archive_is_busy() {
        let ctx = context_with("docs").await;
        ctx.repos
            .archives
            .transition_status("docs", ArchiveStatus::Active, ArchiveStatus::Deleting)
            .await
            .unwrap();
        let lock = MaintenanceLock::new(ctx);

        let err = lock
            .begin("docs", holder(JobType::ArchiveVacuum))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
