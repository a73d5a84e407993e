//! Lookup fan-in.
//!
//! Every lookup reports exactly once through [`LookupCoordinator::report`].
//! The countdown lives in storage and is decremented atomically, so the
//! report that reaches zero is the only one that publishes the processing
//! event, however the reports interleave.

use omnilake_core::{LakeEvent, LakeRequestStage, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::EngineContext;

/// What a lookup report did to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupReport {
    /// Lookups still outstanding.
    Remaining(i32),
    /// This report finished the countdown and triggered processing.
    Completed,
    /// The request was no longer awaiting lookups.
    Ignored,
}

#[derive(Clone)]
pub struct LookupCoordinator {
    ctx: EngineContext,
}

impl LookupCoordinator {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Record one lookup's results.
    pub async fn report(&self, lake_request_id: Uuid, entry_ids: &[Uuid]) -> Result<LookupReport> {
        let remaining = self
            .ctx
            .repos
            .lake_requests
            .add_lookup_results(lake_request_id, entry_ids)
            .await?;

        match remaining {
            None => {
                warn!(
                    %lake_request_id,
                    "Lookup reported after the countdown finished; ignoring"
                );
                Ok(LookupReport::Ignored)
            }
            Some(0) => {
                info!(%lake_request_id, "All lookups reported");
                self.trigger_processing(lake_request_id).await?;
                Ok(LookupReport::Completed)
            }
            Some(n) => {
                debug!(
                    %lake_request_id,
                    remaining_lookups = n,
                    "Lookup reported"
                );
                Ok(LookupReport::Remaining(n))
            }
        }
    }

    /// Zero an outstanding countdown and trigger processing with whatever
    /// was gathered. Only the caller that changed the countdown triggers.
    pub async fn force_complete(&self, lake_request_id: Uuid) -> Result<bool> {
        if !self
            .ctx
            .repos
            .lake_requests
            .force_complete_lookups(lake_request_id)
            .await?
        {
            return Ok(false);
        }
        warn!(%lake_request_id, "Lookups force-completed");
        self.trigger_processing(lake_request_id).await?;
        Ok(true)
    }

    /// Re-publish processing for a request still in LOOKUP whose countdown
    /// already reached zero. Returns false if the request has moved on.
    pub async fn resume(&self, lake_request_id: Uuid) -> Result<bool> {
        let Some(request) = self.ctx.repos.lake_requests.get(lake_request_id).await? else {
            return Ok(false);
        };
        if request.stage != LakeRequestStage::Lookup || request.remaining_lookups > 0 {
            return Ok(false);
        }
        warn!(%lake_request_id, "Countdown finished without processing; republishing");
        self.trigger_processing(lake_request_id).await?;
        Ok(true)
    }

    /// Publish processing for a request whose countdown is zero.
    pub(crate) async fn trigger_processing(&self, lake_request_id: Uuid) -> Result<()> {
        self.ctx
            .publish(LakeEvent::LakeRequestProcess { lake_request_id })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use omnilake_core::{
        Job, JobType, LakeEventType, LakeRequest, LakeRequestBody, LookupInstruction,
        ProcessingInstructions,
    };
    use omnilake_db::memory;
    use omnilake_inference::MockInferenceBackend;

    fn context() -> EngineContext {
        let backend = Arc::new(MockInferenceBackend::new());
        EngineContext::new(memory::repositories(), backend.clone(), backend)
    }

    async fn request_with_lookups(ctx: &EngineContext, n: usize) -> LakeRequest {
        let mut body = LakeRequestBody::new(ProcessingInstructions::summarize("g"));
        for i in 0..n {
            body = body.with_lookup(LookupInstruction::Basic {
                archive_id: format!("a{}", i),
                max_entries: None,
                prioritize_tags: Vec::new(),
            });
        }
        let job = Job::new(JobType::LakeRequest);
        let request = LakeRequest::new(body, &job, None);
        ctx.repos.lake_requests.create(&request).await.unwrap();
        request
    }

    async fn process_events(ctx: &EngineContext) -> usize {
        let mut count = 0;
        while let Some(e) = ctx
            .repos
            .events
            .claim_next(&[LakeEventType::LakeRequestProcess])
            .await
            .unwrap()
        {
            ctx.repos.events.complete(e.event_id).await.unwrap();
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_last_report_triggers_once() {
        let ctx = context();
        let request = request_with_lookups(&ctx, 3).await;
        let coordinator = LookupCoordinator::new(ctx.clone());
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        assert_eq!(
            coordinator.report(request.lake_request_id, &[a]).await.unwrap(),
            LookupReport::Remaining(2)
        );
        assert_eq!(
            coordinator.report(request.lake_request_id, &[]).await.unwrap(),
            LookupReport::Remaining(1)
        );
        assert_eq!(
            coordinator.report(request.lake_request_id, &[b, a]).await.unwrap(),
            LookupReport::Completed
        );
        assert_eq!(
            coordinator.report(request.lake_request_id, &[b]).await.unwrap(),
            LookupReport::Ignored
        );

        assert_eq!(process_events(&ctx).await, 1);
        let stored = ctx.repos.lake_requests.require(request.lake_request_id).await.unwrap();
        assert_eq!(stored.response_sources, vec![a, b]);
        assert_eq!(stored.remaining_lookups, 0);
    }

    #[tokio::test]
    async fn test_concurrent_reports_trigger_exactly_once() {
        let ctx = context();
        let request = request_with_lookups(&ctx, 16).await;
        let coordinator = LookupCoordinator::new(ctx.clone());

        let reports = (0..16).map(|_| {
            let coordinator = coordinator.clone();
            let id = request.lake_request_id;
            tokio::spawn(async move { coordinator.report(id, &[Uuid::now_v7()]).await })
        });
        let outcomes = futures::future::join_all(reports).await;
        let completed = outcomes
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .filter(|r| *r == LookupReport::Completed)
            .count();

        assert_eq!(completed, 1);
        assert_eq!(process_events(&ctx).await, 1);
    }

    #[tokio::test]
    async fn test_force_complete_wins_once() {
        let ctx = context();
        let request = request_with_lookups(&ctx, 2).await;
        let coordinator = LookupCoordinator::new(ctx.clone());
        coordinator
            .report(request.lake_request_id, &[Uuid::now_v7()])
            .await
            .unwrap();

        assert!(coordinator.force_complete(request.lake_request_id).await.unwrap());
        assert!(!coordinator.force_complete(request.lake_request_id).await.unwrap());
        assert_eq!(
            coordinator.report(request.lake_request_id, &[]).await.unwrap(),
            LookupReport::Ignored
        );
        assert_eq!(process_events(&ctx).await, 1);
    }

    #[tokio::test]
    async fn test_resume_republishes_only_a_finished_countdown() {
        let ctx = context();
        let request = request_with_lookups(&ctx, 1).await;
        let coordinator = LookupCoordinator::new(ctx.clone());

        assert!(!coordinator.resume(request.lake_request_id).await.unwrap());

        // Countdown reaches zero without the processing event going out.
        ctx.repos
            .lake_requests
            .add_lookup_results(request.lake_request_id, &[Uuid::now_v7()])
            .await
            .unwrap();
        assert_eq!(process_events(&ctx).await, 0);

        assert!(coordinator.resume(request.lake_request_id).await.unwrap());
        assert_eq!(process_events(&ctx).await, 1);

        ctx.repos
            .lake_requests
            .transition_stage(
                request.lake_request_id,
                LakeRequestStage::Lookup,
                LakeRequestStage::Processing,
            )
            .await
            .unwrap();
        assert!(!coordinator.resume(request.lake_request_id).await.unwrap());
        assert!(!coordinator.resume(Uuid::now_v7()).await.unwrap());
    }
}
