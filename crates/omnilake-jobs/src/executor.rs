//! Lake request execution.
//!
//! A request moves LOOKUP -> PROCESSING -> RESPONDING -> CLOSED, one event
//! per stage. Every stage transition is a conditional update, so a
//! redelivered event finds the request already past its stage and does
//! nothing. Each unit of work runs under its own child job of the
//! request's LAKE_REQUEST job.

use async_trait::async_trait;
use omnilake_core::{
    ArchiveOperation, FailurePropagation, Job, JobKey, JobStatus, JobType, LakeEvent,
    LakeEventType, LakeRequest, LakeRequestBody, LakeRequestStage, LakeRequestSubmitted,
    ProcessingInstructions, Result,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::coordinator::LookupCoordinator;
use crate::handler::{EventContext, EventHandler, HandlerResult};
use crate::ledger::ExecutionOptions;
use crate::lookups::LookupRunner;
use crate::processors::{
    InceptionProcessor, KnowledgeGraphProcessor, ProcessingOutcome, Summarizer,
};
use crate::responders::Responder;

/// Close a request as FAILED, fail its job and ancestors, and announce the
/// closure. Does nothing if the request is already closed.
pub(crate) async fn fail_request(
    ctx: &EngineContext,
    request: &LakeRequest,
    message: &str,
) -> Result<()> {
    if !ctx
        .repos
        .lake_requests
        .close(request.lake_request_id, JobStatus::Failed)
        .await?
    {
        debug!(lake_request_id = %request.lake_request_id, "Request already closed");
        return Ok(());
    }
    warn!(lake_request_id = %request.lake_request_id, reason = %message, "Lake request failed");
    ctx.repos
        .jobs
        .fail(request.job_key(), message, FailurePropagation::Ancestors)
        .await?;
    ctx.publish(LakeEvent::LakeRequestCompleted {
        lake_request_id: request.lake_request_id,
    })
    .await?;
    Ok(())
}

/// Fail a request whose processing stopped partway, first failing any
/// child job the interrupted processor left open.
pub(crate) async fn fail_interrupted(
    ctx: &EngineContext,
    request: &LakeRequest,
    message: &str,
) -> Result<()> {
    for child in ctx.repos.jobs.list_children(request.job_key()).await? {
        if !child.status.is_terminal() {
            ctx.repos
                .jobs
                .fail(child.key(), message, FailurePropagation::Suppressed)
                .await?;
        }
    }
    fail_request(ctx, request, message).await
}

#[derive(Clone)]
pub struct RequestExecutor {
    ctx: EngineContext,
    coordinator: LookupCoordinator,
    lookups: LookupRunner,
    summarizer: Summarizer,
    knowledge_graph: KnowledgeGraphProcessor,
    inception: InceptionProcessor,
    responder: Responder,
}

impl RequestExecutor {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            coordinator: LookupCoordinator::new(ctx.clone()),
            lookups: LookupRunner::new(ctx.clone()),
            summarizer: Summarizer::new(ctx.clone()),
            knowledge_graph: KnowledgeGraphProcessor::new(ctx.clone()),
            inception: InceptionProcessor::new(ctx.clone()),
            responder: Responder::new(ctx.clone()),
            ctx,
        }
    }

    /// Replace the summarizer, e.g. to change its group size.
    pub fn with_summarizer(mut self, summarizer: Summarizer) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Store a request and its LAKE_REQUEST job without starting it.
    pub async fn create_request(
        &self,
        body: LakeRequestBody,
        chain_request_id: Option<Uuid>,
        parent: Option<JobKey>,
    ) -> Result<LakeRequest> {
        let mut job = Job::new(JobType::LakeRequest);
        if let Some(parent) = parent {
            job = job.with_parent(parent);
        }
        self.ctx.repos.jobs.create(&job).await?;
        let request = LakeRequest::new(body, &job, chain_request_id);
        self.ctx.repos.lake_requests.create(&request).await?;
        debug!(
            lake_request_id = %request.lake_request_id,
            job_id = %job.job_id,
            lookups = request.remaining_lookups,
            "Lake request stored"
        );
        Ok(request)
    }

    /// Queue the request's initialization.
    pub async fn start_request(&self, lake_request_id: Uuid) -> Result<()> {
        self.ctx
            .publish(LakeEvent::LakeRequestInit { lake_request_id })
            .await?;
        Ok(())
    }

    /// Store and start a standalone request.
    pub async fn submit(&self, body: LakeRequestBody) -> Result<LakeRequestSubmitted> {
        let request = self.create_request(body, None, None).await?;
        self.start_request(request.lake_request_id).await?;
        info!(lake_request_id = %request.lake_request_id, "Lake request submitted");
        Ok(LakeRequestSubmitted {
            lake_request_id: request.lake_request_id,
            job_id: request.job_id,
            job_type: request.job_type,
        })
    }

    #[instrument(skip(self))]
    async fn initialize(&self, lake_request_id: Uuid) -> Result<()> {
        let request = self.ctx.repos.lake_requests.require(lake_request_id).await?;
        if !self.ctx.repos.jobs.mark_in_progress(request.job_key()).await? {
            debug!("Request job already started");
            return Ok(());
        }
        self.ctx
            .repos
            .lake_requests
            .set_request_status(lake_request_id, JobStatus::InProgress)
            .await?;

        if request.lookup_instructions.is_empty() {
            debug!("No lookups; moving straight to processing");
            return self.coordinator.trigger_processing(lake_request_id).await;
        }
        info!(lookups = request.lookup_instructions.len(), "Fanning out lookups");
        for index in 0..request.lookup_instructions.len() {
            self.ctx
                .publish(LakeEvent::Lookup {
                    lake_request_id,
                    index,
                })
                .await?;
        }
        Ok(())
    }

    /// Run one lookup and report it. A failed lookup reports no entries;
    /// its failure stays on its own job.
    #[instrument(skip(self))]
    async fn lookup(&self, lake_request_id: Uuid, index: usize, may_retry: bool) -> Result<()> {
        let request = self.ctx.repos.lake_requests.require(lake_request_id).await?;
        if request.stage == LakeRequestStage::Lookup && request.remaining_lookups <= 0 {
            // The countdown finished but processing was never published.
            self.coordinator.resume(lake_request_id).await?;
            return Ok(());
        }
        if request.stage != LakeRequestStage::Lookup {
            debug!(stage = %request.stage, "Request no longer awaiting lookups");
            return Ok(());
        }
        let Some(instruction) = request.lookup_instructions.get(index) else {
            warn!("Lookup index out of range; reporting no entries");
            self.coordinator.report(lake_request_id, &[]).await?;
            return Ok(());
        };

        if may_retry {
            if let Some(archive_id) = instruction.archive_id() {
                if let Some(archive) = self.ctx.repos.archives.get(archive_id).await? {
                    archive.check(ArchiveOperation::Read)?;
                }
            }
        }

        let job = self
            .ctx
            .repos
            .jobs
            .create_child(request.job_key(), JobType::LakeLookup)
            .await?;
        let found = self
            .ctx
            .ledger()
            .execute(
                job.key(),
                ExecutionOptions::default().with_propagation(FailurePropagation::Suppressed),
                self.lookups.run(instruction),
            )
            .await
            .unwrap_or_else(|e| {
                warn!(kind = instruction.kind(), error = %e, "Lookup failed; reporting no entries");
                Vec::new()
            });

        self.coordinator.report(lake_request_id, &found).await?;
        Ok(())
    }

    /// Move the request into PROCESSING and run its processor. The stage
    /// change commits before the processor runs, so a redelivery that finds
    /// the request still in PROCESSING means an earlier attempt was cut
    /// short; the request is failed instead of waiting forever.
    #[instrument(skip(self))]
    async fn process(&self, lake_request_id: Uuid, attempt: i32) -> Result<()> {
        if !self
            .ctx
            .repos
            .lake_requests
            .transition_stage(
                lake_request_id,
                LakeRequestStage::Lookup,
                LakeRequestStage::Processing,
            )
            .await?
        {
            let request = self.ctx.repos.lake_requests.require(lake_request_id).await?;
            if attempt > 1
                && request.stage == LakeRequestStage::Processing
                && request.remaining_chains == 0
            {
                return fail_interrupted(
                    &self.ctx,
                    &request,
                    "Processing was interrupted before it finished",
                )
                .await;
            }
            debug!(stage = %request.stage, "Request already past lookup");
            return Ok(());
        }
        let request = self.ctx.repos.lake_requests.require(lake_request_id).await?;
        if request.response_sources.is_empty() {
            return fail_request(&self.ctx, &request, "Lookup returned no entries").await;
        }
        let entries = self
            .ctx
            .repos
            .entries
            .get_many(&request.response_sources)
            .await?;
        info!(
            processor_type = request.processing_instructions.kind(),
            entries = entries.len(),
            "Processing"
        );

        let ledger = self.ctx.ledger();
        let outcome = match &request.processing_instructions {
            ProcessingInstructions::Summarization(instructions) => {
                let job = self
                    .ctx
                    .repos
                    .jobs
                    .create_child(request.job_key(), JobType::LakeProcessorSummarizer)
                    .await?;
                ledger
                    .execute(
                        job.key(),
                        ExecutionOptions::default(),
                        self.summarizer.summarize(&entries, instructions),
                    )
                    .await
                    .map(ProcessingOutcome::Completed)
            }
            ProcessingInstructions::KnowledgeGraph(instructions) => {
                let job = self
                    .ctx
                    .repos
                    .jobs
                    .create_child(request.job_key(), JobType::LakeProcessorKnowledgeGraph)
                    .await?;
                ledger
                    .execute(
                        job.key(),
                        ExecutionOptions::default(),
                        self.knowledge_graph.process(&entries, instructions),
                    )
                    .await
                    .map(ProcessingOutcome::Completed)
            }
            ProcessingInstructions::Inception(instructions) => {
                let job = self
                    .ctx
                    .repos
                    .jobs
                    .create_child(request.job_key(), JobType::LakeProcessorChain)
                    .await?;
                ledger
                    .execute(
                        job.key(),
                        ExecutionOptions::default().skipping_completion(),
                        self.inception.start(&request, job.key(), instructions),
                    )
                    .await
                    .map(|()| ProcessingOutcome::Deferred)
            }
        };

        match outcome {
            Ok(ProcessingOutcome::Completed(output)) => {
                self.ctx
                    .publish(LakeEvent::LakeRequestRespond {
                        lake_request_id,
                        processed_entry_id: output.entry_id,
                    })
                    .await?;
                Ok(())
            }
            Ok(ProcessingOutcome::Deferred) => {
                debug!("Processing continues in sub-chains");
                Ok(())
            }
            Err(e) => fail_request(&self.ctx, &request, &e.to_string()).await,
        }
    }

    #[instrument(skip(self))]
    async fn respond(
        &self,
        lake_request_id: Uuid,
        processed_entry_id: Uuid,
        may_retry: bool,
    ) -> Result<()> {
        let request = self.ctx.repos.lake_requests.require(lake_request_id).await?;
        match request.stage {
            LakeRequestStage::Processing => {
                if !self
                    .ctx
                    .repos
                    .lake_requests
                    .transition_stage(
                        lake_request_id,
                        LakeRequestStage::Processing,
                        LakeRequestStage::Responding,
                    )
                    .await?
                {
                    return Ok(());
                }
            }
            // A redelivery after a busy destination.
            LakeRequestStage::Responding => {}
            stage => {
                debug!(%stage, "Request not awaiting a response");
                return Ok(());
            }
        }

        if may_retry {
            self.responder.check_destination(&request.response_config).await?;
        }

        let processed = self.ctx.repos.entries.require(processed_entry_id).await?;
        let job = self
            .ctx
            .repos
            .jobs
            .create_child(request.job_key(), JobType::LakeResponder)
            .await?;
        let response = self
            .ctx
            .ledger()
            .execute(
                job.key(),
                ExecutionOptions::default(),
                self.responder.respond(&request.response_config, &processed),
            )
            .await;

        match response {
            Ok(entry) => {
                self.ctx
                    .repos
                    .lake_requests
                    .set_response_entry(lake_request_id, entry.entry_id)
                    .await?;
                if !self
                    .ctx
                    .repos
                    .lake_requests
                    .close(lake_request_id, JobStatus::Completed)
                    .await?
                {
                    return Ok(());
                }
                self.ctx.repos.jobs.complete(request.job_key(), None).await?;
                info!(response_entry_id = %entry.entry_id, "Lake request completed");
                self.ctx
                    .publish(LakeEvent::LakeRequestCompleted { lake_request_id })
                    .await?;
                Ok(())
            }
            Err(e) => fail_request(&self.ctx, &request, &e.to_string()).await,
        }
    }

    async fn completed(&self, lake_request_id: Uuid) -> Result<()> {
        let request = self.ctx.repos.lake_requests.require(lake_request_id).await?;
        if let Some(chain_request_id) = request.chain_request_id {
            self.ctx
                .publish(LakeEvent::ChainStepCompleted {
                    chain_request_id,
                    lake_request_id,
                })
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for RequestExecutor {
    fn event_types(&self) -> Vec<LakeEventType> {
        vec![
            LakeEventType::LakeRequestInit,
            LakeEventType::Lookup,
            LakeEventType::LakeRequestProcess,
            LakeEventType::LakeRequestRespond,
            LakeEventType::LakeRequestCompleted,
        ]
    }

    async fn handle(&self, ctx: EventContext) -> HandlerResult {
        let may_retry = ctx.can_retry();
        let result = match ctx.event().clone() {
            LakeEvent::LakeRequestInit { lake_request_id } => self.initialize(lake_request_id).await,
            LakeEvent::Lookup {
                lake_request_id,
                index,
            } => self.lookup(lake_request_id, index, may_retry).await,
            LakeEvent::LakeRequestProcess { lake_request_id } => {
                self.process(lake_request_id, ctx.attempt()).await
            }
            LakeEvent::LakeRequestRespond {
                lake_request_id,
                processed_entry_id,
            } => {
                self.respond(lake_request_id, processed_entry_id, may_retry)
                    .await
            }
            LakeEvent::LakeRequestCompleted { lake_request_id } => {
                self.completed(lake_request_id).await
            }
            other => {
                return HandlerResult::Failed(format!(
                    "request executor cannot handle {}",
                    other.event_type()
                ))
            }
        };
        HandlerResult::from_result(result, &ctx)
    }
}
