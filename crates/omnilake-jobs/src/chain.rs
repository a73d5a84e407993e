//! Chain orchestration.
//!
//! A chain is an explicit state machine stored in a [`ChainRequest`]. The
//! orchestrator advances it one event at a time: `ChainStart` runs the
//! first eligible step, each `ChainStepCompleted` settles the running step
//! (including its validation gate) and runs the next, and `ChainFinished`
//! notifies an inception parent if one is waiting. Saves use the record's
//! version, so a redelivered event that lost the race does nothing.

use async_trait::async_trait;
use chrono::Utc;
use omnilake_core::defaults::VALIDATION_MAX_TOKENS;
use omnilake_core::{
    ChainCallback, ChainRequest, ChainStatus, Error, FailurePropagation, GenerationOptions, Job,
    JobKey, JobStatus, JobType, LakeChainStep, LakeEvent, LakeEventType, LakeRequest, Result,
    StepState, StepValidation, ValidationDirective,
};
use omnilake_inference::parse_judgment;
use omnilake_inference::prompts::judge_prompt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::executor::RequestExecutor;
use crate::handler::{EventContext, EventHandler, HandlerResult};
use crate::ledger::ExecutionOptions;
use crate::processors::InceptionProcessor;
use crate::references::{ReferenceResolver, Resolution};

/// Create a chain and its LAKE_CHAIN_REQUEST job, then queue its start.
pub async fn launch_chain(
    ctx: &EngineContext,
    steps: Vec<LakeChainStep>,
    parent: Option<JobKey>,
    callback: Option<ChainCallback>,
) -> Result<ChainRequest> {
    let mut job = Job::new(JobType::LakeChainRequest);
    if let Some(parent) = parent {
        job = job.with_parent(parent);
    }
    ctx.repos.jobs.create(&job).await?;

    let mut chain = ChainRequest::new(steps, &job);
    if let Some(callback) = callback {
        chain = chain.with_callback(callback);
    }
    ctx.repos.chains.create(&chain).await?;
    info!(
        chain_request_id = %chain.chain_request_id,
        job_id = %job.job_id,
        steps = chain.steps.len(),
        "Chain created"
    );

    ctx.publish(LakeEvent::ChainStart {
        chain_request_id: chain.chain_request_id,
    })
    .await?;
    Ok(chain)
}

#[derive(Clone)]
pub struct ChainOrchestrator {
    ctx: EngineContext,
    resolver: ReferenceResolver,
    executor: RequestExecutor,
    inception: InceptionProcessor,
}

impl ChainOrchestrator {
    pub fn new(ctx: EngineContext, executor: RequestExecutor) -> Self {
        Self {
            resolver: ReferenceResolver::new(ctx.clone()),
            inception: InceptionProcessor::new(ctx.clone()),
            executor,
            ctx,
        }
    }

    /// Persist the chain; on success the local copy takes the new version.
    async fn save(&self, chain: &mut ChainRequest) -> Result<bool> {
        if !self.ctx.repos.chains.save(chain).await? {
            debug!(
                chain_request_id = %chain.chain_request_id,
                version = chain.version,
                "Chain changed concurrently; dropping this update"
            );
            return Ok(false);
        }
        chain.version += 1;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn start(&self, chain_request_id: Uuid) -> Result<()> {
        let mut chain = self.ctx.repos.chains.require(chain_request_id).await?;
        if chain.chain_status != ChainStatus::Pending {
            debug!(status = %chain.chain_status, "Chain already started");
            return Ok(());
        }
        self.ctx.repos.jobs.mark_in_progress(chain.job_key()).await?;
        chain.chain_status = ChainStatus::Executing;
        if !self.save(&mut chain).await? {
            return Ok(());
        }
        info!(steps = chain.steps.len(), "Chain executing");
        self.advance(chain).await
    }

    /// Run the first eligible step at or after the cursor, skipping steps
    /// that are not activated or cannot be resolved. Finishes the chain when
    /// the cursor runs past the last step.
    async fn advance(&self, mut chain: ChainRequest) -> Result<()> {
        loop {
            let index = chain.cursor;
            let Some(step) = chain.steps.get(index).cloned() else {
                return self.finish(chain, ChainStatus::Completed, None).await;
            };

            if step.conditional && !chain.activated.contains(&step.name) {
                info!(step_name = %step.name, "Skipping conditional step that was not activated");
                chain.step_states[index] = StepState::Skipped;
                chain.cursor += 1;
                continue;
            }

            let body = match self.resolver.resolve(&chain, &step.lake_request).await {
                Ok(Resolution::Resolved(body)) => body,
                Ok(Resolution::Unresolvable { reference, reason }) => {
                    info!(step_name = %step.name, %reference, %reason, "Skipping step with unresolvable reference");
                    chain.step_states[index] = StepState::Skipped;
                    chain.cursor += 1;
                    continue;
                }
                Err(e) => {
                    chain.step_states[index] = StepState::Failed;
                    let reason = format!("step '{}' failed: {}", step.name, e);
                    return self.finish(chain, ChainStatus::Failed, Some(reason)).await;
                }
            };

            let request = self
                .executor
                .create_request(body, Some(chain.chain_request_id), Some(chain.job_key()))
                .await?;
            chain
                .executed_requests
                .insert(step.name.clone(), request.lake_request_id);
            chain.awaiting_lake_request_id = Some(request.lake_request_id);
            chain.step_states[index] = StepState::Running;
            if !self.save(&mut chain).await? {
                return Ok(());
            }
            info!(
                step_name = %step.name,
                lake_request_id = %request.lake_request_id,
                "Chain step submitted"
            );
            return self.executor.start_request(request.lake_request_id).await;
        }
    }

    #[instrument(skip(self))]
    async fn step_completed(&self, chain_request_id: Uuid, lake_request_id: Uuid) -> Result<()> {
        let mut chain = self.ctx.repos.chains.require(chain_request_id).await?;
        if chain.is_terminal() || chain.awaiting_lake_request_id != Some(lake_request_id) {
            debug!("Step completion does not match the running step; ignoring");
            return Ok(());
        }
        let index = chain.cursor;
        let Some(step) = chain.steps.get(index).cloned() else {
            return Err(Error::Internal(format!(
                "chain {} cursor {} is past its steps",
                chain_request_id, index
            )));
        };
        let request = self.ctx.repos.lake_requests.require(lake_request_id).await?;

        if request.request_status != JobStatus::Completed {
            chain.step_states[index] = StepState::Failed;
            let cause = self
                .ctx
                .repos
                .jobs
                .get(request.job_type, request.job_id)
                .await?
                .and_then(|j| j.status_message)
                .unwrap_or_else(|| "lake request failed".to_string());
            let reason = format!("step '{}' failed: {}", step.name, cause);
            return self.finish(chain, ChainStatus::Failed, Some(reason)).await;
        }
        chain.step_states[index] = StepState::Completed;
        chain.cursor += 1;
        chain.awaiting_lake_request_id = None;

        if let Some(validation) = &step.validation {
            if validation.is_noop() {
                info!(step_name = %step.name, "Validation block has no directives; not judged");
            } else {
                match self.judge(&chain, validation, &request).await {
                    Ok(success) => {
                        info!(step_name = %step.name, success, "Step validated");
                        match validation.directive_for(success) {
                            Some(ValidationDirective::TerminateChain) => {
                                let reason =
                                    format!("terminated by validation of step '{}'", step.name);
                                return self
                                    .finish(chain, ChainStatus::Terminated, Some(reason))
                                    .await;
                            }
                            Some(ValidationDirective::ExecuteChainStep(target)) => {
                                debug!(step_name = %step.name, %target, "Activating step");
                                chain.activated.insert(target.clone());
                            }
                            None => {}
                        }
                    }
                    Err(e) => {
                        chain.step_states[index] = StepState::Failed;
                        let reason = format!("validation of step '{}' failed: {}", step.name, e);
                        return self.finish(chain, ChainStatus::Failed, Some(reason)).await;
                    }
                }
            }
        }

        self.advance(chain).await
    }

    /// Judge a step's response under a CHAIN_REQUEST_VALIDATION job.
    async fn judge(
        &self,
        chain: &ChainRequest,
        validation: &StepValidation,
        request: &LakeRequest,
    ) -> Result<bool> {
        let job = self
            .ctx
            .repos
            .jobs
            .create_child(chain.job_key(), JobType::ChainRequestValidation)
            .await?;
        let content = match request.response_entry_id {
            Some(id) => self.ctx.repos.entries.require(id).await?.content,
            None => String::new(),
        };

        let work = async {
            let options = GenerationOptions::default()
                .with_model(validation.model_id.as_deref())
                .with_max_tokens(VALIDATION_MAX_TOKENS);
            let answer = self
                .ctx
                .generation
                .generate_with_options(&judge_prompt(&validation.prompt, &content), &options)
                .await?;
            Ok(parse_judgment(&answer)?.is_success())
        };
        self.ctx
            .ledger()
            .execute(
                job.key(),
                ExecutionOptions::default().with_propagation(FailurePropagation::Suppressed),
                work,
            )
            .await
    }

    async fn finish(
        &self,
        mut chain: ChainRequest,
        status: ChainStatus,
        reason: Option<String>,
    ) -> Result<()> {
        chain.chain_status = status;
        chain.failure_reason = reason.clone();
        chain.awaiting_lake_request_id = None;
        chain.ended = Some(Utc::now());
        if !self.save(&mut chain).await? {
            return Ok(());
        }

        let job = chain.job_key();
        match status {
            ChainStatus::Failed => {
                let message = reason.as_deref().unwrap_or("chain failed");
                warn!(chain_request_id = %chain.chain_request_id, reason = %message, "Chain failed");
                self.ctx
                    .repos
                    .jobs
                    .fail(job, message, FailurePropagation::Ancestors)
                    .await?;
            }
            _ => {
                info!(
                    chain_request_id = %chain.chain_request_id,
                    status = %status,
                    executed = chain.executed_requests.len(),
                    "Chain finished"
                );
                self.ctx.repos.jobs.complete(job, reason.as_deref()).await?;
            }
        }

        self.ctx
            .publish(LakeEvent::ChainFinished {
                chain_request_id: chain.chain_request_id,
            })
            .await?;
        Ok(())
    }

    async fn chain_finished(&self, chain_request_id: Uuid) -> Result<()> {
        let chain = self.ctx.repos.chains.require(chain_request_id).await?;
        match chain.callback {
            Some(callback) => self.inception.on_chain_finished(&chain, callback).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EventHandler for ChainOrchestrator {
    fn event_types(&self) -> Vec<LakeEventType> {
        vec![
            LakeEventType::ChainStart,
            LakeEventType::ChainStepCompleted,
            LakeEventType::ChainFinished,
        ]
    }

    async fn handle(&self, ctx: EventContext) -> HandlerResult {
        let result = match ctx.event().clone() {
            LakeEvent::ChainStart { chain_request_id } => self.start(chain_request_id).await,
            LakeEvent::ChainStepCompleted {
                chain_request_id,
                lake_request_id,
            } => self.step_completed(chain_request_id, lake_request_id).await,
            LakeEvent::ChainFinished { chain_request_id } => {
                self.chain_finished(chain_request_id).await
            }
            other => Err(Error::Internal(format!(
                "chain orchestrator cannot handle {}",
                other.event_type()
            ))),
        };
        HandlerResult::from_result(result, &ctx)
    }
}
