//! INCEPTION processing: the request's sources are handed to sub-chains and
//! the exported step responses become the processed entry.
//!
//! Sub-chains report back through their [`ChainCallback`]. The request
//! counts outstanding sub-chains down the same way it counts lookups, so
//! only the last finisher moves the request on.

use omnilake_core::{
    CallbackPurpose, ChainCallback, ChainRequest, ChainStatus, Deferred, EntryDistributionMode,
    Error, FailurePropagation, InceptionInstructions, JobKey, JobType, LakeChainStep, LakeEvent,
    LakeRequest, LakeRequestBody, LookupInstruction, ProcessingInstructions, Result,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::chain::launch_chain;
use crate::context::EngineContext;
use crate::executor::fail_request;

/// Name of the single step of a join chain.
pub const JOIN_STEP_NAME: &str = "join";

#[derive(Clone)]
pub struct InceptionProcessor {
    ctx: EngineContext,
}

impl InceptionProcessor {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Launch the branch sub-chains under `processor_job`.
    #[instrument(skip_all, fields(lake_request_id = %request.lake_request_id))]
    pub async fn start(
        &self,
        request: &LakeRequest,
        processor_job: JobKey,
        instructions: &InceptionInstructions,
    ) -> Result<()> {
        let sources = &request.response_sources;
        if instructions.requires_join(sources.len()) && instructions.join_instructions.is_none() {
            return Err(Error::Processing(
                "INDIVIDUAL distribution over several entries requires join_instructions".into(),
            ));
        }

        let export_step_index = instructions.export_step().and_then(|name| {
            instructions
                .chain_definition
                .iter()
                .position(|s| s.name == name)
        });
        let branches: Vec<Vec<Uuid>> = match instructions.entry_distribution_mode {
            EntryDistributionMode::All => vec![sources.clone()],
            EntryDistributionMode::Individual => sources.iter().map(|id| vec![*id]).collect(),
        };

        self.ctx
            .repos
            .lake_requests
            .set_remaining_chains(request.lake_request_id, branches.len() as i32)
            .await?;
        info!(branches = branches.len(), "Launching inception sub-chains");

        for entries in branches {
            launch_chain(
                &self.ctx,
                instructions.branch_definition(&entries),
                Some(processor_job),
                Some(ChainCallback {
                    lake_request_id: request.lake_request_id,
                    purpose: CallbackPurpose::Branch,
                    export_step_index,
                }),
            )
            .await?;
        }
        Ok(())
    }

    /// Handle a finished sub-chain that carries a callback.
    #[instrument(skip_all, fields(lake_request_id = %callback.lake_request_id, chain_request_id = %chain.chain_request_id))]
    pub async fn on_chain_finished(&self, chain: &ChainRequest, callback: ChainCallback) -> Result<()> {
        let request = self
            .ctx
            .repos
            .lake_requests
            .require(callback.lake_request_id)
            .await?;
        if request.is_closed() {
            debug!("Lake request already closed; ignoring sub-chain result");
            return Ok(());
        }
        let processor_job = self.processor_job(&request).await?;

        if let Err(reason) = self.exported_entry(chain, callback.export_step_index).await? {
            let message = format!("Chain execution failed: {}", reason);
            self.ctx
                .repos
                .jobs
                .fail(processor_job, &message, FailurePropagation::Ancestors)
                .await?;
            return fail_request(&self.ctx, &request, &message).await;
        }

        let remaining = self
            .ctx
            .repos
            .lake_requests
            .record_chain_completion(request.lake_request_id)
            .await?;
        match remaining {
            None => {
                warn!("Sub-chain finished with no sub-chains outstanding; ignoring");
                Ok(())
            }
            Some(n) if n > 0 => {
                debug!(remaining_chains = n, "Waiting for sibling sub-chains");
                Ok(())
            }
            Some(_) => match callback.purpose {
                CallbackPurpose::Branch => self.gather(&request, processor_job).await,
                CallbackPurpose::Join => match self.exported_entry(chain, Some(0)).await? {
                    Ok(entry_id) => self.finish(&request, processor_job, entry_id).await,
                    Err(reason) => Err(Error::Internal(reason)),
                },
            },
        }
    }

    /// Every branch has finished: use the single export, or join several.
    async fn gather(&self, request: &LakeRequest, processor_job: JobKey) -> Result<()> {
        let branches = self
            .ctx
            .repos
            .chains
            .list_by_callback(request.lake_request_id)
            .await?;

        let mut exports = Vec::new();
        for branch in branches {
            let Some(callback) = branch.callback else {
                continue;
            };
            if callback.purpose != CallbackPurpose::Branch {
                continue;
            }
            match self.exported_entry(&branch, callback.export_step_index).await? {
                Ok(entry_id) => exports.push(entry_id),
                Err(reason) => return Err(Error::Internal(reason)),
            }
        }

        match exports.as_slice() {
            [] => Err(Error::Processing("no sub-chain exported a response".into())),
            [single] => self.finish(request, processor_job, *single).await,
            _ => self.launch_join(request, processor_job, exports).await,
        }
    }

    async fn launch_join(
        &self,
        request: &LakeRequest,
        processor_job: JobKey,
        exports: Vec<Uuid>,
    ) -> Result<()> {
        let ProcessingInstructions::Inception(instructions) = &request.processing_instructions
        else {
            return Err(Error::Internal(format!(
                "lake request {} is not an inception request",
                request.lake_request_id
            )));
        };
        let Some(join) = &instructions.join_instructions else {
            let message = "Chain execution failed: several exports but no join_instructions";
            self.ctx
                .repos
                .jobs
                .fail(processor_job, message, FailurePropagation::Ancestors)
                .await?;
            return fail_request(&self.ctx, request, message).await;
        };

        info!(exports = exports.len(), "Joining sub-chain exports");
        let step = LakeChainStep {
            name: JOIN_STEP_NAME.to_string(),
            lake_request: LakeRequestBody::new(join.as_ref().clone()).with_lookup(
                LookupInstruction::BulkEntry {
                    entry_ids: Deferred::Literal(exports),
                },
            ),
            conditional: false,
            validation: None,
        };
        self.ctx
            .repos
            .lake_requests
            .set_remaining_chains(request.lake_request_id, 1)
            .await?;
        launch_chain(
            &self.ctx,
            vec![step],
            Some(processor_job),
            Some(ChainCallback {
                lake_request_id: request.lake_request_id,
                purpose: CallbackPurpose::Join,
                export_step_index: Some(0),
            }),
        )
        .await?;
        Ok(())
    }

    async fn finish(&self, request: &LakeRequest, processor_job: JobKey, entry_id: Uuid) -> Result<()> {
        self.ctx.repos.jobs.complete(processor_job, None).await?;
        info!(processed_entry_id = %entry_id, "Inception processing complete");
        self.ctx
            .publish(LakeEvent::LakeRequestRespond {
                lake_request_id: request.lake_request_id,
                processed_entry_id: entry_id,
            })
            .await?;
        Ok(())
    }

    /// The response entry of the chain's export step, or why there is none.
    async fn exported_entry(
        &self,
        chain: &ChainRequest,
        export_step_index: Option<usize>,
    ) -> Result<std::result::Result<Uuid, String>> {
        if chain.chain_status != ChainStatus::Completed {
            let reason = chain
                .failure_reason
                .clone()
                .unwrap_or_else(|| format!("sub-chain ended {}", chain.chain_status));
            return Ok(Err(reason));
        }
        let Some(step) = export_step_index.and_then(|i| chain.steps.get(i)) else {
            return Ok(Err("sub-chain has no export step".to_string()));
        };
        let Some(lake_request_id) = chain.executed_requests.get(&step.name) else {
            return Ok(Err(format!("export step '{}' did not run", step.name)));
        };
        let exported = self.ctx.repos.lake_requests.require(*lake_request_id).await?;
        Ok(exported
            .response_entry_id
            .ok_or_else(|| format!("export step '{}' produced no response", step.name)))
    }

    async fn processor_job(&self, request: &LakeRequest) -> Result<JobKey> {
        self.ctx
            .repos
            .jobs
            .list_children(request.job_key())
            .await?
            .into_iter()
            .rev()
            .find(|j| j.job_type == JobType::LakeProcessorChain)
            .map(|j| j.key())
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "processor job of lake request {}",
                    request.lake_request_id
                ))
            })
    }
}
