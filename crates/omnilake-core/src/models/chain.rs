//! Chains: ordered, named lake requests with conditional steps and
//! validation gates.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::deferred::HasReferences;
use super::lake_request::LakeRequestBody;
use super::{Job, JobKey, JobType};
use crate::uuid_utils::new_v7;
use crate::{Error, Result};

/// One named step of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LakeChainStep {
    pub name: String,
    pub lake_request: LakeRequestBody,
    /// Skipped unless activated by an earlier validation directive.
    #[serde(default)]
    pub conditional: bool,
    #[serde(default)]
    pub validation: Option<StepValidation>,
}

/// LLM-judged gate run after a step completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepValidation {
    pub prompt: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub on_success: Option<ValidationDirective>,
    #[serde(default)]
    pub on_failure: Option<ValidationDirective>,
}

impl StepValidation {
    pub fn is_noop(&self) -> bool {
        self.on_success.is_none() && self.on_failure.is_none()
    }

    pub fn directive_for(&self, success: bool) -> Option<&ValidationDirective> {
        if success {
            self.on_success.as_ref()
        } else {
            self.on_failure.as_ref()
        }
    }
}

/// What a validation outcome does to the rest of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDirective", into = "RawDirective")]
pub enum ValidationDirective {
    /// Activate a later conditional step.
    ExecuteChainStep(String),
    /// End the chain as TERMINATED.
    TerminateChain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDirective {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    execute_chain_step: Option<String>,
    #[serde(default)]
    terminate_chain: bool,
}

impl TryFrom<RawDirective> for ValidationDirective {
    type Error = String;

    fn try_from(raw: RawDirective) -> std::result::Result<Self, Self::Error> {
        match (raw.execute_chain_step, raw.terminate_chain) {
            (Some(_), true) => Err(
                "a validation directive cannot set both execute_chain_step and terminate_chain"
                    .to_string(),
            ),
            (Some(step), false) => Ok(Self::ExecuteChainStep(step)),
            (None, true) => Ok(Self::TerminateChain),
            (None, false) => Err(
                "a validation directive must set execute_chain_step or terminate_chain"
                    .to_string(),
            ),
        }
    }
}

impl From<ValidationDirective> for RawDirective {
    fn from(d: ValidationDirective) -> Self {
        match d {
            ValidationDirective::ExecuteChainStep(step) => Self {
                execute_chain_step: Some(step),
                terminate_chain: false,
            },
            ValidationDirective::TerminateChain => Self {
                execute_chain_step: None,
                terminate_chain: true,
            },
        }
    }
}

/// Per-step execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl StepState {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }
}

/// Overall chain status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainStatus {
    Pending,
    Executing,
    Completed,
    Terminated,
    Failed,
}

impl ChainStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Terminated | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChainStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "EXECUTING" => Ok(Self::Executing),
            "COMPLETED" => Ok(Self::Completed),
            "TERMINATED" => Ok(Self::Terminated),
            "FAILED" => Ok(Self::Failed),
            _ => Err(Error::InvalidInput(format!("Invalid chain status: {}", s))),
        }
    }
}

/// Why an inception sub-chain reports back to a lake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackPurpose {
    /// One of the per-distribution sub-chains.
    Branch,
    /// The chain joining several branch exports.
    Join,
}

/// Lake request notified when a sub-chain finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCallback {
    pub lake_request_id: Uuid,
    pub purpose: CallbackPurpose,
    /// Step whose response entry is exported back.
    #[serde(default)]
    pub export_step_index: Option<usize>,
}

/// Stored state of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRequest {
    pub chain_request_id: Uuid,
    pub job_id: Uuid,
    pub job_type: JobType,
    pub parent_job_type: Option<JobType>,
    pub parent_job_id: Option<Uuid>,
    pub steps: Vec<LakeChainStep>,
    pub step_states: Vec<StepState>,
    /// Index of the next step to consider.
    pub cursor: usize,
    /// Conditional steps enabled by validation directives.
    pub activated: BTreeSet<String>,
    pub executed_requests: BTreeMap<String, Uuid>,
    /// Lake request of the step currently RUNNING.
    pub awaiting_lake_request_id: Option<Uuid>,
    pub chain_status: ChainStatus,
    pub failure_reason: Option<String>,
    pub callback: Option<ChainCallback>,
    /// Optimistic concurrency token, bumped on every save.
    pub version: i64,
    pub created_on: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
}

impl ChainRequest {
    pub fn new(steps: Vec<LakeChainStep>, job: &Job) -> Self {
        let step_states = vec![StepState::Pending; steps.len()];
        Self {
            chain_request_id: new_v7(),
            job_id: job.job_id,
            job_type: job.job_type,
            parent_job_type: job.parent_job_type,
            parent_job_id: job.parent_job_id,
            steps,
            step_states,
            cursor: 0,
            activated: BTreeSet::new(),
            executed_requests: BTreeMap::new(),
            awaiting_lake_request_id: None,
            chain_status: ChainStatus::Pending,
            failure_reason: None,
            callback: None,
            version: 0,
            created_on: Utc::now(),
            ended: None,
        }
    }

    pub fn with_callback(mut self, callback: ChainCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn job_key(&self) -> JobKey {
        JobKey::new(self.job_type, self.job_id)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn is_terminal(&self) -> bool {
        self.chain_status.is_terminal()
    }

    /// Describe-chain output.
    pub fn describe(&self) -> ChainDescription {
        let effective = effective_conditional(&self.steps);
        ChainDescription {
            chain_request_id: self.chain_request_id,
            chain_status: self.chain_status,
            executed_requests: self.executed_requests.clone(),
            steps: self
                .steps
                .iter()
                .zip(&self.step_states)
                .zip(effective)
                .map(|((step, state), effective_conditional)| StepSummary {
                    name: step.name.clone(),
                    state: *state,
                    conditional: step.conditional,
                    effective_conditional,
                    lake_request_id: self.executed_requests.get(&step.name).copied(),
                })
                .collect(),
            failure_reason: self.failure_reason.clone(),
            job_id: self.job_id,
            job_type: self.job_type,
        }
    }
}

/// One step in describe-chain output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub name: String,
    pub state: StepState,
    pub conditional: bool,
    /// Conditional itself or through a reference to a conditional step.
    pub effective_conditional: bool,
    pub lake_request_id: Option<Uuid>,
}

/// Per step, whether it may be skipped: marked conditional, or referencing
/// an earlier step that may be skipped.
pub fn effective_conditional(steps: &[LakeChainStep]) -> Vec<bool> {
    let mut out: Vec<bool> = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        let inherited = step.lake_request.references().iter().any(|r| {
            steps[..i]
                .iter()
                .position(|s| s.name == r.step_name)
                .is_some_and(|j| out[j])
        });
        out.push(step.conditional || inherited);
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDescription {
    pub chain_request_id: Uuid,
    pub chain_status: ChainStatus,
    pub executed_requests: BTreeMap<String, Uuid>,
    pub steps: Vec<StepSummary>,
    pub failure_reason: Option<String>,
    pub job_id: Uuid,
    pub job_type: JobType,
}

/// Identifiers returned on submission of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSubmitted {
    pub chain_request_id: Uuid,
    pub job_id: Uuid,
    pub job_type: JobType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_directive_execute_step() {
        let d: ValidationDirective =
            serde_json::from_value(json!({"execute_chain_step": "b"})).unwrap();
        assert_eq!(d, ValidationDirective::ExecuteChainStep("b".into()));
        assert_eq!(
            serde_json::to_value(&d).unwrap(),
            json!({"execute_chain_step": "b", "terminate_chain": false})
        );
    }

    #[test]
    fn test_directive_terminate() {
        let d: ValidationDirective =
            serde_json::from_value(json!({"terminate_chain": true})).unwrap();
        assert_eq!(d, ValidationDirective::TerminateChain);
    }

    #[test]
    fn test_directive_rejects_both_and_neither() {
        assert!(serde_json::from_value::<ValidationDirective>(
            json!({"execute_chain_step": "b", "terminate_chain": true})
        )
        .is_err());
        assert!(serde_json::from_value::<ValidationDirective>(json!({})).is_err());
    }

    #[test]
    fn test_step_defaults() {
        let step: LakeChainStep = serde_json::from_value(json!({
            "name": "a",
            "lake_request": {
                "processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "g"}
            }
        }))
        .unwrap();
        assert!(!step.conditional);
        assert!(step.validation.is_none());
    }

    #[test]
    fn test_validation_noop_and_directive_for() {
        let v = StepValidation {
            prompt: "is it good?".into(),
            model_id: None,
            on_success: Some(ValidationDirective::ExecuteChainStep("b".into())),
            on_failure: None,
        };
        assert!(!v.is_noop());
        assert!(v.directive_for(true).is_some());
        assert!(v.directive_for(false).is_none());
    }

    #[test]
    fn test_new_chain_state() {
        let step: LakeChainStep = serde_json::from_value(json!({
            "name": "a",
            "lake_request": {
                "processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "g"}
            }
        }))
        .unwrap();
        let job = Job::new(JobType::LakeChainRequest);
        let chain = ChainRequest::new(vec![step.clone(), step], &job);
        assert_eq!(chain.step_states, vec![StepState::Pending; 2]);
        assert_eq!(chain.chain_status, ChainStatus::Pending);
        assert_eq!(chain.version, 0);
        assert_eq!(chain.step_index("a"), Some(0));
        let described = chain.describe();
        assert_eq!(described.steps.len(), 2);
        assert!(described.executed_requests.is_empty());
    }

    #[test]
    fn test_effective_conditional_is_transitive() {
        let steps: Vec<LakeChainStep> = serde_json::from_value(json!([
            {"name": "a", "lake_request": {"processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "g"}}},
            {"name": "b", "conditional": true, "lake_request": {"processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "g"}}},
            {"name": "c", "lake_request": {
                "lookup_instructions": [{"request_type": "DIRECT_ENTRY", "entry_id": "REF:b.response_id"}],
                "processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "g"}
            }},
            {"name": "d", "lake_request": {"processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "REF:c.response_body"}}},
            {"name": "e", "lake_request": {"processing_instructions": {"processor_type": "SUMMARIZATION", "goal": "REF:a.response_body"}}}
        ]))
        .unwrap();
        assert_eq!(
            effective_conditional(&steps),
            vec![false, true, true, true, false]
        );
    }

    #[test]
    fn test_chain_status_terminal() {
        assert!(!ChainStatus::Executing.is_terminal());
        assert!(ChainStatus::Terminated.is_terminal());
        assert_eq!("TERMINATED".parse::<ChainStatus>().unwrap(), ChainStatus::Terminated);
    }
}
