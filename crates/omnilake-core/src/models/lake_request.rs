//! Lake requests: one lookup + processing + response operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::deferred::{Deferred, HasReferences, ResolvedValues, StepReference};
use super::lookup::LookupInstruction;
use super::processing::ProcessingInstructions;
use super::response::ResponseConfig;
use super::{Job, JobStatus, JobType};
use crate::uuid_utils::new_v7;
use crate::{Error, Result};

/// Whether inception placeholders are allowed in a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderPolicy {
    /// Standalone requests and top-level chain steps.
    Forbidden,
    /// Steps of an inception chain definition.
    Permitted,
}

/// The submitted body of a lake request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LakeRequestBody {
    #[serde(default)]
    pub lookup_instructions: Vec<LookupInstruction>,
    pub processing_instructions: ProcessingInstructions,
    #[serde(default)]
    pub response_config: ResponseConfig,
}

impl LakeRequestBody {
    /// A body with no lookups and a DIRECT response.
    pub fn new(processing_instructions: ProcessingInstructions) -> Self {
        Self {
            lookup_instructions: Vec::new(),
            processing_instructions,
            response_config: ResponseConfig::default(),
        }
    }

    pub fn with_lookup(mut self, lookup: LookupInstruction) -> Self {
        self.lookup_instructions.push(lookup);
        self
    }

    pub fn with_response(mut self, response_config: ResponseConfig) -> Self {
        self.response_config = response_config;
        self
    }

    pub fn validate(&self, placeholders: PlaceholderPolicy) -> Result<()> {
        for lookup in &self.lookup_instructions {
            lookup.validate(placeholders)?;
        }
        self.processing_instructions.validate()?;
        self.response_config.validate(placeholders)
    }

    /// Validation for a request submitted on its own, outside any chain.
    pub fn validate_standalone(&self) -> Result<()> {
        self.validate(PlaceholderPolicy::Forbidden)?;
        if let Some(r) = self.references().first() {
            return Err(Error::Validation(format!(
                "reference {} is only valid inside a chain",
                r
            )));
        }
        Ok(())
    }

    /// Rewrite inception placeholders for a sub-chain over `entries`.
    pub fn replace_placeholders(&mut self, entries: &[Uuid]) {
        for lookup in &mut self.lookup_instructions {
            if lookup.is_placeholder() {
                *lookup = match entries {
                    [single] => LookupInstruction::DirectEntry {
                        entry_id: Deferred::Literal(*single),
                    },
                    _ => LookupInstruction::BulkEntry {
                        entry_ids: Deferred::Literal(entries.to_vec()),
                    },
                };
            }
        }
        if self.response_config.is_export() {
            self.response_config = ResponseConfig::default();
        }
    }
}

impl HasReferences for LakeRequestBody {
    fn references(&self) -> Vec<&StepReference> {
        let mut out: Vec<&StepReference> = self
            .lookup_instructions
            .iter()
            .flat_map(|l| l.references())
            .collect();
        out.extend(self.processing_instructions.references());
        out.extend(self.response_config.references());
        out
    }

    fn resolve_references(&mut self, values: &ResolvedValues) -> Result<()> {
        for lookup in &mut self.lookup_instructions {
            lookup.resolve_references(values)?;
        }
        self.processing_instructions.resolve_references(values)?;
        self.response_config.resolve_references(values)
    }
}

/// Progress of a lake request through its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LakeRequestStage {
    Lookup,
    Processing,
    Responding,
    Closed,
}

impl LakeRequestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lookup => "LOOKUP",
            Self::Processing => "PROCESSING",
            Self::Responding => "RESPONDING",
            Self::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for LakeRequestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LakeRequestStage {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "LOOKUP" => Ok(Self::Lookup),
            "PROCESSING" => Ok(Self::Processing),
            "RESPONDING" => Ok(Self::Responding),
            "CLOSED" => Ok(Self::Closed),
            _ => Err(Error::InvalidInput(format!(
                "Invalid lake request stage: {}",
                s
            ))),
        }
    }
}

/// Stored state of a lake request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LakeRequest {
    pub lake_request_id: Uuid,
    pub job_id: Uuid,
    pub job_type: JobType,
    /// Set when the request runs as a chain step.
    pub chain_request_id: Option<Uuid>,
    pub lookup_instructions: Vec<LookupInstruction>,
    pub processing_instructions: ProcessingInstructions,
    pub response_config: ResponseConfig,
    /// Countdown of outstanding lookups.
    pub remaining_lookups: i32,
    /// Union of lookup results, in arrival order.
    pub response_sources: Vec<Uuid>,
    /// Countdown of outstanding inception sub-chains.
    pub remaining_chains: i32,
    pub response_entry_id: Option<Uuid>,
    pub stage: LakeRequestStage,
    pub request_status: JobStatus,
    pub created_on: DateTime<Utc>,
    pub lookups_started_on: DateTime<Utc>,
    /// Last change to the stage or the lookup countdown. Sweeps age stuck
    /// requests from here.
    #[serde(default = "Utc::now")]
    pub stage_updated_on: DateTime<Utc>,
    pub closed_on: Option<DateTime<Utc>>,
}

impl LakeRequest {
    /// A new request in LOOKUP with its countdown set to the lookup count.
    pub fn new(body: LakeRequestBody, job: &Job, chain_request_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            lake_request_id: new_v7(),
            job_id: job.job_id,
            job_type: job.job_type,
            chain_request_id,
            remaining_lookups: body.lookup_instructions.len() as i32,
            lookup_instructions: body.lookup_instructions,
            processing_instructions: body.processing_instructions,
            response_config: body.response_config,
            response_sources: Vec::new(),
            remaining_chains: 0,
            response_entry_id: None,
            stage: LakeRequestStage::Lookup,
            request_status: JobStatus::Pending,
            created_on: now,
            lookups_started_on: now,
            stage_updated_on: now,
            closed_on: None,
        }
    }

    pub fn job_key(&self) -> super::JobKey {
        super::JobKey::new(self.job_type, self.job_id)
    }

    pub fn is_closed(&self) -> bool {
        self.stage == LakeRequestStage::Closed
    }
}

/// Describe-lake-request output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LakeRequestDescription {
    pub lake_request_id: Uuid,
    pub job_id: Uuid,
    pub job_type: JobType,
    pub request_status: JobStatus,
    pub stage: LakeRequestStage,
    pub response_entry_id: Option<Uuid>,
    pub response_body: Option<String>,
    pub response_sources: Vec<Uuid>,
    pub remaining_lookups: i32,
}

/// Identifiers returned on submission of a lake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LakeRequestSubmitted {
    pub lake_request_id: Uuid,
    pub job_id: Uuid,
    pub job_type: JobType,
}
