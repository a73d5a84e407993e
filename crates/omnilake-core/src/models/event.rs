//! Queue events driving the engine. Each event names the next action for
//! one correlation id; handlers resume work by publishing follow-up events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::JobKey;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LakeEvent {
    /// Fan out the lookups of a new request.
    LakeRequestInit { lake_request_id: Uuid },
    /// Run lookup instruction `index` of a request.
    Lookup { lake_request_id: Uuid, index: usize },
    /// All lookups reported; run the processor.
    LakeRequestProcess { lake_request_id: Uuid },
    /// Processing produced `processed_entry_id`; apply the response config.
    LakeRequestRespond {
        lake_request_id: Uuid,
        processed_entry_id: Uuid,
    },
    /// The request closed (COMPLETED or FAILED).
    LakeRequestCompleted { lake_request_id: Uuid },
    ChainStart { chain_request_id: Uuid },
    /// The running step's lake request closed.
    ChainStepCompleted {
        chain_request_id: Uuid,
        lake_request_id: Uuid,
    },
    /// The chain reached a terminal status.
    ChainFinished { chain_request_id: Uuid },
    MaintenanceBegin { archive_id: String, holder: JobKey },
    MaintenanceEnd { archive_id: String, holder: JobKey },
    ArchiveVacuum { archive_id: String, job_id: Uuid },
    ArchiveReindex { archive_id: String, job_id: Uuid },
}

impl LakeEvent {
    pub fn event_type(&self) -> LakeEventType {
        match self {
            Self::LakeRequestInit { .. } => LakeEventType::LakeRequestInit,
            Self::Lookup { .. } => LakeEventType::Lookup,
            Self::LakeRequestProcess { .. } => LakeEventType::LakeRequestProcess,
            Self::LakeRequestRespond { .. } => LakeEventType::LakeRequestRespond,
            Self::LakeRequestCompleted { .. } => LakeEventType::LakeRequestCompleted,
            Self::ChainStart { .. } => LakeEventType::ChainStart,
            Self::ChainStepCompleted { .. } => LakeEventType::ChainStepCompleted,
            Self::ChainFinished { .. } => LakeEventType::ChainFinished,
            Self::MaintenanceBegin { .. } => LakeEventType::MaintenanceBegin,
            Self::MaintenanceEnd { .. } => LakeEventType::MaintenanceEnd,
            Self::ArchiveVacuum { .. } => LakeEventType::ArchiveVacuum,
            Self::ArchiveReindex { .. } => LakeEventType::ArchiveReindex,
        }
    }

    /// Id the event is about, for logging.
    pub fn correlation_id(&self) -> String {
        match self {
            Self::LakeRequestInit { lake_request_id }
            | Self::Lookup {
                lake_request_id, ..
            }
            | Self::LakeRequestProcess { lake_request_id }
            | Self::LakeRequestRespond {
                lake_request_id, ..
            }
            | Self::LakeRequestCompleted { lake_request_id } => lake_request_id.to_string(),
            Self::ChainStart { chain_request_id }
            | Self::ChainStepCompleted {
                chain_request_id, ..
            }
            | Self::ChainFinished { chain_request_id } => chain_request_id.to_string(),
            Self::MaintenanceBegin { archive_id, .. }
            | Self::MaintenanceEnd { archive_id, .. }
            | Self::ArchiveVacuum { archive_id, .. }
            | Self::ArchiveReindex { archive_id, .. } => archive_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LakeEventType {
    LakeRequestInit,
    Lookup,
    LakeRequestProcess,
    LakeRequestRespond,
    LakeRequestCompleted,
    ChainStart,
    ChainStepCompleted,
    ChainFinished,
    MaintenanceBegin,
    MaintenanceEnd,
    ArchiveVacuum,
    ArchiveReindex,
}

impl LakeEventType {
    pub const ALL: [LakeEventType; 12] = [
        LakeEventType::LakeRequestInit,
        LakeEventType::Lookup,
        LakeEventType::LakeRequestProcess,
        LakeEventType::LakeRequestRespond,
        LakeEventType::LakeRequestCompleted,
        LakeEventType::ChainStart,
        LakeEventType::ChainStepCompleted,
        LakeEventType::ChainFinished,
        LakeEventType::MaintenanceBegin,
        LakeEventType::MaintenanceEnd,
        LakeEventType::ArchiveVacuum,
        LakeEventType::ArchiveReindex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LakeRequestInit => "LAKE_REQUEST_INIT",
            Self::Lookup => "LOOKUP",
            Self::LakeRequestProcess => "LAKE_REQUEST_PROCESS",
            Self::LakeRequestRespond => "LAKE_REQUEST_RESPOND",
            Self::LakeRequestCompleted => "LAKE_REQUEST_COMPLETED",
            Self::ChainStart => "CHAIN_START",
            Self::ChainStepCompleted => "CHAIN_STEP_COMPLETED",
            Self::ChainFinished => "CHAIN_FINISHED",
            Self::MaintenanceBegin => "MAINTENANCE_BEGIN",
            Self::MaintenanceEnd => "MAINTENANCE_END",
            Self::ArchiveVacuum => "ARCHIVE_VACUUM",
            Self::ArchiveReindex => "ARCHIVE_REINDEX",
        }
    }
}

impl std::fmt::Display for LakeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LakeEventType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        LakeEventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| Error::InvalidInput(format!("Invalid event type: {}", s)))
    }
}

/// Delivery status of a queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Running,
    Completed,
    /// Dead-lettered.
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(Error::InvalidInput(format!("Invalid event status: {}", s))),
        }
    }
}

/// An event as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub event_id: Uuid,
    pub event: LakeEvent,
    pub status: EventStatus,
    /// Deliveries so far, including the current one once claimed.
    pub attempts: i32,
    pub max_attempts: i32,
    pub available_on: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_on: DateTime<Utc>,
}

impl QueuedEvent {
    pub fn event_type(&self) -> LakeEventType {
        self.event.event_type()
    }

    /// Whether another delivery is allowed after the current one.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
