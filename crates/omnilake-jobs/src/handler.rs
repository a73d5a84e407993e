//! Event handler trait and the per-delivery context.

use async_trait::async_trait;
use uuid::Uuid;

use omnilake_core::{Error, LakeEvent, LakeEventType, QueuedEvent};

/// Context provided to event handlers for one delivery.
pub struct EventContext {
    /// The claimed event, with `attempts` counting this delivery.
    pub queued: QueuedEvent,
}

impl EventContext {
    pub fn new(queued: QueuedEvent) -> Self {
        Self { queued }
    }

    pub fn event(&self) -> &LakeEvent {
        &self.queued.event
    }

    pub fn event_id(&self) -> Uuid {
        self.queued.event_id
    }

    pub fn attempt(&self) -> i32 {
        self.queued.attempts
    }

    /// Whether the queue will deliver this event again after a `Retry`.
    pub fn can_retry(&self) -> bool {
        self.queued.can_retry()
    }
}

/// Result of handling one event delivery.
#[derive(Debug, PartialEq, Eq)]
pub enum HandlerResult {
    /// The event is done.
    Success,
    /// Dead-letter the event.
    Failed(String),
    /// Redeliver after a backoff.
    Retry(String),
}

impl HandlerResult {
    /// Map a handler outcome: retryable errors are redelivered while
    /// attempts remain, everything else is dead-lettered.
    pub fn from_result(result: omnilake_core::Result<()>, ctx: &EventContext) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) if e.is_retryable() && ctx.can_retry() => Self::Retry(e.to_string()),
            Err(e) => Self::Failed(e.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<Error> for HandlerResult {
    fn from(e: Error) -> Self {
        Self::Failed(e.to_string())
    }
}

/// Trait for engine event handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Event types this handler consumes.
    fn event_types(&self) -> Vec<LakeEventType>;

    /// Handle one delivery.
    async fn handle(&self, ctx: EventContext) -> HandlerResult;

    fn can_handle(&self, event_type: LakeEventType) -> bool {
        self.event_types().contains(&event_type)
    }
}
