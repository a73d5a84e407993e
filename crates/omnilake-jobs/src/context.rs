//! Shared dependencies of the engine components.

use std::sync::Arc;
use std::time::Duration;

use omnilake_core::defaults;
use omnilake_core::{EmbeddingBackend, GenerationBackend, LakeEvent, Result};
use omnilake_db::Repositories;
use tracing::debug;
use uuid::Uuid;

use crate::ledger::JobLedger;

/// Storage, inference and HTTP handles shared by every engine component.
///
/// Cheap to clone; every field is reference counted.
#[derive(Clone)]
pub struct EngineContext {
    pub repos: Repositories,
    pub generation: Arc<dyn GenerationBackend>,
    pub embedding: Arc<dyn EmbeddingBackend>,
    /// Client for WEB_SITE lookups.
    pub http: reqwest::Client,
}

impl EngineContext {
    pub fn new(
        repos: Repositories,
        generation: Arc<dyn GenerationBackend>,
        embedding: Arc<dyn EmbeddingBackend>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(defaults::WEB_FETCH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            repos,
            generation,
            embedding,
            http,
        }
    }

    /// Replace the HTTP client used for web lookups.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn ledger(&self) -> JobLedger {
        JobLedger::new(self.repos.jobs.clone())
    }

    /// Enqueue a follow-up event.
    pub(crate) async fn publish(&self, event: LakeEvent) -> Result<Uuid> {
        let event_type = event.event_type();
        let event_id = self.repos.events.publish(event).await?;
        debug!(%event_id, %event_type, "Published event");
        Ok(event_id)
    }
}
