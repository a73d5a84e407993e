//! In-memory repositories.
//!
//! All repositories share one [`MemoryStore`] guarded by a single async
//! mutex, so each trait method is atomic exactly like the single-statement
//! PostgreSQL updates it mirrors. Used by the engine's tests and by
//! single-process deployments without a database.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pgvector::Vector;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use omnilake_core::{
    defaults, new_v7, Archive, ArchiveOperation, ArchiveRepository, ArchiveStatus,
    ChainRepository, ChainRequest, Entry, EntryRepository, Error, EventQueue, EventStatus, Job,
    JobKey, JobRepository, JobStatus, JobType, LakeEvent, LakeEventType, LakeRequest,
    LakeRequestRepository, LakeRequestStage, MaintenanceOutcome, NewEntry, QueuedEvent, Result,
    Source, SourceRepository, VectorIndex,
};

use crate::Repositories;

/// Completed and dead-lettered events kept for inspection.
const FINISHED_EVENTS_KEPT: usize = 1024;

#[derive(Default)]
struct Tables {
    jobs: HashMap<(JobType, Uuid), Job>,
    archives: BTreeMap<String, Archive>,
    entries: HashMap<Uuid, Entry>,
    /// archive id -> member entry ids in indexing order
    archive_entries: HashMap<String, Vec<Uuid>>,
    sources: HashMap<(String, String), Source>,
    lake_requests: HashMap<Uuid, LakeRequest>,
    chains: HashMap<Uuid, ChainRequest>,
    /// Claimable and running events only.
    events: HashMap<Uuid, (u64, QueuedEvent)>,
    event_seq: u64,
    finished_events: HashMap<Uuid, QueuedEvent>,
    finished_order: VecDeque<Uuid>,
    embeddings: HashMap<(String, Uuid), Vector>,
}

/// Shared state behind the in-memory repositories.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    notify: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Build a full repository bundle over a fresh in-memory store.
pub fn repositories() -> Repositories {
    repositories_for(MemoryStore::new())
}

/// Build a repository bundle over an existing store.
pub fn repositories_for(store: Arc<MemoryStore>) -> Repositories {
    Repositories {
        jobs: Arc::new(MemoryJobRepository(store.clone())),
        archives: Arc::new(MemoryArchiveRepository(store.clone())),
        entries: Arc::new(MemoryEntryRepository(store.clone())),
        sources: Arc::new(MemorySourceRepository(store.clone())),
        lake_requests: Arc::new(MemoryLakeRequestRepository(store.clone())),
        chains: Arc::new(MemoryChainRepository(store.clone())),
        events: Arc::new(MemoryEventQueue(store.clone())),
        vectors: Arc::new(MemoryVectorIndex(store.clone())),
        event_notify: store.notify.clone(),
    }
}

// =============================================================================
// JOBS
// =============================================================================

pub struct MemoryJobRepository(Arc<MemoryStore>);

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn create(&self, job: &Job) -> Result<()> {
        let mut tables = self.0.tables.lock().await;
        let key = (job.job_type, job.job_id);
        if tables.jobs.contains_key(&key) {
            return Err(Error::InvalidInput(format!("job {} already exists", job.key())));
        }
        tables.jobs.insert(key, job.clone());
        Ok(())
    }

    async fn get(&self, job_type: JobType, job_id: Uuid) -> Result<Option<Job>> {
        let tables = self.0.tables.lock().await;
        Ok(tables.jobs.get(&(job_type, job_id)).cloned())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let mut tables = self.0.tables.lock().await;
        match tables.jobs.get_mut(&(job.job_type, job.job_id)) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("job {}", job.key()))),
        }
    }

    async fn mark_in_progress(&self, key: JobKey) -> Result<bool> {
        let mut tables = self.0.tables.lock().await;
        match tables.jobs.get_mut(&(key.job_type, key.job_id)) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::InProgress;
                job.started = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish(
        &self,
        key: JobKey,
        status: JobStatus,
        status_message: Option<&str>,
        result: Option<JsonValue>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "{} is not a terminal job status",
                status
            )));
        }
        let mut tables = self.0.tables.lock().await;
        match tables.jobs.get_mut(&(key.job_type, key.job_id)) {
            Some(job) if !job.status.is_terminal() => {
                let now = Utc::now();
                job.status = status;
                if let Some(message) = status_message {
                    job.status_message = Some(message.to_string());
                }
                if result.is_some() {
                    job.result = result;
                }
                job.started.get_or_insert(now);
                job.ended = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_children(&self, parent: JobKey) -> Result<Vec<Job>> {
        let tables = self.0.tables.lock().await;
        let mut children: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.parent_key() == Some(parent))
            .cloned()
            .collect();
        children.sort_by_key(|j| j.created_on);
        Ok(children)
    }
}

// =============================================================================
// ARCHIVES
// =============================================================================

pub struct MemoryArchiveRepository(Arc<MemoryStore>);

#[async_trait]
impl ArchiveRepository for MemoryArchiveRepository {
    async fn create(&self, archive: &Archive) -> Result<()> {
        let mut tables = self.0.tables.lock().await;
        if tables.archives.contains_key(&archive.archive_id) {
            return Err(Error::InvalidInput(format!(
                "archive {} already exists",
                archive.archive_id
            )));
        }
        tables
            .archives
            .insert(archive.archive_id.clone(), archive.clone());
        Ok(())
    }

    async fn get(&self, archive_id: &str) -> Result<Option<Archive>> {
        let tables = self.0.tables.lock().await;
        Ok(tables.archives.get(archive_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Archive>> {
        let tables = self.0.tables.lock().await;
        Ok(tables.archives.values().cloned().collect())
    }

    async fn transition_status(
        &self,
        archive_id: &str,
        from: ArchiveStatus,
        to: ArchiveStatus,
    ) -> Result<bool> {
        let mut tables = self.0.tables.lock().await;
        match tables.archives.get_mut(archive_id) {
            Some(archive) if archive.status == from => {
                archive.status = to;
                archive.updated_on = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn begin_maintenance(&self, archive_id: &str, token: &str) -> Result<MaintenanceOutcome> {
        let mut tables = self.0.tables.lock().await;
        let archive = tables
            .archives
            .get_mut(archive_id)
            .ok_or_else(|| Error::NotFound(format!("archive {}", archive_id)))?;
        if archive.status_context_job_ids.iter().any(|t| t == token) {
            return Ok(MaintenanceOutcome::Unchanged(archive.clone()));
        }
        if !matches!(
            archive.status,
            ArchiveStatus::Active | ArchiveStatus::Maintenance
        ) {
            return Err(Error::ArchiveBusy {
                archive_id: archive.archive_id.clone(),
                status: archive.status,
            });
        }
        archive.status_context_job_ids.push(token.to_string());
        archive.status = ArchiveStatus::Maintenance;
        archive.updated_on = Utc::now();
        Ok(MaintenanceOutcome::Applied(archive.clone()))
    }

    async fn end_maintenance(&self, archive_id: &str, token: &str) -> Result<MaintenanceOutcome> {
        let mut tables = self.0.tables.lock().await;
        let archive = tables
            .archives
            .get_mut(archive_id)
            .ok_or_else(|| Error::NotFound(format!("archive {}", archive_id)))?;
        let before = archive.status_context_job_ids.len();
        archive.status_context_job_ids.retain(|t| t != token);
        if archive.status_context_job_ids.len() == before {
            return Ok(MaintenanceOutcome::Unchanged(archive.clone()));
        }
        if archive.status_context_job_ids.is_empty() {
            archive.status = ArchiveStatus::Active;
        }
        archive.updated_on = Utc::now();
        Ok(MaintenanceOutcome::Applied(archive.clone()))
    }
}

// =============================================================================
// ENTRIES AND SOURCES
// =============================================================================

pub struct MemoryEntryRepository(Arc<MemoryStore>);

#[async_trait]
impl EntryRepository for MemoryEntryRepository {
    async fn create(&self, entry: NewEntry) -> Result<Entry> {
        let entry = entry.into_entry();
        let mut tables = self.0.tables.lock().await;
        tables.entries.insert(entry.entry_id, entry.clone());
        Ok(entry)
    }

    async fn get(&self, entry_id: Uuid) -> Result<Option<Entry>> {
        let tables = self.0.tables.lock().await;
        Ok(tables.entries.get(&entry_id).cloned())
    }

    async fn get_many(&self, entry_ids: &[Uuid]) -> Result<Vec<Entry>> {
        let tables = self.0.tables.lock().await;
        let mut seen = std::collections::HashSet::new();
        Ok(entry_ids
            .iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| tables.entries.get(id).cloned())
            .collect())
    }

    async fn index(
        &self,
        archive_id: &str,
        entry_id: Uuid,
        operation: ArchiveOperation,
    ) -> Result<()> {
        let mut tables = self.0.tables.lock().await;
        let archive = tables
            .archives
            .get(archive_id)
            .ok_or_else(|| Error::NotFound(format!("archive {}", archive_id)))?;
        if !archive.status.permits(operation) {
            return Err(Error::ArchiveBusy {
                archive_id: archive_id.to_string(),
                status: archive.status,
            });
        }
        if !tables.entries.contains_key(&entry_id) {
            return Err(Error::NotFound(format!("entry {}", entry_id)));
        }
        let members = tables
            .archive_entries
            .entry(archive_id.to_string())
            .or_default();
        if !members.contains(&entry_id) {
            members.push(entry_id);
        }
        Ok(())
    }

    async fn list_archive_entries(
        &self,
        archive_id: &str,
        prioritize_tags: &[String],
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        let tables = self.0.tables.lock().await;
        let mut entries: Vec<&Entry> = tables
            .archive_entries
            .get(archive_id)
            .map(|ids| ids.iter().filter_map(|id| tables.entries.get(id)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            let a_tagged = a.tags.iter().any(|t| prioritize_tags.contains(t));
            let b_tagged = b.tags.iter().any(|t| prioritize_tags.contains(t));
            b_tagged
                .cmp(&a_tagged)
                .then(b.effective_on.cmp(&a.effective_on))
                .then(b.created_on.cmp(&a.created_on))
        });
        Ok(entries
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|e| e.entry_id)
            .collect())
    }

    async fn archive_entry_ids(&self, archive_id: &str) -> Result<Vec<Uuid>> {
        let tables = self.0.tables.lock().await;
        Ok(tables
            .archive_entries
            .get(archive_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn superseded_originals(&self, archive_id: &str) -> Result<Vec<Uuid>> {
        let tables = self.0.tables.lock().await;
        let latest: HashMap<String, Option<Uuid>> = tables
            .sources
            .values()
            .map(|s| (s.resource_name(), s.latest_content_entry_id))
            .collect();
        let Some(members) = tables.archive_entries.get(archive_id) else {
            return Ok(Vec::new());
        };
        Ok(members
            .iter()
            .filter_map(|id| tables.entries.get(id))
            .filter(|e| {
                e.original_of_source
                    .as_ref()
                    .and_then(|name| latest.get(name))
                    .is_some_and(|latest| *latest != Some(e.entry_id))
            })
            .map(|e| e.entry_id)
            .collect())
    }

    async fn remove_from_archive(&self, archive_id: &str, entry_ids: &[Uuid]) -> Result<u64> {
        let mut tables = self.0.tables.lock().await;
        let Some(members) = tables.archive_entries.get_mut(archive_id) else {
            return Ok(0);
        };
        let before = members.len();
        members.retain(|id| !entry_ids.contains(id));
        Ok((before - members.len()) as u64)
    }
}

pub struct MemorySourceRepository(Arc<MemoryStore>);

#[async_trait]
impl SourceRepository for MemorySourceRepository {
    async fn get(&self, source_type: &str, source_id: &str) -> Result<Option<Source>> {
        let tables = self.0.tables.lock().await;
        Ok(tables
            .sources
            .get(&(source_type.to_string(), source_id.to_string()))
            .cloned())
    }

    async fn put(&self, source: &Source) -> Result<()> {
        let mut tables = self.0.tables.lock().await;
        let key = (source.source_type.clone(), source.source_id.clone());
        match tables.sources.get_mut(&key) {
            Some(stored) => {
                stored.source_arguments = source.source_arguments.clone();
                stored.latest_content_entry_id = source.latest_content_entry_id;
            }
            None => {
                tables.sources.insert(key, source.clone());
            }
        }
        Ok(())
    }
}

// =============================================================================
// LAKE REQUESTS AND CHAINS
// =============================================================================

pub struct MemoryLakeRequestRepository(Arc<MemoryStore>);

#[async_trait]
impl LakeRequestRepository for MemoryLakeRequestRepository {
    async fn create(&self, request: &LakeRequest) -> Result<()> {
        let mut tables = self.0.tables.lock().await;
        tables
            .lake_requests
            .insert(request.lake_request_id, request.clone());
        Ok(())
    }

    async fn get(&self, lake_request_id: Uuid) -> Result<Option<LakeRequest>> {
        let tables = self.0.tables.lock().await;
        Ok(tables.lake_requests.get(&lake_request_id).cloned())
    }

    async fn add_lookup_results(
        &self,
        lake_request_id: Uuid,
        entry_ids: &[Uuid],
    ) -> Result<Option<i32>> {
        let mut tables = self.0.tables.lock().await;
        let Some(request) = tables.lake_requests.get_mut(&lake_request_id) else {
            return Ok(None);
        };
        if request.stage != LakeRequestStage::Lookup || request.remaining_lookups <= 0 {
            return Ok(None);
        }
        for id in entry_ids {
            if !request.response_sources.contains(id) {
                request.response_sources.push(*id);
            }
        }
        request.remaining_lookups -= 1;
        request.stage_updated_on = Utc::now();
        Ok(Some(request.remaining_lookups))
    }

    async fn force_complete_lookups(&self, lake_request_id: Uuid) -> Result<bool> {
        let mut tables = self.0.tables.lock().await;
        match tables.lake_requests.get_mut(&lake_request_id) {
            Some(r) if r.stage == LakeRequestStage::Lookup && r.remaining_lookups > 0 => {
                r.remaining_lookups = 0;
                r.stage_updated_on = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_stalled_lookups(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let tables = self.0.tables.lock().await;
        let mut stalled: Vec<&LakeRequest> = tables
            .lake_requests
            .values()
            .filter(|r| {
                r.stage == LakeRequestStage::Lookup
                    && if r.remaining_lookups > 0 {
                        r.lookups_started_on < older_than
                    } else {
                        r.stage_updated_on < older_than
                    }
            })
            .collect();
        stalled.sort_by_key(|r| r.lookups_started_on);
        Ok(stalled.into_iter().map(|r| r.lake_request_id).collect())
    }

    async fn list_stalled_processing(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let tables = self.0.tables.lock().await;
        let mut stalled: Vec<&LakeRequest> = tables
            .lake_requests
            .values()
            .filter(|r| {
                r.stage == LakeRequestStage::Processing
                    && r.remaining_chains == 0
                    && r.stage_updated_on < older_than
            })
            .collect();
        stalled.sort_by_key(|r| r.stage_updated_on);
        Ok(stalled.into_iter().map(|r| r.lake_request_id).collect())
    }

    async fn transition_stage(
        &self,
        lake_request_id: Uuid,
        from: LakeRequestStage,
        to: LakeRequestStage,
    ) -> Result<bool> {
        let mut tables = self.0.tables.lock().await;
        match tables.lake_requests.get_mut(&lake_request_id) {
            Some(r) if r.stage == from => {
                r.stage = to;
                r.stage_updated_on = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_request_status(&self, lake_request_id: Uuid, status: JobStatus) -> Result<()> {
        let mut tables = self.0.tables.lock().await;
        if let Some(r) = tables.lake_requests.get_mut(&lake_request_id) {
            if !r.is_closed() {
                r.request_status = status;
            }
        }
        Ok(())
    }

    async fn set_response_entry(&self, lake_request_id: Uuid, entry_id: Uuid) -> Result<bool> {
        let mut tables = self.0.tables.lock().await;
        match tables.lake_requests.get_mut(&lake_request_id) {
            Some(r) if r.response_entry_id.is_none() => {
                r.response_entry_id = Some(entry_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close(&self, lake_request_id: Uuid, status: JobStatus) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "{} is not a terminal request status",
                status
            )));
        }
        let mut tables = self.0.tables.lock().await;
        match tables.lake_requests.get_mut(&lake_request_id) {
            Some(r) if !r.is_closed() => {
                r.stage = LakeRequestStage::Closed;
                r.request_status = status;
                r.closed_on = Some(Utc::now());
                r.stage_updated_on = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_remaining_chains(&self, lake_request_id: Uuid, count: i32) -> Result<()> {
        let mut tables = self.0.tables.lock().await;
        if let Some(r) = tables.lake_requests.get_mut(&lake_request_id) {
            r.remaining_chains = count;
        }
        Ok(())
    }

    async fn record_chain_completion(&self, lake_request_id: Uuid) -> Result<Option<i32>> {
        let mut tables = self.0.tables.lock().await;
        match tables.lake_requests.get_mut(&lake_request_id) {
            Some(r) if r.remaining_chains > 0 => {
                r.remaining_chains -= 1;
                Ok(Some(r.remaining_chains))
            }
            _ => Ok(None),
        }
    }
}

pub struct MemoryChainRepository(Arc<MemoryStore>);

#[async_trait]
impl ChainRepository for MemoryChainRepository {
    async fn create(&self, chain: &ChainRequest) -> Result<()> {
        let mut tables = self.0.tables.lock().await;
        tables.chains.insert(chain.chain_request_id, chain.clone());
        Ok(())
    }

    async fn get(&self, chain_request_id: Uuid) -> Result<Option<ChainRequest>> {
        let tables = self.0.tables.lock().await;
        Ok(tables.chains.get(&chain_request_id).cloned())
    }

    async fn save(&self, chain: &ChainRequest) -> Result<bool> {
        let mut tables = self.0.tables.lock().await;
        match tables.chains.get_mut(&chain.chain_request_id) {
            Some(stored) if stored.version == chain.version => {
                *stored = chain.clone();
                stored.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_callback(&self, lake_request_id: Uuid) -> Result<Vec<ChainRequest>> {
        let tables = self.0.tables.lock().await;
        let mut chains: Vec<ChainRequest> = tables
            .chains
            .values()
            .filter(|c| c.callback.map(|cb| cb.lake_request_id) == Some(lake_request_id))
            .cloned()
            .collect();
        chains.sort_by_key(|c| c.created_on);
        Ok(chains)
    }
}

// =============================================================================
// EVENT QUEUE
// =============================================================================

pub struct MemoryEventQueue(Arc<MemoryStore>);

impl Tables {
    /// Move an event out of the live queue into the bounded history.
    fn finish_event(&mut self, event_id: Uuid, status: EventStatus, error: Option<&str>) {
        let Some((_, mut event)) = self.events.remove(&event_id) else {
            return;
        };
        event.status = status;
        if let Some(error) = error {
            event.last_error = Some(error.to_string());
        }
        self.finished_events.insert(event_id, event);
        self.finished_order.push_back(event_id);
        while self.finished_order.len() > FINISHED_EVENTS_KEPT {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished_events.remove(&oldest);
            }
        }
    }
}

#[async_trait]
impl EventQueue for MemoryEventQueue {
    async fn publish(&self, event: LakeEvent) -> Result<Uuid> {
        self.publish_with(event, defaults::EVENT_MAX_ATTEMPTS, 0)
            .await
    }

    async fn publish_with(
        &self,
        event: LakeEvent,
        max_attempts: i32,
        delay_ms: i64,
    ) -> Result<Uuid> {
        let event_id = new_v7();
        let now = Utc::now();
        {
            let mut tables = self.0.tables.lock().await;
            tables.event_seq += 1;
            let seq = tables.event_seq;
            tables.events.insert(
                event_id,
                (
                    seq,
                    QueuedEvent {
                        event_id,
                        event,
                        status: EventStatus::Pending,
                        attempts: 0,
                        max_attempts: max_attempts.max(1),
                        available_on: now + Duration::milliseconds(delay_ms.max(0)),
                        last_error: None,
                        created_on: now,
                    },
                ),
            );
        }
        self.0.notify.notify_waiters();
        Ok(event_id)
    }

    async fn claim_next(&self, event_types: &[LakeEventType]) -> Result<Option<QueuedEvent>> {
        let mut tables = self.0.tables.lock().await;
        let now = Utc::now();
        let next = tables
            .events
            .values()
            .filter(|(_, e)| {
                e.status == EventStatus::Pending
                    && e.available_on <= now
                    && (event_types.is_empty() || event_types.contains(&e.event_type()))
            })
            .min_by_key(|(seq, e)| (e.available_on, *seq))
            .map(|(_, e)| e.event_id);
        let Some(event_id) = next else {
            return Ok(None);
        };
        let Some((_, event)) = tables.events.get_mut(&event_id) else {
            return Ok(None);
        };
        event.status = EventStatus::Running;
        event.attempts += 1;
        Ok(Some(event.clone()))
    }

    async fn complete(&self, event_id: Uuid) -> Result<()> {
        let mut tables = self.0.tables.lock().await;
        tables.finish_event(event_id, EventStatus::Completed, None);
        Ok(())
    }

    async fn retry(&self, event_id: Uuid, error: &str, delay_ms: i64) -> Result<()> {
        {
            let mut tables = self.0.tables.lock().await;
            if let Some((_, event)) = tables.events.get_mut(&event_id) {
                event.status = EventStatus::Pending;
                event.last_error = Some(error.to_string());
                event.available_on = Utc::now() + Duration::milliseconds(delay_ms.max(0));
            }
        }
        self.0.notify.notify_waiters();
        Ok(())
    }

    async fn fail(&self, event_id: Uuid, error: &str) -> Result<()> {
        let mut tables = self.0.tables.lock().await;
        tables.finish_event(event_id, EventStatus::Failed, Some(error));
        Ok(())
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<QueuedEvent>> {
        let tables = self.0.tables.lock().await;
        Ok(tables
            .events
            .get(&event_id)
            .map(|(_, e)| e)
            .or_else(|| tables.finished_events.get(&event_id))
            .cloned())
    }

    async fn pending_count(&self) -> Result<i64> {
        let tables = self.0.tables.lock().await;
        Ok(tables.events.len() as i64)
    }
}

// =============================================================================
// VECTOR INDEX
// =============================================================================

pub struct MemoryVectorIndex(Arc<MemoryStore>);

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, archive_id: &str, entry_id: Uuid, embedding: Vector) -> Result<()> {
        let mut tables = self.0.tables.lock().await;
        tables
            .embeddings
            .insert((archive_id.to_string(), entry_id), embedding);
        Ok(())
    }

    async fn query(
        &self,
        archive_id: &str,
        embedding: &Vector,
        prioritize_tags: &[String],
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        let tables = self.0.tables.lock().await;
        let members = tables
            .archive_entries
            .get(archive_id)
            .cloned()
            .unwrap_or_default();
        let mut scored: Vec<(bool, f32, Uuid)> = tables
            .embeddings
            .iter()
            .filter(|((archive, id), _)| archive == archive_id && members.contains(id))
            .map(|((_, id), vector)| {
                let tagged = tables
                    .entries
                    .get(id)
                    .is_some_and(|e| e.tags.iter().any(|t| prioritize_tags.contains(t)));
                (
                    tagged,
                    cosine_distance(vector.as_slice(), embedding.as_slice()),
                    *id,
                )
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        });
        Ok(scored
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, _, id)| id)
            .collect())
    }

    async fn remove(&self, archive_id: &str, entry_ids: &[Uuid]) -> Result<u64> {
        let mut tables = self.0.tables.lock().await;
        let mut removed = 0;
        for id in entry_ids {
            if tables
                .embeddings
                .remove(&(archive_id.to_string(), *id))
                .is_some()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::active_archive;

    #[test]
    fn test_cosine_distance_identical_is_zero() {
        let d = cosine_distance(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]);
        assert!(d.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_orthogonal_is_one() {
        let d = cosine_distance(&[1.0, 0.0], &[0.0, 1.0]);
        assert!((d - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_zero_vector() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[tokio::test]
    async fn test_index_requires_permitting_status() {
        let repos = repositories();
        let mut archive = active_archive("busy");
        archive.status = ArchiveStatus::Creating;
        repos.archives.create(&archive).await.unwrap();
        let entry = repos.entries.create(NewEntry::new("x")).await.unwrap();

        let err = repos
            .entries
            .index("busy", entry.entry_id, ArchiveOperation::Write)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArchiveBusy { .. }));

        repos
            .entries
            .index("busy", entry.entry_id, ArchiveOperation::Provision)
            .await
            .unwrap();
        assert_eq!(
            repos.entries.archive_entry_ids("busy").await.unwrap(),
            vec![entry.entry_id]
        );
    }

    #[tokio::test]
    async fn test_claim_respects_delay() {
        let repos = repositories();
        let lake_request_id = Uuid::new_v4();
        repos
            .events
            .publish_with(LakeEvent::LakeRequestProcess { lake_request_id }, 3, 60_000)
            .await
            .unwrap();
        assert!(repos.events.claim_next(&[]).await.unwrap().is_none());
        assert_eq!(repos.events.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_finished_events_leave_the_live_queue() {
        let store = MemoryStore::new();
        let repos = repositories_for(store.clone());
        let lake_request_id = Uuid::new_v4();
        let mut ids = Vec::new();
        for _ in 0..FINISHED_EVENTS_KEPT + 2 {
            let id = repos
                .events
                .publish(LakeEvent::LakeRequestProcess { lake_request_id })
                .await
                .unwrap();
            ids.push(id);
        }
        while let Some(event) = repos.events.claim_next(&[]).await.unwrap() {
            repos.events.complete(event.event_id).await.unwrap();
        }
        let dead = repos
            .events
            .publish(LakeEvent::LakeRequestInit { lake_request_id })
            .await
            .unwrap();
        repos.events.claim_next(&[]).await.unwrap();
        repos.events.fail(dead, "boom").await.unwrap();

        assert_eq!(repos.events.pending_count().await.unwrap(), 0);
        {
            let tables = store.tables.lock().await;
            assert!(tables.events.is_empty());
            assert_eq!(tables.finished_events.len(), FINISHED_EVENTS_KEPT);
        }

        // The oldest completions age out; recent ones stay readable.
        assert!(repos.events.get(ids[0]).await.unwrap().is_none());
        let recent = repos.events.get(ids[ids.len() - 1]).await.unwrap().unwrap();
        assert_eq!(recent.status, EventStatus::Completed);
        let failed = repos.events.get(dead).await.unwrap().unwrap();
        assert_eq!(failed.status, EventStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
    }
}
