//! Event worker: claims queued engine events and dispatches them to handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use omnilake_core::defaults;
use omnilake_core::{LakeEventType, QueuedEvent, Result};
use omnilake_db::Repositories;

use crate::handler::{EventContext, EventHandler, HandlerResult};

/// Configuration for the event worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds when the queue is empty.
    pub poll_interval_ms: u64,
    /// Maximum number of events handled concurrently.
    pub max_concurrent_events: usize,
    /// Whether to process events at all.
    pub enabled: bool,
    /// Retry delay per attempt already made.
    pub retry_backoff_ms: i64,
    /// Upper bound on one handler invocation.
    pub handler_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::EVENT_POLL_INTERVAL_MS,
            max_concurrent_events: defaults::EVENT_MAX_CONCURRENT,
            enabled: true,
            retry_backoff_ms: defaults::EVENT_RETRY_BACKOFF_MS,
            handler_timeout_secs: defaults::EVENT_HANDLER_TIMEOUT_SECS,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `EVENT_WORKER_ENABLED` | `true` | Enable/disable event processing |
    /// | `EVENT_MAX_CONCURRENT` | `4` | Max concurrent events |
    /// | `EVENT_POLL_INTERVAL_MS` | `500` | Polling interval when queue is empty |
    /// | `EVENT_RETRY_BACKOFF_MS` | `2000` | Retry delay per attempt made |
    pub fn from_env() -> Self {
        let enabled = std::env::var("EVENT_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_events = std::env::var("EVENT_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::EVENT_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("EVENT_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::EVENT_POLL_INTERVAL_MS);

        let retry_backoff_ms = std::env::var("EVENT_RETRY_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(defaults::EVENT_RETRY_BACKOFF_MS)
            .max(0);

        Self {
            poll_interval_ms,
            max_concurrent_events,
            enabled,
            retry_backoff_ms,
            ..Default::default()
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent events.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_events = max;
        self
    }

    /// Enable or disable event processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_retry_backoff(mut self, ms: i64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    pub fn with_handler_timeout(mut self, secs: u64) -> Self {
        self.handler_timeout_secs = secs;
        self
    }
}

/// Event emitted by the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    EventStarted {
        event_id: Uuid,
        event_type: LakeEventType,
    },
    EventCompleted {
        event_id: Uuid,
        event_type: LakeEventType,
    },
    /// The event goes back to the queue.
    EventRetried {
        event_id: Uuid,
        event_type: LakeEventType,
        error: String,
    },
    /// The event was dead-lettered.
    EventFailed {
        event_id: Uuid,
        event_type: LakeEventType,
        error: String,
    },
    WorkerStarted,
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| omnilake_core::Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

type HandlerMap = Arc<RwLock<HashMap<LakeEventType, Arc<dyn EventHandler>>>>;

/// Worker that drains the engine event queue.
pub struct EventWorker {
    repos: Repositories,
    config: WorkerConfig,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl EventWorker {
    pub fn new(repos: Repositories, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            repos,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    /// Register a handler for every event type it declares.
    pub async fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        for event_type in handler.event_types() {
            handlers.insert(event_type, handler.clone());
            debug!(%event_type, "Registered event handler");
        }
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let worker = Arc::new(self);
        let worker_clone = worker.clone();

        tokio::spawn(async move {
            worker_clone.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Claims up to `max_concurrent_events` at a time and handles them
    /// concurrently; sleeps only when nothing could be claimed.
    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Event worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_events,
            "Event worker started"
        );

        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Event worker received shutdown signal");
                break;
            }

            let claimed = self.drain_batch().await;

            if claimed == 0 {
                // Woken early by a publish on this process.
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Event worker received shutdown signal");
                        break;
                    }
                    _ = self.repos.event_notify.notified() => {}
                    _ = sleep(poll_interval) => {}
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Event worker stopped");
    }

    /// Handle events until the queue holds nothing pending or running.
    /// Returns the number of deliveries made.
    ///
    /// Used by tests and one-shot tools; delayed retries are waited out.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut delivered = 0;
        loop {
            let claimed = self.drain_batch().await;
            delivered += claimed;
            if claimed == 0 {
                if self.repos.events.pending_count().await? == 0 {
                    return Ok(delivered);
                }
                sleep(Duration::from_millis(self.config.poll_interval_ms.max(1))).await;
            }
        }
    }

    /// Claim and handle one batch; returns how many events were claimed.
    async fn drain_batch(&self) -> usize {
        let mut claimed = 0;
        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..self.config.max_concurrent_events.max(1) {
            match self.claim_event().await {
                Some(queued) => {
                    claimed += 1;
                    let worker = self.clone_refs();
                    tasks.spawn(async move {
                        worker.execute_event(queued).await;
                    });
                }
                None => break,
            }
        }

        if claimed > 0 {
            debug!(claimed, "Processing concurrent event batch");
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = ?e, "Event task panicked");
                }
            }
        }
        claimed
    }

    async fn claim_event(&self) -> Option<QueuedEvent> {
        let event_types: Vec<LakeEventType> = {
            let handlers = self.handlers.read().await;
            handlers.keys().copied().collect()
        };
        if event_types.is_empty() {
            return None;
        }

        match self.repos.events.claim_next(&event_types).await {
            Ok(queued) => queued,
            Err(e) => {
                error!(error = ?e, "Failed to claim event");
                None
            }
        }
    }

    fn clone_refs(&self) -> EventWorkerRef {
        EventWorkerRef {
            repos: self.repos.clone(),
            config: self.config.clone(),
            handlers: self.handlers.clone(),
            event_tx: self.event_tx.clone(),
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// PENDING or RUNNING events in the queue.
    pub async fn pending_count(&self) -> Result<i64> {
        self.repos.events.pending_count().await
    }
}

/// Reference bundle for handling a single event in a spawned task.
struct EventWorkerRef {
    repos: Repositories,
    config: WorkerConfig,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl EventWorkerRef {
    async fn execute_event(self, queued: QueuedEvent) {
        let start = Instant::now();
        let event_id = queued.event_id;
        let event_type = queued.event_type();
        let attempts = queued.attempts;
        let can_retry = queued.can_retry();
        let correlation_id = queued.event.correlation_id();

        info!(%event_id, %event_type, %correlation_id, attempt = attempts, "Processing event");

        let _ = self.event_tx.send(WorkerEvent::EventStarted {
            event_id,
            event_type,
        });

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&event_type).cloned()
        };

        let result = match handler {
            Some(handler) => {
                let timeout = Duration::from_secs(self.config.handler_timeout_secs);
                match tokio::time::timeout(timeout, handler.handle(EventContext::new(queued)))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            %event_id,
                            %event_type,
                            "Event exceeded timeout of {}s",
                            self.config.handler_timeout_secs
                        );
                        HandlerResult::Retry(format!(
                            "Event exceeded timeout of {}s",
                            self.config.handler_timeout_secs
                        ))
                    }
                }
            }
            None => {
                warn!(%event_type, "No handler registered for event type");
                HandlerResult::Failed(format!("No handler for event type: {}", event_type))
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            HandlerResult::Success => {
                if let Err(e) = self.repos.events.complete(event_id).await {
                    error!(error = ?e, %event_id, "Failed to mark event as completed");
                } else {
                    debug!(%event_id, %event_type, duration_ms, "Event completed");
                    let _ = self.event_tx.send(WorkerEvent::EventCompleted {
                        event_id,
                        event_type,
                    });
                }
            }
            HandlerResult::Retry(error) if can_retry => {
                let delay_ms = self.config.retry_backoff_ms * i64::from(attempts);
                if let Err(e) = self.repos.events.retry(event_id, &error, delay_ms).await {
                    error!(error = ?e, %event_id, "Failed to requeue event");
                } else {
                    warn!(%event_id, %event_type, %error, delay_ms, duration_ms, "Event will be retried");
                    let _ = self.event_tx.send(WorkerEvent::EventRetried {
                        event_id,
                        event_type,
                        error,
                    });
                }
            }
            HandlerResult::Failed(error) | HandlerResult::Retry(error) => {
                if let Err(e) = self.repos.events.fail(event_id, &error).await {
                    error!(error = ?e, %event_id, "Failed to dead-letter event");
                } else {
                    error!(%event_id, %event_type, %error, duration_ms, "Event failed");
                    let _ = self.event_tx.send(WorkerEvent::EventFailed {
                        event_id,
                        event_type,
                        error,
                    });
                }
            }
        }
    }
}

/// Builder for creating an event worker with handlers.
pub struct WorkerBuilder {
    repos: Repositories,
    config: WorkerConfig,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl WorkerBuilder {
    pub fn new(repos: Repositories) -> Self {
        Self {
            repos,
            config: WorkerConfig::default(),
            handlers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler<H: EventHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn with_shared_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Build and return the worker.
    pub async fn build(self) -> EventWorker {
        let worker = EventWorker::new(self.repos, self.config);
        for handler in self.handlers {
            worker.register_handler(handler).await;
        }
        worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use omnilake_core::{EventStatus, LakeEvent};
    use omnilake_db::memory;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        outcome: fn(&EventContext) -> HandlerResult,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn event_types(&self) -> Vec<LakeEventType> {
            vec![LakeEventType::ChainStart]
        }

        async fn handle(&self, ctx: EventContext) -> HandlerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)(&ctx)
        }
    }

    fn chain_start() -> LakeEvent {
        LakeEvent::ChainStart {
            chain_request_id: Uuid::now_v7(),
        }
    }

    async fn worker_with(
        repos: Repositories,
        outcome: fn(&EventContext) -> HandlerResult,
    ) -> (EventWorker, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = WorkerBuilder::new(repos)
            .with_config(WorkerConfig::default().with_retry_backoff(0).with_poll_interval(1))
            .with_handler(CountingHandler {
                calls: calls.clone(),
                outcome,
            })
            .build()
            .await;
        (worker, calls)
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.max_concurrent_events, 4);
        assert_eq!(config.retry_backoff_ms, 2_000);
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(1000)
            .with_max_concurrent(8)
            .with_enabled(false)
            .with_retry_backoff(10);

        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.max_concurrent_events, 8);
        assert!(!config.enabled);
        assert_eq!(config.retry_backoff_ms, 10);
    }

    // ========== QUEUE DRAINING ==========

    #[tokio::test]
    async fn test_success_completes_event() {
        let repos = memory::repositories();
        let event_id = repos.events.publish(chain_start()).await.unwrap();
        let (worker, calls) = worker_with(repos.clone(), |_| HandlerResult::Success).await;

        assert_eq!(worker.run_until_idle().await.unwrap(), 1);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = repos.events.get(event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn test_retry_until_attempts_exhausted_then_dead_letter() {
        let repos = memory::repositories();
        let event_id = repos
            .events
            .publish_with(chain_start(), 3, 0)
            .await
            .unwrap();
        let (worker, calls) =
            worker_with(repos.clone(), |_| HandlerResult::Retry("archive busy".into())).await;

        worker.run_until_idle().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stored = repos.events.get(event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("archive busy"));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let repos = memory::repositories();
        let event_id = repos.events.publish(chain_start()).await.unwrap();
        let (worker, calls) = worker_with(repos.clone(), |ctx| {
            if ctx.attempt() < 2 {
                HandlerResult::Retry("not yet".into())
            } else {
                HandlerResult::Success
            }
        })
        .await;

        worker.run_until_idle().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stored = repos.events.get(event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn test_unhandled_event_types_are_not_claimed() {
        let repos = memory::repositories();
        let other = repos
            .events
            .publish(LakeEvent::LakeRequestInit {
                lake_request_id: Uuid::now_v7(),
            })
            .await
            .unwrap();
        repos.events.publish(chain_start()).await.unwrap();
        let (worker, _calls) = worker_with(repos.clone(), |_| HandlerResult::Success).await;

        assert_eq!(worker.drain_batch().await, 1);
        let stored = repos.events.get(other).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Pending);
    }

    #[tokio::test]
    async fn test_started_worker_shuts_down() {
        let repos = memory::repositories();
        let (worker, _calls) = worker_with(repos, |_| HandlerResult::Success).await;
        let handle = worker.start();
        let mut events = handle.events();
        handle.shutdown().await.unwrap();
        let mut stopped = false;
        while let Ok(event) =
            tokio::time::timeout(Duration::from_secs(5), events.recv()).await
        {
            if matches!(event, Ok(WorkerEvent::WorkerStopped)) {
                stopped = true;
                break;
            }
        }
        assert!(stopped);
    }
}
