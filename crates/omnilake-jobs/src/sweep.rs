//! Lookup timeout sweep.
//!
//! A lookup that never reports would leave its request in LOOKUP forever.
//! The sweep periodically force-completes requests whose countdown has been
//! outstanding longer than the timeout; processing then runs with whatever
//! sources were gathered. The same pass republishes processing for
//! countdowns that reached zero without it, and fails requests that have
//! sat in PROCESSING past the processing timeout.

use std::time::Duration;

use chrono::{DateTime, Utc};
use omnilake_core::{defaults, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::context::EngineContext;
use crate::coordinator::LookupCoordinator;
use crate::executor::fail_interrupted;

/// Configuration for the lookup timeout sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub enabled: bool,
    /// Age after which an outstanding countdown is force-completed.
    pub timeout_secs: u64,
    /// Age after which a request still in PROCESSING is failed.
    pub processing_timeout_secs: u64,
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: defaults::LOOKUP_TIMEOUT_SECS,
            processing_timeout_secs: defaults::PROCESSING_TIMEOUT_SECS,
            interval_secs: defaults::LOOKUP_SWEEP_INTERVAL_SECS,
        }
    }
}

impl SweepConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LOOKUP_SWEEP_ENABLED` | `true` | Enable/disable the sweep |
    /// | `LOOKUP_TIMEOUT_SECS` | `900` | Countdown age that counts as stalled |
    /// | `PROCESSING_TIMEOUT_SECS` | `1800` | PROCESSING age that counts as stuck |
    /// | `LOOKUP_SWEEP_INTERVAL_SECS` | `60` | Time between sweeps |
    pub fn from_env() -> Self {
        let enabled = std::env::var("LOOKUP_SWEEP_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let timeout_secs = std::env::var("LOOKUP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::LOOKUP_TIMEOUT_SECS);

        let processing_timeout_secs = std::env::var("PROCESSING_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::PROCESSING_TIMEOUT_SECS);

        let interval_secs = std::env::var("LOOKUP_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::LOOKUP_SWEEP_INTERVAL_SECS)
            .max(1);

        Self {
            enabled,
            timeout_secs,
            processing_timeout_secs,
            interval_secs,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_processing_timeout(mut self, secs: u64) -> Self {
        self.processing_timeout_secs = secs;
        self
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval_secs = secs.max(1);
        self
    }
}

/// The instant `secs` ago. Ages too large to represent reach back to the
/// earliest representable time, so nothing is ever old enough.
fn cutoff(secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Handle for stopping a running sweep.
pub struct SweepHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SweepHandle {
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| omnilake_core::Error::Internal("Failed to send shutdown signal".into()))
    }
}

pub struct LookupTimeoutSweep {
    ctx: EngineContext,
    coordinator: LookupCoordinator,
    config: SweepConfig,
}

impl LookupTimeoutSweep {
    pub fn new(ctx: EngineContext, config: SweepConfig) -> Self {
        Self {
            coordinator: LookupCoordinator::new(ctx.clone()),
            ctx,
            config,
        }
    }

    /// Move every stuck request on once: force-complete stalled
    /// countdowns, republish processing for finished ones, and fail
    /// requests stuck in PROCESSING. Returns how many requests this call
    /// moved; requests another sweeper got to first are not counted.
    pub async fn sweep_once(&self) -> Result<usize> {
        let stalled = self
            .ctx
            .repos
            .lake_requests
            .list_stalled_lookups(cutoff(self.config.timeout_secs))
            .await?;
        let stuck = self
            .ctx
            .repos
            .lake_requests
            .list_stalled_processing(cutoff(self.config.processing_timeout_secs))
            .await?;
        if stalled.is_empty() && stuck.is_empty() {
            debug!("No stalled requests");
            return Ok(0);
        }

        let mut moved = 0;
        for lake_request_id in stalled {
            let outcome = match self.coordinator.force_complete(lake_request_id).await {
                Ok(true) => Ok(true),
                Ok(false) => self.coordinator.resume(lake_request_id).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(true) => moved += 1,
                Ok(false) => debug!(%lake_request_id, "Lookups finished before the sweep"),
                Err(e) => warn!(%lake_request_id, error = %e, "Failed to force-complete lookups"),
            }
        }

        let message = format!(
            "Processing did not finish within {}s",
            self.config.processing_timeout_secs
        );
        for lake_request_id in stuck {
            let outcome = match self.ctx.repos.lake_requests.get(lake_request_id).await {
                Ok(Some(request)) if !request.is_closed() => {
                    fail_interrupted(&self.ctx, &request, &message).await.map(|_| true)
                }
                Ok(_) => Ok(false),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(true) => moved += 1,
                Ok(false) => debug!(%lake_request_id, "Request closed before the sweep"),
                Err(e) => warn!(%lake_request_id, error = %e, "Failed to fail stuck request"),
            }
        }
        info!(result_count = moved, "Lookup timeout sweep finished");
        Ok(moved)
    }

    /// Run the sweep on its interval until shut down.
    pub fn start(self) -> SweepHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            if !self.config.enabled {
                info!("Lookup timeout sweep is disabled, not starting");
                return;
            }
            info!(
                timeout_secs = self.config.timeout_secs,
                processing_timeout_secs = self.config.processing_timeout_secs,
                interval_secs = self.config.interval_secs,
                "Lookup timeout sweep started"
            );
            let mut interval =
                tokio::time::interval(Duration::from_secs(self.config.interval_secs));
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            error!(error = %e, "Lookup timeout sweep failed");
                        }
                    }
                }
            }
            info!("Lookup timeout sweep stopped");
        });
        SweepHandle { shutdown_tx }
    }
}
