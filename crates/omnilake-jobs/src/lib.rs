//! # omnilake-jobs
//!
//! The OmniLake orchestration engine.
//!
//! This crate provides:
//! - A job ledger wrapper that records every unit of work and propagates
//!   failures to ancestor jobs
//! - Lake request execution: lookup fan-out, an exactly-once lookup
//!   countdown, processing and responses
//! - Chains with conditional steps, validation gates and `REF:` resolution
//!   between steps
//! - Archive maintenance locking with VACUUM and REINDEX jobs
//! - A timeout sweep for lookups that never report
//! - An event worker that drives all of the above from a durable queue
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use omnilake_jobs::{EngineContext, LakeService, SweepConfig, WorkerConfig};
//! use omnilake_inference::OllamaBackend;
//! use omnilake_db::Database;
//!
//! let db = Database::connect("postgres://...").await?;
//! let backend = Arc::new(OllamaBackend::from_env());
//! let service = LakeService::new(EngineContext::new(
//!     db.repositories(),
//!     backend.clone(),
//!     backend,
//! ));
//!
//! let worker = service.worker(WorkerConfig::from_env()).await.start();
//! let sweep = service.sweep(SweepConfig::from_env()).start();
//!
//! let submitted = service.submit_lake_request(body).await?;
//! // ... later
//! let description = service.describe_lake_request(submitted.lake_request_id).await?;
//!
//! worker.shutdown().await?;
//! sweep.shutdown().await?;
//! ```

pub mod chain;
pub mod chain_validation;
pub mod context;
pub mod coordinator;
pub mod executor;
pub mod handler;
pub mod ledger;
pub mod lookups;
pub mod maintenance;
pub mod processors;
pub mod references;
pub mod responders;
pub mod service;
pub mod storage;
pub mod sweep;
pub mod worker;

// Re-export core types
pub use omnilake_core::*;

pub use chain::{launch_chain, ChainOrchestrator};
pub use chain_validation::{validate_chain, ChainAnalysis};
pub use context::EngineContext;
pub use coordinator::{LookupCoordinator, LookupReport};
pub use executor::RequestExecutor;
pub use handler::{EventContext, EventHandler, HandlerResult};
pub use ledger::{ExecutionOptions, JobLedger};
pub use lookups::LookupRunner;
pub use maintenance::{MaintenanceHandler, MaintenanceLock};
pub use processors::{
    InceptionProcessor, KnowledgeGraph, KnowledgeGraphProcessor, ProcessingOutcome,
    ProcessingOutput, Summarizer,
};
pub use references::{ReferenceResolver, Resolution};
pub use responders::Responder;
pub use service::{AddEntryRequest, ChainSubmission, LakeService};
pub use storage::EntryStore;
pub use sweep::{LookupTimeoutSweep, SweepConfig, SweepHandle};
pub use worker::{EventWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
