//! # omnilake-db
//!
//! PostgreSQL storage layer for OmniLake.
//!
//! This crate provides:
//! - Connection pool management
//! - Repository implementations for the job ledger, archives, entries,
//!   sources, lake requests and chains
//! - The durable event queue
//! - Vector similarity search with pgvector
//! - In-memory implementations of every repository for tests and
//!   single-process deployments
//!
//! ## Example
//!
//! ```rust,ignore
//! use omnilake_db::{Database, ArchiveRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/omnilake").await?;
//!     for archive in db.archives.list().await? {
//!         println!("{} ({})", archive.archive_id, archive.status);
//!     }
//!     Ok(())
//! }
//! ```
pub mod archives;
pub mod chains;
pub mod entries;
pub mod events;
pub mod jobs;
pub mod lake_requests;
pub mod memory;
pub mod pool;
pub mod vectors;

// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

use std::sync::Arc;

use tokio::sync::Notify;

// Re-export core types
pub use omnilake_core::*;

pub use archives::PgArchiveRepository;
pub use chains::PgChainRepository;
pub use entries::{PgEntryRepository, PgSourceRepository};
pub use events::PgEventQueue;
pub use jobs::PgJobRepository;
pub use lake_requests::PgLakeRequestRepository;
pub use pool::{create_pool, create_pool_with_config, PoolConfig};
pub use vectors::PgVectorIndex;

/// Every repository behind its trait, shareable across tasks.
///
/// Engine components take this bundle rather than a concrete backend so the
/// same code runs on PostgreSQL and on the in-memory store.
#[derive(Clone)]
pub struct Repositories {
    pub jobs: Arc<dyn JobRepository>,
    pub archives: Arc<dyn ArchiveRepository>,
    pub entries: Arc<dyn EntryRepository>,
    pub sources: Arc<dyn SourceRepository>,
    pub lake_requests: Arc<dyn LakeRequestRepository>,
    pub chains: Arc<dyn ChainRepository>,
    pub events: Arc<dyn EventQueue>,
    pub vectors: Arc<dyn VectorIndex>,
    /// Signalled whenever an event is published.
    pub event_notify: Arc<Notify>,
}

/// Combined database context with all repositories.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Job ledger.
    pub jobs: PgJobRepository,
    pub archives: PgArchiveRepository,
    pub entries: PgEntryRepository,
    pub sources: PgSourceRepository,
    pub lake_requests: PgLakeRequestRepository,
    pub chains: PgChainRepository,
    /// Engine event queue.
    pub events: PgEventQueue,
    /// pgvector similarity index.
    pub vectors: PgVectorIndex,
    event_notify: Arc<Notify>,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        let event_notify = Arc::new(Notify::new());
        Self {
            jobs: PgJobRepository::new(pool.clone()),
            archives: PgArchiveRepository::new(pool.clone()),
            entries: PgEntryRepository::new(pool.clone()),
            sources: PgSourceRepository::new(pool.clone()),
            lake_requests: PgLakeRequestRepository::new(pool.clone()),
            chains: PgChainRepository::new(pool.clone()),
            events: PgEventQueue::with_notify(pool.clone(), event_notify.clone()),
            vectors: PgVectorIndex::new(pool.clone()),
            event_notify,
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Trait-object view of every repository, sharing this pool.
    pub fn repositories(&self) -> Repositories {
        let pool = self.pool.clone();
        Repositories {
            jobs: Arc::new(PgJobRepository::new(pool.clone())),
            archives: Arc::new(PgArchiveRepository::new(pool.clone())),
            entries: Arc::new(PgEntryRepository::new(pool.clone())),
            sources: Arc::new(PgSourceRepository::new(pool.clone())),
            lake_requests: Arc::new(PgLakeRequestRepository::new(pool.clone())),
            chains: Arc::new(PgChainRepository::new(pool.clone())),
            events: Arc::new(PgEventQueue::with_notify(
                pool.clone(),
                self.event_notify.clone(),
            )),
            vectors: Arc::new(PgVectorIndex::new(pool)),
            event_notify: self.event_notify.clone(),
        }
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            jobs: PgJobRepository::new(self.pool.clone()),
            archives: PgArchiveRepository::new(self.pool.clone()),
            entries: PgEntryRepository::new(self.pool.clone()),
            sources: PgSourceRepository::new(self.pool.clone()),
            lake_requests: PgLakeRequestRepository::new(self.pool.clone()),
            chains: PgChainRepository::new(self.pool.clone()),
            events: PgEventQueue::with_notify(self.pool.clone(), self.event_notify.clone()),
            vectors: PgVectorIndex::new(self.pool.clone()),
            event_notify: self.event_notify.clone(),
        }
    }
}
