//! Archive repository implementation.
//!
//! Maintenance begin/end are single conditional UPDATE statements over the
//! holder array, so concurrent holders never lose each other's tokens.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use omnilake_core::{
    Archive, ArchiveRepository, ArchiveStatus, Error, MaintenanceOutcome, Result,
};

const ARCHIVE_COLUMNS: &str = "archive_id, description, status, visibility, storage_type, \
                               retain_latest_originals_only, tag_hint_instructions, \
                               configuration, status_context_job_ids, created_on, updated_on";

/// PostgreSQL implementation of ArchiveRepository.
pub struct PgArchiveRepository {
    pool: Pool<Postgres>,
}

impl PgArchiveRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub(crate) fn parse_archive_row(row: sqlx::postgres::PgRow) -> Result<Archive> {
        let status: String = row.get("status");
        let visibility: String = row.get("visibility");
        Ok(Archive {
            archive_id: row.get("archive_id"),
            description: row.get("description"),
            status: status.parse()?,
            visibility: visibility.parse()?,
            storage_type: row.get("storage_type"),
            retain_latest_originals_only: row.get("retain_latest_originals_only"),
            tag_hint_instructions: row.get("tag_hint_instructions"),
            configuration: row.get("configuration"),
            status_context_job_ids: row.get("status_context_job_ids"),
            created_on: row.get("created_on"),
            updated_on: row.get("updated_on"),
        })
    }

    /// Classify a maintenance update that matched no row.
    async fn unchanged_or_busy(
        &self,
        archive_id: &str,
        token: &str,
        begin: bool,
    ) -> Result<MaintenanceOutcome> {
        let archive = self.require(archive_id).await?;
        let held = archive.status_context_job_ids.iter().any(|t| t == token);
        if begin && !held {
            return Err(Error::ArchiveBusy {
                archive_id: archive.archive_id,
                status: archive.status,
            });
        }
        let op = if begin {
            "begin_maintenance"
        } else {
            "end_maintenance"
        };
        debug!(
            subsystem = "db",
            component = "archives",
            op,
            archive_id,
            token,
            "Redundant maintenance call"
        );
        Ok(MaintenanceOutcome::Unchanged(archive))
    }
}

#[async_trait]
impl ArchiveRepository for PgArchiveRepository {
    async fn create(&self, archive: &Archive) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO archives (archive_id, description, status, visibility, storage_type,
                                   retain_latest_originals_only, tag_hint_instructions,
                                   configuration, status_context_job_ids, created_on, updated_on)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (archive_id) DO NOTHING",
        )
        .bind(&archive.archive_id)
        .bind(&archive.description)
        .bind(archive.status.as_str())
        .bind(archive.visibility.as_str())
        .bind(&archive.storage_type)
        .bind(archive.retain_latest_originals_only)
        .bind(&archive.tag_hint_instructions)
        .bind(&archive.configuration)
        .bind(&archive.status_context_job_ids)
        .bind(archive.created_on)
        .bind(archive.updated_on)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::InvalidInput(format!(
                "archive {} already exists",
                archive.archive_id
            )));
        }
        Ok(())
    }

    async fn get(&self, archive_id: &str) -> Result<Option<Archive>> {
        let query = format!(
            "SELECT {} FROM archives WHERE archive_id = $1",
            ARCHIVE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(archive_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(Self::parse_archive_row).transpose()
    }

    async fn list(&self) -> Result<Vec<Archive>> {
        let query = format!("SELECT {} FROM archives ORDER BY archive_id", ARCHIVE_COLUMNS);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.into_iter().map(Self::parse_archive_row).collect()
    }

    async fn transition_status(
        &self,
        archive_id: &str,
        from: ArchiveStatus,
        to: ArchiveStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE archives SET status = $3, updated_on = now()
             WHERE archive_id = $1 AND status = $2",
        )
        .bind(archive_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn begin_maintenance(&self, archive_id: &str, token: &str) -> Result<MaintenanceOutcome> {
        let query = format!(
            "UPDATE archives
             SET status_context_job_ids = array_append(status_context_job_ids, $2),
                 status = 'MAINTENANCE',
                 updated_on = now()
             WHERE archive_id = $1
               AND status IN ('ACTIVE', 'MAINTENANCE')
               AND NOT ($2 = ANY(status_context_job_ids))
             RETURNING {}",
            ARCHIVE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(archive_id)
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        match row {
            Some(row) => Ok(MaintenanceOutcome::Applied(Self::parse_archive_row(row)?)),
            None => self.unchanged_or_busy(archive_id, token, true).await,
        }
    }

    async fn end_maintenance(&self, archive_id: &str, token: &str) -> Result<MaintenanceOutcome> {
        let query = format!(
            "UPDATE archives
             SET status_context_job_ids = array_remove(status_context_job_ids, $2),
                 status = CASE
                     WHEN cardinality(array_remove(status_context_job_ids, $2)) = 0
                     THEN 'ACTIVE'
                     ELSE status
                 END,
                 updated_on = now()
             WHERE archive_id = $1
               AND $2 = ANY(status_context_job_ids)
             RETURNING {}",
            ARCHIVE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(archive_id)
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        match row {
            Some(row) => Ok(MaintenanceOutcome::Applied(Self::parse_archive_row(row)?)),
            None => self.unchanged_or_busy(archive_id, token, false).await,
        }
    }
}
