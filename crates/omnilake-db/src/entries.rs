//! Entry and source repository implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use omnilake_core::{
    ArchiveOperation, ArchiveStatus, Entry, EntryRepository, Error, NewEntry, Result, Source,
    SourceRepository,
};

const ENTRY_COLUMNS: &str = "entry_id, content, char_count, content_hash, sources, \
                             original_of_source, tags, effective_on, created_on";

/// PostgreSQL implementation of EntryRepository.
pub struct PgEntryRepository {
    pool: Pool<Postgres>,
}

impl PgEntryRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_entry_row(row: sqlx::postgres::PgRow) -> Entry {
        Entry {
            entry_id: row.get("entry_id"),
            content: row.get("content"),
            char_count: row.get("char_count"),
            content_hash: row.get("content_hash"),
            sources: row.get("sources"),
            original_of_source: row.get("original_of_source"),
            tags: row.get("tags"),
            effective_on: row.get("effective_on"),
            created_on: row.get("created_on"),
        }
    }
}

#[async_trait]
impl EntryRepository for PgEntryRepository {
    async fn create(&self, entry: NewEntry) -> Result<Entry> {
        let entry = entry.into_entry();
        sqlx::query(
            "INSERT INTO entries (entry_id, content, char_count, content_hash, sources,
                                  original_of_source, tags, effective_on, created_on)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.entry_id)
        .bind(&entry.content)
        .bind(entry.char_count)
        .bind(&entry.content_hash)
        .bind(&entry.sources)
        .bind(&entry.original_of_source)
        .bind(&entry.tags)
        .bind(entry.effective_on)
        .bind(entry.created_on)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(entry)
    }

    async fn get(&self, entry_id: Uuid) -> Result<Option<Entry>> {
        let query = format!("SELECT {} FROM entries WHERE entry_id = $1", ENTRY_COLUMNS);
        let row = sqlx::query(&query)
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(Self::parse_entry_row))
    }

    async fn get_many(&self, entry_ids: &[Uuid]) -> Result<Vec<Entry>> {
        if entry_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT {} FROM entries WHERE entry_id = ANY($1)",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(entry_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        let mut found: HashMap<Uuid, Entry> = rows
            .into_iter()
            .map(Self::parse_entry_row)
            .map(|e| (e.entry_id, e))
            .collect();
        Ok(entry_ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    async fn index(
        &self,
        archive_id: &str,
        entry_id: Uuid,
        operation: ArchiveOperation,
    ) -> Result<()> {
        let permitted: Vec<&str> = ArchiveStatus::permitting(operation)
            .iter()
            .map(ArchiveStatus::as_str)
            .collect();
        let result = sqlx::query(
            "INSERT INTO archive_entries (archive_id, entry_id)
             SELECT a.archive_id, $2 FROM archives a
             WHERE a.archive_id = $1 AND a.status = ANY($3)
             ON CONFLICT (archive_id, entry_id) DO NOTHING",
        )
        .bind(archive_id)
        .bind(entry_id)
        .bind(&permitted)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Nothing inserted: either already indexed or the archive refused.
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM archives WHERE archive_id = $1")
                .bind(archive_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        let status: ArchiveStatus = status
            .ok_or_else(|| Error::NotFound(format!("archive {}", archive_id)))?
            .parse()?;
        if status.permits(operation) {
            Ok(())
        } else {
            Err(Error::ArchiveBusy {
                archive_id: archive_id.to_string(),
                status,
            })
        }
    }

    async fn list_archive_entries(
        &self,
        archive_id: &str,
        prioritize_tags: &[String],
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            "SELECT e.entry_id
             FROM archive_entries ae
             JOIN entries e ON e.entry_id = ae.entry_id
             WHERE ae.archive_id = $1
             ORDER BY (e.tags && $2::text[]) DESC, e.effective_on DESC, e.created_on DESC
             LIMIT $3",
        )
        .bind(archive_id)
        .bind(prioritize_tags)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(ids)
    }

    async fn archive_entry_ids(&self, archive_id: &str) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            "SELECT entry_id FROM archive_entries WHERE archive_id = $1 ORDER BY added_on",
        )
        .bind(archive_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(ids)
    }

    async fn superseded_originals(&self, archive_id: &str) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            "SELECT e.entry_id
             FROM archive_entries ae
             JOIN entries e ON e.entry_id = ae.entry_id
             JOIN sources s ON e.original_of_source = s.source_type || '/' || s.source_id
             WHERE ae.archive_id = $1
               AND s.latest_content_entry_id IS DISTINCT FROM e.entry_id",
        )
        .bind(archive_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(ids)
    }

    async fn remove_from_archive(&self, archive_id: &str, entry_ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM archive_entries WHERE archive_id = $1 AND entry_id = ANY($2)",
        )
        .bind(archive_id)
        .bind(entry_ids)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}

/// PostgreSQL implementation of SourceRepository.
pub struct PgSourceRepository {
    pool: Pool<Postgres>,
}

impl PgSourceRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceRepository for PgSourceRepository {
    async fn get(&self, source_type: &str, source_id: &str) -> Result<Option<Source>> {
        let row = sqlx::query(
            "SELECT source_type, source_id, source_arguments, latest_content_entry_id, added_on
             FROM sources WHERE source_type = $1 AND source_id = $2",
        )
        .bind(source_type)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.map(|row| Source {
            source_type: row.get("source_type"),
            source_id: row.get("source_id"),
            source_arguments: row.get("source_arguments"),
            latest_content_entry_id: row.get("latest_content_entry_id"),
            added_on: row.get("added_on"),
        }))
    }

    async fn put(&self, source: &Source) -> Result<()> {
        sqlx::query(
            "INSERT INTO sources (source_type, source_id, source_arguments,
                                  latest_content_entry_id, added_on)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (source_type, source_id) DO UPDATE
             SET source_arguments = EXCLUDED.source_arguments,
                 latest_content_entry_id = EXCLUDED.latest_content_entry_id",
        )
        .bind(&source.source_type)
        .bind(&source.source_id)
        .bind(&source.source_arguments)
        .bind(source.latest_content_entry_id)
        .bind(source.added_on)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}
