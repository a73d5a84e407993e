//! pgvector-backed similarity index, partitioned by archive.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use omnilake_core::{Error, Result, VectorIndex};

/// PostgreSQL implementation of VectorIndex.
pub struct PgVectorIndex {
    pool: Pool<Postgres>,
}

impl PgVectorIndex {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn upsert(&self, archive_id: &str, entry_id: Uuid, embedding: Vector) -> Result<()> {
        sqlx::query(
            "INSERT INTO entry_embeddings (archive_id, entry_id, embedding)
             VALUES ($1, $2, $3)
             ON CONFLICT (archive_id, entry_id) DO UPDATE
             SET embedding = EXCLUDED.embedding, updated_on = now()",
        )
        .bind(archive_id)
        .bind(entry_id)
        .bind(embedding)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn query(
        &self,
        archive_id: &str,
        embedding: &Vector,
        prioritize_tags: &[String],
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            "SELECT ee.entry_id
             FROM entry_embeddings ee
             JOIN archive_entries ae
               ON ae.archive_id = ee.archive_id AND ae.entry_id = ee.entry_id
             JOIN entries e ON e.entry_id = ee.entry_id
             WHERE ee.archive_id = $1
             ORDER BY (e.tags && $3::text[]) DESC, ee.embedding <=> $2
             LIMIT $4",
        )
        .bind(archive_id)
        .bind(embedding)
        .bind(prioritize_tags)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(ids)
    }

    async fn remove(&self, archive_id: &str, entry_ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM entry_embeddings WHERE archive_id = $1 AND entry_id = ANY($2)",
        )
        .bind(archive_id)
        .bind(entry_ids)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}
