//! Lake request repository implementation.
//!
//! The lookup countdown lives in `remaining_lookups`. Every report is one
//! conditional UPDATE that unions the reported entries into
//! `response_sources` and decrements the counter, so exactly one reporter
//! observes zero no matter how the reports interleave.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use tracing::trace;
use uuid::Uuid;

use omnilake_core::{
    Error, JobStatus, LakeRequest, LakeRequestRepository, LakeRequestStage, Result,
};

const REQUEST_COLUMNS: &str = "lake_request_id, job_id, job_type, chain_request_id, \
                               lookup_instructions, processing_instructions, response_config, \
                               remaining_lookups, response_sources, remaining_chains, \
                               response_entry_id, stage, request_status, created_on, \
                               lookups_started_on, stage_updated_on, closed_on";

/// PostgreSQL implementation of LakeRequestRepository.
pub struct PgLakeRequestRepository {
    pool: Pool<Postgres>,
}

impl PgLakeRequestRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_request_row(row: sqlx::postgres::PgRow) -> Result<LakeRequest> {
        let job_type: String = row.get("job_type");
        let stage: String = row.get("stage");
        let request_status: String = row.get("request_status");
        let lookup_instructions: serde_json::Value = row.get("lookup_instructions");
        let processing_instructions: serde_json::Value = row.get("processing_instructions");
        let response_config: serde_json::Value = row.get("response_config");
        Ok(LakeRequest {
            lake_request_id: row.get("lake_request_id"),
            job_id: row.get("job_id"),
            job_type: job_type.parse()?,
            chain_request_id: row.get("chain_request_id"),
            lookup_instructions: serde_json::from_value(lookup_instructions)?,
            processing_instructions: serde_json::from_value(processing_instructions)?,
            response_config: serde_json::from_value(response_config)?,
            remaining_lookups: row.get("remaining_lookups"),
            response_sources: row.get("response_sources"),
            remaining_chains: row.get("remaining_chains"),
            response_entry_id: row.get("response_entry_id"),
            stage: stage.parse()?,
            request_status: request_status.parse()?,
            created_on: row.get("created_on"),
            lookups_started_on: row.get("lookups_started_on"),
            stage_updated_on: row.get("stage_updated_on"),
            closed_on: row.get("closed_on"),
        })
    }
}

#[async_trait]
impl LakeRequestRepository for PgLakeRequestRepository {
    async fn create(&self, request: &LakeRequest) -> Result<()> {
        sqlx::query(
            "INSERT INTO lake_requests (lake_request_id, job_id, job_type, chain_request_id,
                                        lookup_instructions, processing_instructions,
                                        response_config, remaining_lookups, response_sources,
                                        remaining_chains, response_entry_id, stage,
                                        request_status, created_on, lookups_started_on,
                                        stage_updated_on, closed_on)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(request.lake_request_id)
        .bind(request.job_id)
        .bind(request.job_type.as_str())
        .bind(request.chain_request_id)
        .bind(serde_json::to_value(&request.lookup_instructions)?)
        .bind(serde_json::to_value(&request.processing_instructions)?)
        .bind(serde_json::to_value(&request.response_config)?)
        .bind(request.remaining_lookups)
        .bind(&request.response_sources)
        .bind(request.remaining_chains)
        .bind(request.response_entry_id)
        .bind(request.stage.as_str())
        .bind(request.request_status.as_str())
        .bind(request.created_on)
        .bind(request.lookups_started_on)
        .bind(request.stage_updated_on)
        .bind(request.closed_on)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, lake_request_id: Uuid) -> Result<Option<LakeRequest>> {
        let query = format!(
            "SELECT {} FROM lake_requests WHERE lake_request_id = $1",
            REQUEST_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(lake_request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(Self::parse_request_row).transpose()
    }

    async fn add_lookup_results(
        &self,
        lake_request_id: Uuid,
        entry_ids: &[Uuid],
    ) -> Result<Option<i32>> {
        // New ids keep their reported order and are appended after the
        // existing sources; duplicates within and across reports collapse.
        let remaining: Option<i32> = sqlx::query_scalar(
            "UPDATE lake_requests lr
             SET response_sources = lr.response_sources || COALESCE((
                     SELECT array_agg(n.id ORDER BY n.ord)
                     FROM (
                         SELECT u.id, min(u.ord) AS ord
                         FROM unnest($2::uuid[]) WITH ORDINALITY AS u(id, ord)
                         WHERE NOT (u.id = ANY(lr.response_sources))
                         GROUP BY u.id
                     ) n
                 ), '{}'::uuid[]),
                 remaining_lookups = lr.remaining_lookups - 1,
                 stage_updated_on = now()
             WHERE lr.lake_request_id = $1
               AND lr.stage = 'LOOKUP'
               AND lr.remaining_lookups > 0
             RETURNING lr.remaining_lookups",
        )
        .bind(lake_request_id)
        .bind(entry_ids)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        trace!(
            subsystem = "db",
            component = "lake_requests",
            op = "add_lookup_results",
            %lake_request_id,
            reported = entry_ids.len(),
            remaining_lookups = ?remaining,
            "Lookup results recorded"
        );
        Ok(remaining)
    }

    async fn force_complete_lookups(&self, lake_request_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE lake_requests SET remaining_lookups = 0, stage_updated_on = now()
             WHERE lake_request_id = $1 AND stage = 'LOOKUP' AND remaining_lookups > 0",
        )
        .bind(lake_request_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_stalled_lookups(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            "SELECT lake_request_id FROM lake_requests
             WHERE stage = 'LOOKUP'
               AND ((remaining_lookups > 0 AND lookups_started_on < $1)
                 OR (remaining_lookups = 0 AND stage_updated_on < $1))
             ORDER BY lookups_started_on",
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(ids)
    }

    async fn list_stalled_processing(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            "SELECT lake_request_id FROM lake_requests
             WHERE stage = 'PROCESSING' AND remaining_chains = 0 AND stage_updated_on < $1
             ORDER BY stage_updated_on",
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(ids)
    }

    async fn transition_stage(
        &self,
        lake_request_id: Uuid,
        from: LakeRequestStage,
        to: LakeRequestStage,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE lake_requests SET stage = $3, stage_updated_on = now()
             WHERE lake_request_id = $1 AND stage = $2",
        )
        .bind(lake_request_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_request_status(&self, lake_request_id: Uuid, status: JobStatus) -> Result<()> {
        sqlx::query(
            "UPDATE lake_requests SET request_status = $2
             WHERE lake_request_id = $1 AND stage <> 'CLOSED'",
        )
        .bind(lake_request_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn set_response_entry(&self, lake_request_id: Uuid, entry_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE lake_requests SET response_entry_id = $2
             WHERE lake_request_id = $1 AND response_entry_id IS NULL",
        )
        .bind(lake_request_id)
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn close(&self, lake_request_id: Uuid, status: JobStatus) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "{} is not a terminal request status",
                status
            )));
        }
        let result = sqlx::query(
            "UPDATE lake_requests
             SET stage = 'CLOSED', request_status = $2, closed_on = now(),
                 stage_updated_on = now()
             WHERE lake_request_id = $1 AND stage <> 'CLOSED'",
        )
        .bind(lake_request_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_remaining_chains(&self, lake_request_id: Uuid, count: i32) -> Result<()> {
        sqlx::query("UPDATE lake_requests SET remaining_chains = $2 WHERE lake_request_id = $1")
            .bind(lake_request_id)
            .bind(count)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn record_chain_completion(&self, lake_request_id: Uuid) -> Result<Option<i32>> {
        let remaining = sqlx::query_scalar(
            "UPDATE lake_requests SET remaining_chains = remaining_chains - 1
             WHERE lake_request_id = $1 AND remaining_chains > 0
             RETURNING remaining_chains",
        )
        .bind(lake_request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(remaining)
    }
}
