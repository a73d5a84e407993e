//! Job ledger repository implementation.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use omnilake_core::{Error, Job, JobKey, JobRepository, JobStatus, JobType, Result};

const JOB_COLUMNS: &str = "job_type, job_id, status, parent_job_type, parent_job_id, \
                           created_on, started, ended, status_message, result";

/// PostgreSQL implementation of JobRepository.
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<Job> {
        let job_type: String = row.get("job_type");
        let status: String = row.get("status");
        let parent_job_type: Option<String> = row.get("parent_job_type");
        Ok(Job {
            job_id: row.get("job_id"),
            job_type: job_type.parse()?,
            status: status.parse()?,
            parent_job_id: row.get("parent_job_id"),
            parent_job_type: parent_job_type.map(|s| s.parse()).transpose()?,
            created_on: row.get("created_on"),
            started: row.get("started"),
            ended: row.get("ended"),
            status_message: row.get("status_message"),
            result: row.get("result"),
        })
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn create(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (job_type, job_id, status, parent_job_type, parent_job_id,
                               created_on, started, ended, status_message, result)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(job.job_type.as_str())
        .bind(job.job_id)
        .bind(job.status.as_str())
        .bind(job.parent_job_type.map(|t| t.as_str()))
        .bind(job.parent_job_id)
        .bind(job.created_on)
        .bind(job.started)
        .bind(job.ended)
        .bind(&job.status_message)
        .bind(&job.result)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, job_type: JobType, job_id: Uuid) -> Result<Option<Job>> {
        let query = format!(
            "SELECT {} FROM jobs WHERE job_type = $1 AND job_id = $2",
            JOB_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(job_type.as_str())
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(Self::parse_job_row).transpose()
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs
             SET status = $3, started = $4, ended = $5, status_message = $6, result = $7
             WHERE job_type = $1 AND job_id = $2",
        )
        .bind(job.job_type.as_str())
        .bind(job.job_id)
        .bind(job.status.as_str())
        .bind(job.started)
        .bind(job.ended)
        .bind(&job.status_message)
        .bind(&job.result)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("job {}", job.key())));
        }
        Ok(())
    }

    async fn mark_in_progress(&self, key: JobKey) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'IN_PROGRESS', started = now()
             WHERE job_type = $1 AND job_id = $2 AND status = 'PENDING'",
        )
        .bind(key.job_type.as_str())
        .bind(key.job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
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
        let updated = sqlx::query(
            "UPDATE jobs
             SET status = $3,
                 status_message = COALESCE($4, status_message),
                 result = COALESCE($5, result),
                 started = COALESCE(started, now()),
                 ended = now()
             WHERE job_type = $1 AND job_id = $2
               AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(key.job_type.as_str())
        .bind(key.job_id)
        .bind(status.as_str())
        .bind(status_message)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn list_children(&self, parent: JobKey) -> Result<Vec<Job>> {
        let query = format!(
            "SELECT {} FROM jobs WHERE parent_job_type = $1 AND parent_job_id = $2
             ORDER BY created_on",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(parent.job_type.as_str())
            .bind(parent.job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.into_iter().map(Self::parse_job_row).collect()
    }
}
