//! Chain request repository implementation.
//!
//! The full chain state is kept as one JSONB document; `version` is a
//! column so saves can compare-and-swap without reading the document.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use omnilake_core::{ChainRepository, ChainRequest, Error, Result};

/// PostgreSQL implementation of ChainRepository.
pub struct PgChainRepository {
    pool: Pool<Postgres>,
}

impl PgChainRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_chain_row(row: sqlx::postgres::PgRow) -> Result<ChainRequest> {
        let document: serde_json::Value = row.get("document");
        let mut chain: ChainRequest = serde_json::from_value(document)?;
        chain.version = row.get("version");
        Ok(chain)
    }
}

#[async_trait]
impl ChainRepository for PgChainRepository {
    async fn create(&self, chain: &ChainRequest) -> Result<()> {
        sqlx::query(
            "INSERT INTO chain_requests (chain_request_id, job_id, job_type, chain_status,
                                         callback_lake_request_id, version, document, created_on)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(chain.chain_request_id)
        .bind(chain.job_id)
        .bind(chain.job_type.as_str())
        .bind(chain.chain_status.as_str())
        .bind(chain.callback.map(|c| c.lake_request_id))
        .bind(chain.version)
        .bind(serde_json::to_value(chain)?)
        .bind(chain.created_on)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, chain_request_id: Uuid) -> Result<Option<ChainRequest>> {
        let row = sqlx::query(
            "SELECT version, document FROM chain_requests WHERE chain_request_id = $1",
        )
        .bind(chain_request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.map(Self::parse_chain_row).transpose()
    }

    async fn save(&self, chain: &ChainRequest) -> Result<bool> {
        let mut stored = chain.clone();
        stored.version = chain.version + 1;
        let result = sqlx::query(
            "UPDATE chain_requests
             SET document = $3, chain_status = $4, version = version + 1, updated_on = now()
             WHERE chain_request_id = $1 AND version = $2",
        )
        .bind(chain.chain_request_id)
        .bind(chain.version)
        .bind(serde_json::to_value(&stored)?)
        .bind(chain.chain_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_callback(&self, lake_request_id: Uuid) -> Result<Vec<ChainRequest>> {
        let rows = sqlx::query(
            "SELECT version, document FROM chain_requests
             WHERE callback_lake_request_id = $1
             ORDER BY created_on",
        )
        .bind(lake_request_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.into_iter().map(Self::parse_chain_row).collect()
    }
}
