//! Durable event queue on PostgreSQL.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so any number of workers can poll
//! the same table. Publishing wakes local workers through a shared
//! [`Notify`] instead of waiting for the next poll.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use omnilake_core::{
    defaults, new_v7, Error, EventQueue, LakeEvent, LakeEventType, QueuedEvent, Result,
};

const EVENT_COLUMNS: &str = "event_id, payload, status, attempts, max_attempts, \
                             available_on, last_error, created_on";

/// PostgreSQL implementation of EventQueue.
pub struct PgEventQueue {
    pool: Pool<Postgres>,
    notify: Arc<Notify>,
}

impl PgEventQueue {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Create a queue sharing an existing notify handle.
    pub fn with_notify(pool: Pool<Postgres>, notify: Arc<Notify>) -> Self {
        Self { pool, notify }
    }

    /// Handle signalled whenever an event is published.
    pub fn event_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn parse_event_row(row: sqlx::postgres::PgRow) -> Result<QueuedEvent> {
        let payload: serde_json::Value = row.get("payload");
        let status: String = row.get("status");
        Ok(QueuedEvent {
            event_id: row.get("event_id"),
            event: serde_json::from_value(payload)?,
            status: status.parse()?,
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            available_on: row.get("available_on"),
            last_error: row.get("last_error"),
            created_on: row.get("created_on"),
        })
    }
}

#[async_trait]
impl EventQueue for PgEventQueue {
    async fn publish(&self, event: LakeEvent) -> Result<Uuid> {
        self.publish_with(event, defaults::EVENT_MAX_ATTEMPTS, 0)
            .await
    }

    async fn publish_with(
        &self,
        event: LakeEvent,
        max_attempts: i32,
        delay_ms: i64,
    ) -> Result<Uuid> {
        let event_id = new_v7();
        let event_type = event.event_type();
        sqlx::query(
            "INSERT INTO lake_events (event_id, event_type, payload, max_attempts, available_on)
             VALUES ($1, $2, $3, $4, now() + make_interval(secs => $5::double precision / 1000))",
        )
        .bind(event_id)
        .bind(event_type.as_str())
        .bind(serde_json::to_value(&event)?)
        .bind(max_attempts.max(1))
        .bind(delay_ms.max(0))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "events",
            op = "publish",
            %event_id,
            %event_type,
            correlation_id = %event.correlation_id(),
            delay_ms,
            "Event published"
        );
        self.notify.notify_waiters();
        Ok(event_id)
    }

    async fn claim_next(&self, event_types: &[LakeEventType]) -> Result<Option<QueuedEvent>> {
        let types: Vec<&str> = event_types.iter().map(LakeEventType::as_str).collect();
        let query = format!(
            "UPDATE lake_events
             SET status = 'RUNNING', attempts = attempts + 1, updated_on = now()
             WHERE event_id = (
                 SELECT event_id FROM lake_events
                 WHERE status = 'PENDING'
                   AND available_on <= now()
                   AND (cardinality($1::text[]) = 0 OR event_type = ANY($1))
                 ORDER BY available_on, created_on
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {}",
            EVENT_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(&types)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(Self::parse_event_row).transpose()
    }

    async fn complete(&self, event_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE lake_events SET status = 'COMPLETED', updated_on = now()
             WHERE event_id = $1",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn retry(&self, event_id: Uuid, error: &str, delay_ms: i64) -> Result<()> {
        sqlx::query(
            "UPDATE lake_events
             SET status = 'PENDING', last_error = $2, updated_on = now(),
                 available_on = now() + make_interval(secs => $3::double precision / 1000)
             WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(error)
        .bind(delay_ms.max(0))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn fail(&self, event_id: Uuid, error: &str) -> Result<()> {
        warn!(
            subsystem = "db",
            component = "events",
            op = "fail",
            %event_id,
            error,
            "Event dead-lettered"
        );
        sqlx::query(
            "UPDATE lake_events SET status = 'FAILED', last_error = $2, updated_on = now()
             WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<QueuedEvent>> {
        let query = format!(
            "SELECT {} FROM lake_events WHERE event_id = $1",
            EVENT_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(Self::parse_event_row).transpose()
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM lake_events WHERE status IN ('PENDING', 'RUNNING')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count)
    }
}
