//! Repository for events and their first-round status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Event, EventId, EventStatus, EventType, TenantId},
};

const COLUMNS: &str = "id, tenant_id, event_type, payload, origin_model, origin_id, status, \
                       created_at, claimed_at, processed_at";

/// Repository for event database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Persists a new event.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or constraints are violated.
    pub async fn create(&self, event: &Event) -> Result<EventId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO events (
                id, tenant_id, event_type, payload, origin_model, origin_id, status, created_at,
                claimed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            ",
        )
        .bind(event.id)
        .bind(event.tenant_id)
        .bind(event.event_type)
        .bind(&event.payload)
        .bind(&event.origin_model)
        .bind(&event.origin_id)
        .bind(event.status)
        .bind(event.created_at)
        .bind(event.claimed_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds an event by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: EventId) -> Result<Option<Event>> {
        let event =
            sqlx::query_as::<_, Event>(&format!("SELECT {COLUMNS} FROM events WHERE id = $1"))
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(event)
    }

    /// Claims up to `batch_size` events for processing, oldest first.
    ///
    /// Picks pending events plus processing events whose claim is older than
    /// `stale_before`, which belong to a worker that died mid-round. Test
    /// deliveries are never claimed: they go to one endpoint only and are
    /// never fanned out to subscribers.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_pending(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let events = sqlx::query_as::<_, Event>(&format!(
            r"
            UPDATE events
            SET status = 'processing', claimed_at = $1
            WHERE id IN (
                SELECT id FROM events
                WHERE event_type <> $4
                  AND (status = 'pending' OR (status = 'processing' AND claimed_at < $2))
                ORDER BY created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "
        ))
        .bind(now)
        .bind(stale_before)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .bind(EventType::WebhookTest.as_str())
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Writes the terminal first-round status.
    ///
    /// Only succeeds while the event is still `processing`, so a status is
    /// written at most once. Returns whether this call wrote it.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn complete(
        &self,
        id: EventId,
        status: EventStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE events SET status = $2, processed_at = $3
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(status)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Counts a tenant's events created at or after `since`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_since(&self, tenant_id: TenantId, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM events WHERE tenant_id = $1 AND created_at >= $2",
        )
        .bind(tenant_id)
        .bind(since)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }
}
