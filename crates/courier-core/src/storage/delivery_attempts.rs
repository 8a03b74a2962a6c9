//! Repository for the delivery attempt audit trail.
//!
//! Attempt rows are inserted before the HTTP call and completed exactly once
//! afterwards. The retry schedule lives on the rows themselves: a completed
//! attempt with `next_retry_at` set and no later attempt for the same pair is
//! a pending retry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{AttemptCompletion, DeliveryAttempt, EndpointId, EventId, TenantId},
};

const COLUMNS: &str = "id, event_id, endpoint_id, attempt_number, attempt_trigger, request_url, \
                       request_headers, request_body, response_status, response_headers, \
                       response_body, duration_ms, succeeded, error_message, next_retry_at, \
                       retry_claimed_at, created_at, completed_at";

/// Attempt statistics over a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, sqlx::FromRow)]
pub struct AttemptWindowStats {
    /// Attempts created in the window.
    pub created: i64,
    /// Attempts in the window with a recorded outcome.
    pub completed: i64,
    /// Completed attempts that succeeded.
    pub succeeded: i64,
    /// Mean duration of completed attempts, in milliseconds.
    pub average_duration_ms: Option<f64>,
}

/// Repository for delivery attempt operations.
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

    /// Inserts an in-flight attempt.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if an attempt with the same
    /// number already exists for the pair.
    pub async fn create(&self, attempt: &DeliveryAttempt) -> Result<Uuid> {
        let attempt_number = i32::try_from(attempt.attempt_number)
            .map_err(|_| CoreError::InvalidInput("attempt_number out of range".to_string()))?;

        let id = sqlx::query_scalar(
            r"
            INSERT INTO delivery_attempts (
                id, event_id, endpoint_id, attempt_number, attempt_trigger, request_url,
                request_headers, request_body, succeeded, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, $9)
            RETURNING id
            ",
        )
        .bind(attempt.id)
        .bind(attempt.event_id)
        .bind(attempt.endpoint_id)
        .bind(attempt_number)
        .bind(attempt.trigger)
        .bind(&attempt.request_url)
        .bind(sqlx::types::Json(&attempt.request_headers))
        .bind(&attempt.request_body)
        .bind(attempt.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Records the outcome of an in-flight attempt.
    ///
    /// The outcome and the retry due time are written in one statement, and
    /// only while `completed_at` is still null. Returns whether this call
    /// recorded the outcome.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn complete(&self, id: Uuid, completion: &AttemptCompletion) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE delivery_attempts
            SET response_status = $2, response_headers = $3, response_body = $4,
                duration_ms = $5, succeeded = $6, error_message = $7,
                next_retry_at = $8, completed_at = $9
            WHERE id = $1 AND completed_at IS NULL
            ",
        )
        .bind(id)
        .bind(completion.response_status)
        .bind(completion.response_headers.as_ref().map(sqlx::types::Json))
        .bind(&completion.response_body)
        .bind(completion.duration_ms)
        .bind(completion.succeeded)
        .bind(&completion.error_message)
        .bind(completion.next_retry_at)
        .bind(completion.completed_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Finds an attempt by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<DeliveryAttempt>> {
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(&format!(
            "SELECT {COLUMNS} FROM delivery_attempts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(attempt)
    }

    /// All attempts for an event, grouped by endpoint in attempt order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_event(&self, event_id: EventId) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(&format!(
            "SELECT {COLUMNS} FROM delivery_attempts
             WHERE event_id = $1
             ORDER BY endpoint_id, attempt_number ASC"
        ))
        .bind(event_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Most recent attempts to an endpoint, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_endpoint(
        &self,
        endpoint_id: EndpointId,
        limit: i64,
    ) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(&format!(
            "SELECT {COLUMNS} FROM delivery_attempts
             WHERE endpoint_id = $1
             ORDER BY created_at DESC, attempt_number DESC
             LIMIT $2"
        ))
        .bind(endpoint_id)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Highest-numbered attempt for an (event, endpoint) pair.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn latest_for_pair(
        &self,
        event_id: EventId,
        endpoint_id: EndpointId,
    ) -> Result<Option<DeliveryAttempt>> {
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(&format!(
            "SELECT {COLUMNS} FROM delivery_attempts
             WHERE event_id = $1 AND endpoint_id = $2
             ORDER BY attempt_number DESC
             LIMIT 1"
        ))
        .bind(event_id)
        .bind(endpoint_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(attempt)
    }

    /// Leases up to `limit` due retries.
    ///
    /// An attempt is due when it is completed, `next_retry_at <= now`, no
    /// later attempt exists for its pair, and no other scheduler holds a
    /// lease newer than `lease_expired_before`. The lease is recorded in
    /// `retry_claimed_at`; inserting the follow-up attempt ends eligibility.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails.
    pub async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(&format!(
            r"
            UPDATE delivery_attempts
            SET retry_claimed_at = $1
            WHERE id IN (
                SELECT a.id FROM delivery_attempts a
                WHERE a.completed_at IS NOT NULL
                  AND a.next_retry_at <= $1
                  AND (a.retry_claimed_at IS NULL OR a.retry_claimed_at < $2)
                  AND NOT EXISTS (
                      SELECT 1 FROM delivery_attempts s
                      WHERE s.event_id = a.event_id
                        AND s.endpoint_id = a.endpoint_id
                        AND s.attempt_number > a.attempt_number
                  )
                ORDER BY a.next_retry_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "
        ))
        .bind(now)
        .bind(lease_expired_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// In-flight attempts created before `started_before`, which belong to a
    /// process that stopped before recording the outcome.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_interrupted(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(&format!(
            "SELECT {COLUMNS} FROM delivery_attempts
             WHERE completed_at IS NULL AND created_at < $1
             ORDER BY created_at ASC
             LIMIT $2"
        ))
        .bind(started_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Attempt statistics for a tenant's endpoints since `since`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn window_stats(
        &self,
        tenant_id: TenantId,
        since: DateTime<Utc>,
    ) -> Result<AttemptWindowStats> {
        let stats = sqlx::query_as::<_, AttemptWindowStats>(
            r"
            SELECT COUNT(*) AS created,
                   COUNT(*) FILTER (WHERE a.completed_at IS NOT NULL) AS completed,
                   COUNT(*) FILTER (WHERE a.succeeded) AS succeeded,
                   AVG(a.duration_ms)::DOUBLE PRECISION AS average_duration_ms
            FROM delivery_attempts a
            JOIN endpoints e ON e.id = a.endpoint_id
            WHERE e.tenant_id = $1 AND a.created_at >= $2
            ",
        )
        .bind(tenant_id)
        .bind(since)
        .fetch_one(&*self.pool)
        .await?;

        Ok(stats)
    }
}
