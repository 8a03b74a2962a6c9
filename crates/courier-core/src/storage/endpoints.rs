//! Repository for endpoint registry rows.
//!
//! Configuration writes replace the mutable columns wholesale; counters are
//! only ever touched through [`Repository::record_outcome`], which increments
//! in SQL so concurrent attempts never lose updates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Endpoint, EndpointId, EventType, TenantId},
};

const COLUMNS: &str = "id, tenant_id, name, url, description, secret, event_types, is_active, \
                       headers, max_retries, retry_delay_seconds, total_deliveries, \
                       successful_deliveries, failed_deliveries, last_triggered_at, \
                       last_success_at, last_failure_at, created_at, updated_at, deleted_at";

/// Repository for endpoint database operations.
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

    /// Inserts a new endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or constraints are violated.
    pub async fn create(&self, endpoint: &Endpoint) -> Result<EndpointId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO endpoints (
                id, tenant_id, name, url, description, secret, event_types, is_active,
                headers, max_retries, retry_delay_seconds, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
            )
            RETURNING id
            ",
        )
        .bind(endpoint.id)
        .bind(endpoint.tenant_id)
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(&endpoint.description)
        .bind(&endpoint.secret)
        .bind(&endpoint.event_types)
        .bind(endpoint.is_active)
        .bind(&endpoint.headers)
        .bind(endpoint.max_retries)
        .bind(endpoint.retry_delay_seconds)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds an endpoint by id, including soft-deleted rows.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(&format!(
            "SELECT {COLUMNS} FROM endpoints WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Lists a tenant's endpoints that are not deleted, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_tenant(&self, tenant_id: TenantId) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(&format!(
            "SELECT {COLUMNS} FROM endpoints
             WHERE tenant_id = $1 AND deleted_at IS NULL
             ORDER BY created_at ASC"
        ))
        .bind(tenant_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }

    /// Active, non-deleted endpoints of `tenant_id` subscribed to
    /// `event_type` directly or through the wildcard.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_active_subscribers(
        &self,
        tenant_id: TenantId,
        event_type: EventType,
    ) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(&format!(
            "SELECT {COLUMNS} FROM endpoints
             WHERE tenant_id = $1
               AND is_active
               AND deleted_at IS NULL
               AND ($2 = ANY(event_types) OR '*' = ANY(event_types))
             ORDER BY created_at ASC"
        ))
        .bind(tenant_id)
        .bind(event_type.as_str())
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }

    /// Writes the configuration columns of `endpoint`.
    ///
    /// Counters and the secret are left untouched. Returns `false` when the
    /// endpoint does not exist or is deleted.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update(&self, endpoint: &Endpoint) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE endpoints
            SET name = $2, url = $3, description = $4, event_types = $5, is_active = $6,
                headers = $7, max_retries = $8, retry_delay_seconds = $9, updated_at = $10
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(endpoint.id)
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(&endpoint.description)
        .bind(&endpoint.event_types)
        .bind(endpoint.is_active)
        .bind(&endpoint.headers)
        .bind(endpoint.max_retries)
        .bind(endpoint.retry_delay_seconds)
        .bind(endpoint.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Replaces the signing secret in a single statement.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn rotate_secret(
        &self,
        id: EndpointId,
        secret: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE endpoints SET secret = $2, updated_at = $3
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(secret)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Marks an endpoint deleted and inactive. Attempts stay queryable.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn soft_delete(&self, id: EndpointId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE endpoints SET deleted_at = $2, is_active = FALSE, updated_at = $2
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically bumps lifetime counters and timestamps for one completed
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn record_outcome(
        &self,
        id: EndpointId,
        succeeded: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE endpoints
            SET total_deliveries = total_deliveries + 1,
                successful_deliveries = successful_deliveries + CASE WHEN $2 THEN 1 ELSE 0 END,
                failed_deliveries = failed_deliveries + CASE WHEN $2 THEN 0 ELSE 1 END,
                last_triggered_at = $3,
                last_success_at = CASE WHEN $2 THEN $3 ELSE last_success_at END,
                last_failure_at = CASE WHEN $2 THEN last_failure_at ELSE $3 END
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(succeeded)
        .bind(at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Returns `(non_deleted, active)` endpoint counts for a tenant.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_for_tenant(&self, tenant_id: TenantId) -> Result<(i64, i64)> {
        let counts: (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(*) FILTER (WHERE is_active)
             FROM endpoints WHERE tenant_id = $1 AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(counts)
    }
}
