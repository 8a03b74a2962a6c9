//! PostgreSQL persistence for endpoints, events and delivery attempts.
//!
//! Each table has one repository. Queries that coordinate concurrent workers
//! (event claims, retry claims) use `FOR UPDATE SKIP LOCKED` so that several
//! engine instances can share one database.

use std::sync::Arc;

use sqlx::PgPool;

pub mod delivery_attempts;
pub mod endpoints;
pub mod events;

use crate::error::Result;

/// Container for all repositories over a shared pool.
#[derive(Clone)]
pub struct Storage {
    /// Endpoint registry table.
    pub endpoints: Arc<endpoints::Repository>,

    /// Event table.
    pub events: Arc<events::Repository>,

    /// Delivery attempt audit table.
    pub delivery_attempts: Arc<delivery_attempts::Repository>,
}

impl Storage {
    /// Creates repositories sharing `pool`.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            endpoints: Arc::new(endpoints::Repository::new(pool.clone())),
            events: Arc::new(events::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool)),
        }
    }

    /// Verifies database connectivity with `SELECT 1`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.events.pool()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_builds_over_lazy_pool() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/courier").unwrap();
        let storage = Storage::new(pool);
        assert!(Arc::ptr_eq(&storage.endpoints.pool(), &storage.events.pool()));
    }
}
