//! Storage abstraction for the delivery engine.
//!
//! Every component in this crate reads and writes through [`DeliveryStorage`].
//! Production wires in [`PostgresDeliveryStorage`] over the core repositories;
//! tests use [`mock::MockDeliveryStorage`], which applies the same predicates
//! in memory.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{
        AttemptCompletion, DeliveryAttempt, Endpoint, EndpointId, Event, EventId, EventStatus,
        EventType, TenantId,
    },
    storage::{delivery_attempts::AttemptWindowStats, Storage},
};
use uuid::Uuid;

/// Boxed future returned by every storage operation.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations used by the registry, dispatcher, executor, retry
/// scheduler and audit store.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Inserts a new endpoint.
    fn insert_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, ()>;

    /// Finds an endpoint by id, deleted or not.
    fn find_endpoint(&self, id: EndpointId) -> StorageFuture<'_, Option<Endpoint>>;

    /// Lists a tenant's non-deleted endpoints.
    fn list_endpoints(&self, tenant_id: TenantId) -> StorageFuture<'_, Vec<Endpoint>>;

    /// Writes endpoint configuration. Returns `false` if missing or deleted.
    fn update_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, bool>;

    /// Replaces an endpoint secret. Returns `false` if missing or deleted.
    fn rotate_endpoint_secret(
        &self,
        id: EndpointId,
        secret: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Soft-deletes an endpoint. Returns `false` if missing or deleted.
    fn soft_delete_endpoint(&self, id: EndpointId, now: DateTime<Utc>)
        -> StorageFuture<'_, bool>;

    /// Active, non-deleted endpoints of a tenant subscribed to `event_type`.
    fn find_active_subscribers(
        &self,
        tenant_id: TenantId,
        event_type: EventType,
    ) -> StorageFuture<'_, Vec<Endpoint>>;

    /// Atomically increments lifetime counters for one completed attempt.
    fn record_endpoint_outcome(
        &self,
        id: EndpointId,
        succeeded: bool,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// `(non_deleted, active)` endpoint counts.
    fn count_endpoints(&self, tenant_id: TenantId) -> StorageFuture<'_, (i64, i64)>;

    /// Persists a new event.
    fn insert_event(&self, event: Event) -> StorageFuture<'_, ()>;

    /// Finds an event by id.
    fn find_event(&self, id: EventId) -> StorageFuture<'_, Option<Event>>;

    /// Claims pending events and processing events claimed before
    /// `stale_before`.
    fn claim_events(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<Event>>;

    /// Writes a terminal status if the event is still processing.
    fn complete_event(
        &self,
        id: EventId,
        status: EventStatus,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Counts a tenant's events created since `since`.
    fn count_events_since(&self, tenant_id: TenantId, since: DateTime<Utc>)
        -> StorageFuture<'_, i64>;

    /// Inserts an in-flight attempt.
    fn insert_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, ()>;

    /// Records an attempt's outcome if none is recorded yet.
    fn complete_attempt(&self, id: Uuid, completion: AttemptCompletion)
        -> StorageFuture<'_, bool>;

    /// Finds an attempt by id.
    fn find_attempt(&self, id: Uuid) -> StorageFuture<'_, Option<DeliveryAttempt>>;

    /// All attempts for an event.
    fn attempts_for_event(&self, event_id: EventId) -> StorageFuture<'_, Vec<DeliveryAttempt>>;

    /// Newest attempts to an endpoint.
    fn attempts_for_endpoint(
        &self,
        endpoint_id: EndpointId,
        limit: i64,
    ) -> StorageFuture<'_, Vec<DeliveryAttempt>>;

    /// Highest-numbered attempt for a pair.
    fn latest_attempt(
        &self,
        event_id: EventId,
        endpoint_id: EndpointId,
    ) -> StorageFuture<'_, Option<DeliveryAttempt>>;

    /// Leases due retries.
    fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryAttempt>>;

    /// In-flight attempts created before `started_before`.
    fn find_interrupted_attempts(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryAttempt>>;

    /// Attempt statistics for a tenant since `since`.
    fn attempt_window_stats(
        &self,
        tenant_id: TenantId,
        since: DateTime<Utc>,
    ) -> StorageFuture<'_, AttemptWindowStats>;

    /// Verifies the backing store is reachable.
    fn health_check(&self) -> StorageFuture<'_, ()>;
}

/// PostgreSQL implementation over the core repositories.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn insert_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.endpoints.create(&endpoint).await.map(|_| ()) })
    }

    fn find_endpoint(&self, id: EndpointId) -> StorageFuture<'_, Option<Endpoint>> {
        Box::pin(self.storage.endpoints.find_by_id(id))
    }

    fn list_endpoints(&self, tenant_id: TenantId) -> StorageFuture<'_, Vec<Endpoint>> {
        Box::pin(self.storage.endpoints.find_by_tenant(tenant_id))
    }

    fn update_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.endpoints.update(&endpoint).await })
    }

    fn rotate_endpoint_secret(
        &self,
        id: EndpointId,
        secret: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.endpoints.rotate_secret(id, &secret, now).await })
    }

    fn soft_delete_endpoint(
        &self,
        id: EndpointId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(self.storage.endpoints.soft_delete(id, now))
    }

    fn find_active_subscribers(
        &self,
        tenant_id: TenantId,
        event_type: EventType,
    ) -> StorageFuture<'_, Vec<Endpoint>> {
        Box::pin(self.storage.endpoints.find_active_subscribers(tenant_id, event_type))
    }

    fn record_endpoint_outcome(
        &self,
        id: EndpointId,
        succeeded: bool,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(self.storage.endpoints.record_outcome(id, succeeded, at))
    }

    fn count_endpoints(&self, tenant_id: TenantId) -> StorageFuture<'_, (i64, i64)> {
        Box::pin(self.storage.endpoints.count_for_tenant(tenant_id))
    }

    fn insert_event(&self, event: Event) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.events.create(&event).await.map(|_| ()) })
    }

    fn find_event(&self, id: EventId) -> StorageFuture<'_, Option<Event>> {
        Box::pin(self.storage.events.find_by_id(id))
    }

    fn claim_events(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<Event>> {
        Box::pin(self.storage.events.claim_pending(batch_size, now, stale_before))
    }

    fn complete_event(
        &self,
        id: EventId,
        status: EventStatus,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(self.storage.events.complete(id, status, now))
    }

    fn count_events_since(
        &self,
        tenant_id: TenantId,
        since: DateTime<Utc>,
    ) -> StorageFuture<'_, i64> {
        Box::pin(self.storage.events.count_since(tenant_id, since))
    }

    fn insert_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.delivery_attempts.create(&attempt).await.map(|_| ()) })
    }

    fn complete_attempt(
        &self,
        id: Uuid,
        completion: AttemptCompletion,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.delivery_attempts.complete(id, &completion).await })
    }

    fn find_attempt(&self, id: Uuid) -> StorageFuture<'_, Option<DeliveryAttempt>> {
        Box::pin(self.storage.delivery_attempts.find_by_id(id))
    }

    fn attempts_for_event(&self, event_id: EventId) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
        Box::pin(self.storage.delivery_attempts.find_by_event(event_id))
    }

    fn attempts_for_endpoint(
        &self,
        endpoint_id: EndpointId,
        limit: i64,
    ) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
        Box::pin(self.storage.delivery_attempts.find_by_endpoint(endpoint_id, limit))
    }

    fn latest_attempt(
        &self,
        event_id: EventId,
        endpoint_id: EndpointId,
    ) -> StorageFuture<'_, Option<DeliveryAttempt>> {
        Box::pin(self.storage.delivery_attempts.latest_for_pair(event_id, endpoint_id))
    }

    fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
        Box::pin(self.storage.delivery_attempts.claim_due_retries(now, lease_expired_before, limit))
    }

    fn find_interrupted_attempts(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
        Box::pin(self.storage.delivery_attempts.find_interrupted(started_before, limit))
    }

    fn attempt_window_stats(
        &self,
        tenant_id: TenantId,
        since: DateTime<Utc>,
    ) -> StorageFuture<'_, AttemptWindowStats> {
        Box::pin(self.storage.delivery_attempts.window_stats(tenant_id, since))
    }

    fn health_check(&self) -> StorageFuture<'_, ()> {
        Box::pin(self.storage.health_check())
    }
}

pub mod mock {
    //! In-memory storage for tests.
    //!
    //! Mirrors the SQL predicates of the PostgreSQL repositories closely
    //! enough that dispatcher, scheduler and audit behaviour can be tested
    //! without a database. Errors can be injected per operation.

    use std::{
        collections::{HashMap, HashSet},
        sync::Arc,
    };

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        models::{
            AttemptCompletion, DeliveryAttempt, Endpoint, EndpointId, Event, EventId,
            EventStatus, EventType, TenantId,
        },
        storage::delivery_attempts::AttemptWindowStats,
    };
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use super::{DeliveryStorage, StorageFuture};

    /// In-memory storage with error injection.
    #[derive(Clone, Default)]
    pub struct MockDeliveryStorage {
        endpoints: Arc<RwLock<HashMap<EndpointId, Endpoint>>>,
        events: Arc<RwLock<HashMap<EventId, Event>>>,
        attempts: Arc<RwLock<Vec<DeliveryAttempt>>>,
        injected_errors: Arc<RwLock<HashMap<&'static str, String>>>,
        failing: Arc<RwLock<HashSet<&'static str>>>,
    }

    impl MockDeliveryStorage {
        /// Creates empty storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next call of `operation` fail with a database error.
        ///
        /// `operation` is the trait method name, e.g. `"insert_attempt"`.
        pub async fn inject_error(&self, operation: &'static str, message: impl Into<String>) {
            self.injected_errors.write().await.insert(operation, message.into());
        }

        /// Makes every call of `operation` fail until [`Self::recover`].
        pub async fn fail_always(&self, operation: &'static str) {
            self.failing.write().await.insert(operation);
        }

        /// Clears persistent failures.
        pub async fn recover(&self) {
            self.failing.write().await.clear();
        }

        /// Every stored attempt, in insertion order.
        pub async fn all_attempts(&self) -> Vec<DeliveryAttempt> {
            self.attempts.read().await.clone()
        }

        /// Every stored event.
        pub async fn all_events(&self) -> Vec<Event> {
            self.events.read().await.values().cloned().collect()
        }

        /// Overwrites a stored attempt, for arranging crash scenarios.
        pub async fn put_attempt(&self, attempt: DeliveryAttempt) {
            let mut attempts = self.attempts.write().await;
            attempts.retain(|a| a.id != attempt.id);
            attempts.push(attempt);
        }

        async fn check(&self, operation: &'static str) -> Result<()> {
            if self.failing.read().await.contains(operation) {
                return Err(CoreError::Database(format!("{operation} unavailable")));
            }
            if let Some(message) = self.injected_errors.write().await.remove(operation) {
                return Err(CoreError::Database(message));
            }
            Ok(())
        }

        async fn tenant_endpoint_ids(&self, tenant_id: TenantId) -> HashSet<EndpointId> {
            self.endpoints
                .read()
                .await
                .values()
                .filter(|e| e.tenant_id == tenant_id)
                .map(|e| e.id)
                .collect()
        }
    }

    fn has_successor(attempts: &[DeliveryAttempt], attempt: &DeliveryAttempt) -> bool {
        attempts.iter().any(|s| {
            s.event_id == attempt.event_id
                && s.endpoint_id == attempt.endpoint_id
                && s.attempt_number > attempt.attempt_number
        })
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn insert_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.check("insert_endpoint").await?;
                let mut endpoints = self.endpoints.write().await;
                if endpoints.contains_key(&endpoint.id) {
                    return Err(CoreError::ConstraintViolation("duplicate endpoint id".into()));
                }
                endpoints.insert(endpoint.id, endpoint);
                Ok(())
            })
        }

        fn find_endpoint(&self, id: EndpointId) -> StorageFuture<'_, Option<Endpoint>> {
            Box::pin(async move {
                self.check("find_endpoint").await?;
                Ok(self.endpoints.read().await.get(&id).cloned())
            })
        }

        fn list_endpoints(&self, tenant_id: TenantId) -> StorageFuture<'_, Vec<Endpoint>> {
            Box::pin(async move {
                self.check("list_endpoints").await?;
                let mut endpoints: Vec<_> = self
                    .endpoints
                    .read()
                    .await
                    .values()
                    .filter(|e| e.tenant_id == tenant_id && e.deleted_at.is_none())
                    .cloned()
                    .collect();
                endpoints.sort_by_key(|e| e.created_at);
                Ok(endpoints)
            })
        }

        fn update_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                self.check("update_endpoint").await?;
                let mut endpoints = self.endpoints.write().await;
                let Some(stored) = endpoints.get_mut(&endpoint.id) else {
                    return Ok(false);
                };
                if stored.deleted_at.is_some() {
                    return Ok(false);
                }
                stored.name = endpoint.name;
                stored.url = endpoint.url;
                stored.description = endpoint.description;
                stored.event_types = endpoint.event_types;
                stored.is_active = endpoint.is_active;
                stored.headers = endpoint.headers;
                stored.max_retries = endpoint.max_retries;
                stored.retry_delay_seconds = endpoint.retry_delay_seconds;
                stored.updated_at = endpoint.updated_at;
                Ok(true)
            })
        }

        fn rotate_endpoint_secret(
            &self,
            id: EndpointId,
            secret: String,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                self.check("rotate_endpoint_secret").await?;
                let mut endpoints = self.endpoints.write().await;
                match endpoints.get_mut(&id) {
                    Some(stored) if stored.deleted_at.is_none() => {
                        stored.secret = secret;
                        stored.updated_at = now;
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn soft_delete_endpoint(
            &self,
            id: EndpointId,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                self.check("soft_delete_endpoint").await?;
                let mut endpoints = self.endpoints.write().await;
                match endpoints.get_mut(&id) {
                    Some(stored) if stored.deleted_at.is_none() => {
                        stored.deleted_at = Some(now);
                        stored.is_active = false;
                        stored.updated_at = now;
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn find_active_subscribers(
            &self,
            tenant_id: TenantId,
            event_type: EventType,
        ) -> StorageFuture<'_, Vec<Endpoint>> {
            Box::pin(async move {
                self.check("find_active_subscribers").await?;
                let mut endpoints: Vec<_> = self
                    .endpoints
                    .read()
                    .await
                    .values()
                    .filter(|e| {
                        e.tenant_id == tenant_id
                            && e.is_dispatchable()
                            && e.is_subscribed(event_type)
                    })
                    .cloned()
                    .collect();
                endpoints.sort_by_key(|e| e.created_at);
                Ok(endpoints)
            })
        }

        fn record_endpoint_outcome(
            &self,
            id: EndpointId,
            succeeded: bool,
            at: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.check("record_endpoint_outcome").await?;
                if let Some(stored) = self.endpoints.write().await.get_mut(&id) {
                    stored.total_deliveries += 1;
                    stored.last_triggered_at = Some(at);
                    if succeeded {
                        stored.successful_deliveries += 1;
                        stored.last_success_at = Some(at);
                    } else {
                        stored.failed_deliveries += 1;
                        stored.last_failure_at = Some(at);
                    }
                }
                Ok(())
            })
        }

        fn count_endpoints(&self, tenant_id: TenantId) -> StorageFuture<'_, (i64, i64)> {
            Box::pin(async move {
                self.check("count_endpoints").await?;
                let endpoints = self.endpoints.read().await;
                let live: Vec<_> = endpoints
                    .values()
                    .filter(|e| e.tenant_id == tenant_id && e.deleted_at.is_none())
                    .collect();
                let active = live.iter().filter(|e| e.is_active).count();
                Ok((live.len() as i64, active as i64))
            })
        }

        fn insert_event(&self, event: Event) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.check("insert_event").await?;
                self.events.write().await.insert(event.id, event);
                Ok(())
            })
        }

        fn find_event(&self, id: EventId) -> StorageFuture<'_, Option<Event>> {
            Box::pin(async move {
                self.check("find_event").await?;
                Ok(self.events.read().await.get(&id).cloned())
            })
        }

        fn claim_events(
            &self,
            batch_size: usize,
            now: DateTime<Utc>,
            stale_before: DateTime<Utc>,
        ) -> StorageFuture<'_, Vec<Event>> {
            Box::pin(async move {
                self.check("claim_events").await?;
                let mut events = self.events.write().await;
                let mut claimable: Vec<_> = events
                    .values()
                    .filter(|e| e.event_type != EventType::WebhookTest)
                    .filter(|e| match e.status {
                        EventStatus::Pending => true,
                        EventStatus::Processing => e.claimed_at.is_some_and(|c| c < stale_before),
                        _ => false,
                    })
                    .map(|e| (e.created_at, e.id))
                    .collect();
                claimable.sort();
                claimable.truncate(batch_size);

                let mut claimed = Vec::with_capacity(claimable.len());
                for (_, id) in claimable {
                    if let Some(event) = events.get_mut(&id) {
                        event.status = EventStatus::Processing;
                        event.claimed_at = Some(now);
                        claimed.push(event.clone());
                    }
                }
                Ok(claimed)
            })
        }

        fn complete_event(
            &self,
            id: EventId,
            status: EventStatus,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                self.check("complete_event").await?;
                match self.events.write().await.get_mut(&id) {
                    Some(event) if event.status == EventStatus::Processing => {
                        event.status = status;
                        event.processed_at = Some(now);
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn count_events_since(
            &self,
            tenant_id: TenantId,
            since: DateTime<Utc>,
        ) -> StorageFuture<'_, i64> {
            Box::pin(async move {
                self.check("count_events_since").await?;
                let count = self
                    .events
                    .read()
                    .await
                    .values()
                    .filter(|e| e.tenant_id == tenant_id && e.created_at >= since)
                    .count();
                Ok(count as i64)
            })
        }

        fn insert_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.check("insert_attempt").await?;
                let mut attempts = self.attempts.write().await;
                let duplicate = attempts.iter().any(|a| {
                    a.event_id == attempt.event_id
                        && a.endpoint_id == attempt.endpoint_id
                        && a.attempt_number == attempt.attempt_number
                });
                if duplicate {
                    return Err(CoreError::ConstraintViolation(format!(
                        "attempt {} already exists for pair",
                        attempt.attempt_number
                    )));
                }
                attempts.push(attempt);
                Ok(())
            })
        }

        fn complete_attempt(
            &self,
            id: Uuid,
            completion: AttemptCompletion,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                self.check("complete_attempt").await?;
                let mut attempts = self.attempts.write().await;
                match attempts.iter_mut().find(|a| a.id == id) {
                    Some(attempt) if attempt.completed_at.is_none() => {
                        attempt.response_status = completion.response_status;
                        attempt.response_headers = completion.response_headers;
                        attempt.response_body = completion.response_body;
                        attempt.duration_ms = Some(completion.duration_ms);
                        attempt.succeeded = completion.succeeded;
                        attempt.error_message = completion.error_message;
                        attempt.next_retry_at = completion.next_retry_at;
                        attempt.completed_at = Some(completion.completed_at);
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn find_attempt(&self, id: Uuid) -> StorageFuture<'_, Option<DeliveryAttempt>> {
            Box::pin(async move {
                self.check("find_attempt").await?;
                Ok(self.attempts.read().await.iter().find(|a| a.id == id).cloned())
            })
        }

        fn attempts_for_event(
            &self,
            event_id: EventId,
        ) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
            Box::pin(async move {
                self.check("attempts_for_event").await?;
                let mut attempts: Vec<_> = self
                    .attempts
                    .read()
                    .await
                    .iter()
                    .filter(|a| a.event_id == event_id)
                    .cloned()
                    .collect();
                attempts.sort_by_key(|a| (a.endpoint_id, a.attempt_number));
                Ok(attempts)
            })
        }

        fn attempts_for_endpoint(
            &self,
            endpoint_id: EndpointId,
            limit: i64,
        ) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
            Box::pin(async move {
                self.check("attempts_for_endpoint").await?;
                let mut attempts: Vec<_> = self
                    .attempts
                    .read()
                    .await
                    .iter()
                    .filter(|a| a.endpoint_id == endpoint_id)
                    .cloned()
                    .collect();
                attempts.sort_by(|a, b| {
                    (b.created_at, b.attempt_number).cmp(&(a.created_at, a.attempt_number))
                });
                attempts.truncate(usize::try_from(limit).unwrap_or(0));
                Ok(attempts)
            })
        }

        fn latest_attempt(
            &self,
            event_id: EventId,
            endpoint_id: EndpointId,
        ) -> StorageFuture<'_, Option<DeliveryAttempt>> {
            Box::pin(async move {
                self.check("latest_attempt").await?;
                Ok(self
                    .attempts
                    .read()
                    .await
                    .iter()
                    .filter(|a| a.event_id == event_id && a.endpoint_id == endpoint_id)
                    .max_by_key(|a| a.attempt_number)
                    .cloned())
            })
        }

        fn claim_due_retries(
            &self,
            now: DateTime<Utc>,
            lease_expired_before: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
            Box::pin(async move {
                self.check("claim_due_retries").await?;
                let mut attempts = self.attempts.write().await;
                let mut due: Vec<_> = attempts
                    .iter()
                    .filter(|a| {
                        a.completed_at.is_some()
                            && a.next_retry_at.is_some_and(|t| t <= now)
                            && a.retry_claimed_at.map_or(true, |c| c < lease_expired_before)
                            && !has_successor(&attempts, a)
                    })
                    .map(|a| (a.next_retry_at, a.id))
                    .collect();
                due.sort();
                due.truncate(limit);

                let mut claimed = Vec::with_capacity(due.len());
                for (_, id) in due {
                    if let Some(attempt) = attempts.iter_mut().find(|a| a.id == id) {
                        attempt.retry_claimed_at = Some(now);
                        claimed.push(attempt.clone());
                    }
                }
                Ok(claimed)
            })
        }

        fn find_interrupted_attempts(
            &self,
            started_before: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
            Box::pin(async move {
                self.check("find_interrupted_attempts").await?;
                let mut attempts: Vec<_> = self
                    .attempts
                    .read()
                    .await
                    .iter()
                    .filter(|a| a.completed_at.is_none() && a.created_at < started_before)
                    .cloned()
                    .collect();
                attempts.sort_by_key(|a| a.created_at);
                attempts.truncate(limit);
                Ok(attempts)
            })
        }

        fn attempt_window_stats(
            &self,
            tenant_id: TenantId,
            since: DateTime<Utc>,
        ) -> StorageFuture<'_, AttemptWindowStats> {
            Box::pin(async move {
                self.check("attempt_window_stats").await?;
                let endpoint_ids = self.tenant_endpoint_ids(tenant_id).await;
                let attempts = self.attempts.read().await;
                let window: Vec<_> = attempts
                    .iter()
                    .filter(|a| endpoint_ids.contains(&a.endpoint_id) && a.created_at >= since)
                    .collect();
                let durations: Vec<i64> = window.iter().filter_map(|a| a.duration_ms).collect();
                let average_duration_ms = if durations.is_empty() {
                    None
                } else {
                    Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
                };
                Ok(AttemptWindowStats {
                    created: window.len() as i64,
                    completed: window.iter().filter(|a| a.completed_at.is_some()).count() as i64,
                    succeeded: window.iter().filter(|a| a.succeeded).count() as i64,
                    average_duration_ms,
                })
            })
        }

        fn health_check(&self) -> StorageFuture<'_, ()> {
            Box::pin(self.check("health_check"))
        }
    }
}
