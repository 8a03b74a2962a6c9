//! Delivery audit store: attempt history, replay and statistics.
//!
//! Reads are tenant scoped; anything owned by another tenant is reported as
//! not found. Replay never rewrites history, it appends a new attempt with
//! the `replay` trigger.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, NaiveTime, Utc};
use courier_core::{
    AttemptTrigger, Clock, DeliveryAttempt, DeliveryStats, EndpointId, Event, EventId,
    EventStatus, TenantId,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{
    dispatcher::chrono_duration,
    error::{DeliveryError, Result},
    executor::{AttemptOutcome, DeliveryExecutor},
    storage::DeliveryStorage,
};

/// Page size used when a listing does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Largest page a listing returns.
pub const MAX_PAGE_SIZE: usize = 100;

/// Time window covered by [`AuditStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsWindow {
    /// Since midnight UTC.
    UtcDay,
    /// A rolling window ending now.
    Rolling(Duration),
}

/// Delivery state of one (event, endpoint) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairSummary {
    /// Endpoint of the pair.
    pub endpoint_id: EndpointId,
    /// Number of attempts made.
    pub attempts: u32,
    /// Highest attempt number.
    pub latest_attempt_number: u32,
    /// Whether the latest attempt succeeded.
    pub succeeded: bool,
    /// Whether the latest attempt is still in flight.
    pub in_flight: bool,
    /// When the next retry is due, if one is pending.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// An event with its first-round status and the state across retries.
#[derive(Debug, Clone, Serialize)]
pub struct EventDeliverySummary {
    /// The event, including its stored first-round status.
    pub event: Event,
    /// Status derived from each pair's latest attempt, `None` while any
    /// pair is in flight or waiting for a retry.
    pub settled_status: Option<EventStatus>,
    /// Per-endpoint delivery state.
    pub pairs: Vec<PairSummary>,
}

/// Derives the settled status from per-pair summaries.
pub fn settled_status(event_status: EventStatus, pairs: &[PairSummary]) -> Option<EventStatus> {
    if !event_status.is_terminal() {
        return None;
    }
    if pairs.iter().any(|p| p.in_flight || p.next_retry_at.is_some()) {
        return None;
    }
    let succeeded = pairs.iter().filter(|p| p.succeeded).count();
    Some(EventStatus::from_round(succeeded, pairs.len() - succeeded))
}

fn summarize(attempts: &[DeliveryAttempt]) -> Vec<PairSummary> {
    let mut latest: BTreeMap<EndpointId, (u32, &DeliveryAttempt)> = BTreeMap::new();
    for attempt in attempts {
        let entry = latest.entry(attempt.endpoint_id).or_insert((0, attempt));
        entry.0 += 1;
        if attempt.attempt_number > entry.1.attempt_number {
            entry.1 = attempt;
        }
    }

    latest
        .into_iter()
        .map(|(endpoint_id, (count, attempt))| PairSummary {
            endpoint_id,
            attempts: count,
            latest_attempt_number: attempt.attempt_number,
            succeeded: attempt.succeeded,
            in_flight: !attempt.is_completed(),
            next_retry_at: attempt.next_retry_at,
        })
        .collect()
}

/// Clamps a requested page size to `1..=MAX_PAGE_SIZE`.
pub fn page_size(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Tenant-scoped view over the attempt table.
#[derive(Clone)]
pub struct AuditStore {
    storage: Arc<dyn DeliveryStorage>,
    executor: DeliveryExecutor,
    clock: Arc<dyn Clock>,
    stats_window: StatsWindow,
}

impl AuditStore {
    /// Creates an audit store.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        executor: DeliveryExecutor,
        clock: Arc<dyn Clock>,
        stats_window: StatsWindow,
    ) -> Self {
        Self { storage, executor, clock, stats_window }
    }

    /// Newest attempts to an endpoint, soft-deleted endpoints included.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the endpoint is not the tenant's.
    pub async fn list_for_endpoint(
        &self,
        tenant_id: TenantId,
        endpoint_id: EndpointId,
        limit: Option<usize>,
    ) -> Result<Vec<DeliveryAttempt>> {
        match self.storage.find_endpoint(endpoint_id).await? {
            Some(endpoint) if endpoint.tenant_id == tenant_id => {},
            _ => return Err(DeliveryError::not_found(format!("endpoint {endpoint_id}"))),
        }
        let limit = i64::try_from(page_size(limit)).unwrap_or(i64::MAX);
        Ok(self.storage.attempts_for_endpoint(endpoint_id, limit).await?)
    }

    /// Every attempt for an event, grouped by endpoint in attempt order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the event is not the tenant's.
    pub async fn list_for_event(
        &self,
        tenant_id: TenantId,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>> {
        self.tenant_event(tenant_id, event_id).await?;
        Ok(self.storage.attempts_for_event(event_id).await?)
    }

    /// The event with its first-round status and settled status.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the event is not the tenant's.
    pub async fn event_summary(
        &self,
        tenant_id: TenantId,
        event_id: EventId,
    ) -> Result<EventDeliverySummary> {
        let event = self.tenant_event(tenant_id, event_id).await?;
        let attempts = self.storage.attempts_for_event(event_id).await?;
        let pairs = summarize(&attempts);
        Ok(EventDeliverySummary {
            settled_status: settled_status(event.status, &pairs),
            event,
            pairs,
        })
    }

    /// Re-sends the event of a failed attempt as a new `replay` attempt,
    /// signed with the endpoint's current secret.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the attempt is not the tenant's or its endpoint
    /// was deleted, and `Conflict` if the attempt succeeded or the pair has
    /// an attempt in flight or a retry pending.
    pub async fn replay(&self, tenant_id: TenantId, attempt_id: Uuid) -> Result<AttemptOutcome> {
        let attempt = self
            .storage
            .find_attempt(attempt_id)
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("delivery attempt {attempt_id}")))?;
        let event = self
            .tenant_event(tenant_id, attempt.event_id)
            .await
            .map_err(|_| DeliveryError::not_found(format!("delivery attempt {attempt_id}")))?;

        if attempt.succeeded {
            return Err(DeliveryError::conflict("attempt already succeeded"));
        }
        if !attempt.is_completed() {
            return Err(DeliveryError::conflict("attempt is still in flight"));
        }

        let latest = self
            .storage
            .latest_attempt(attempt.event_id, attempt.endpoint_id)
            .await?
            .unwrap_or_else(|| attempt.clone());
        if !latest.is_completed() {
            return Err(DeliveryError::conflict("another attempt for this delivery is in flight"));
        }
        if latest.has_pending_retry() {
            return Err(DeliveryError::conflict("a retry is already scheduled for this delivery"));
        }

        let endpoint = match self.storage.find_endpoint(attempt.endpoint_id).await? {
            Some(endpoint) if endpoint.deleted_at.is_none() => endpoint,
            _ => return Err(DeliveryError::not_found(format!("endpoint {}", attempt.endpoint_id))),
        };

        info!(
            %attempt_id,
            event_id = %event.id,
            endpoint_id = %endpoint.id,
            attempt_number = latest.attempt_number + 1,
            "replaying delivery"
        );
        self.executor
            .attempt(&endpoint, &event, latest.attempt_number + 1, AttemptTrigger::Replay)
            .await
    }

    /// Aggregate delivery statistics over the configured window.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if a query fails.
    pub async fn stats(&self, tenant_id: TenantId) -> Result<DeliveryStats> {
        let since = self.window_start();
        let (endpoint_count, active_endpoint_count) =
            self.storage.count_endpoints(tenant_id).await?;
        let events_today = self.storage.count_events_since(tenant_id, since).await?;
        let window = self.storage.attempt_window_stats(tenant_id, since).await?;

        let success_rate = if window.completed > 0 {
            window.succeeded as f64 / window.completed as f64
        } else {
            0.0
        };

        Ok(DeliveryStats {
            endpoint_count,
            active_endpoint_count,
            events_today,
            deliveries_today: window.created,
            success_rate,
            average_response_ms: window.average_duration_ms.unwrap_or(0.0),
        })
    }

    fn window_start(&self) -> DateTime<Utc> {
        let now = self.clock.now_utc();
        match self.stats_window {
            StatsWindow::UtcDay => now.date_naive().and_time(NaiveTime::MIN).and_utc(),
            StatsWindow::Rolling(window) => now - chrono_duration(window),
        }
    }

    async fn tenant_event(&self, tenant_id: TenantId, event_id: EventId) -> Result<Event> {
        match self.storage.find_event(event_id).await? {
            Some(event) if event.tenant_id == tenant_id => Ok(event),
            _ => Err(DeliveryError::not_found(format!("event {event_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{EventType, NoOpEventHandler, TestClock};
    use serde_json::json;
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{
        client::{ClientConfig, DeliveryClient},
        dispatcher::Dispatcher,
        engine::DeliveryConfig,
        registry::{EndpointRegistry, NewEndpoint, RegistryDefaults},
        storage::mock::MockDeliveryStorage,
    };

    struct Fixture {
        storage: Arc<MockDeliveryStorage>,
        clock: Arc<TestClock>,
        registry: EndpointRegistry,
        dispatcher: Dispatcher,
        audit: AuditStore,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MockDeliveryStorage::new());
        let clock = Arc::new(TestClock::starting_at(
            DateTime::parse_from_rfc3339("2024-05-10T15:00:00Z").unwrap().with_timezone(&Utc),
        ));
        let handler = Arc::new(NoOpEventHandler::new());
        let client = Arc::new(
            DeliveryClient::new(ClientConfig {
                timeout: Duration::from_secs(2),
                ..ClientConfig::default()
            })
            .unwrap(),
        );
        let executor = DeliveryExecutor::new(storage.clone(), client, clock.clone(), handler.clone());
        let config = DeliveryConfig::default();
        let dispatcher = Dispatcher::new(
            storage.clone(),
            executor.clone(),
            clock.clone(),
            handler,
            Arc::new(tokio::sync::Semaphore::new(4)),
            &config,
        );
        let audit = AuditStore::new(storage.clone(), executor, clock.clone(), StatsWindow::UtcDay);
        let registry =
            EndpointRegistry::new(storage.clone(), clock.clone(), RegistryDefaults::default());
        Fixture { storage, clock, registry, dispatcher, audit }
    }

    async fn failing_delivery(fx: &Fixture, max_retries: i32) -> (TenantId, Event, MockServer) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let tenant_id = TenantId::new();
        fx.registry
            .create(
                tenant_id,
                NewEndpoint {
                    name: "receiver".to_string(),
                    url: server.uri(),
                    event_types: vec!["*".to_string()],
                    max_retries: Some(max_retries),
                    ..NewEndpoint::default()
                },
            )
            .await
            .unwrap();
        let event = fx
            .dispatcher
            .create_event(tenant_id, EventType::SubscriptionCreated, json!({}), None, None)
            .await
            .unwrap();
        fx.dispatcher.process_batch().await.unwrap();
        (tenant_id, event, server)
    }

    #[test]
    fn page_size_is_clamped() {
        assert_eq!(page_size(None), 20);
        assert_eq!(page_size(Some(0)), 1);
        assert_eq!(page_size(Some(500)), 100);
        assert_eq!(page_size(Some(42)), 42);
    }

    #[tokio::test]
    async fn replay_is_rejected_while_retry_pending() {
        let fx = fixture();
        let (tenant_id, event, _server) = failing_delivery(&fx, 3).await;
        let attempt = &fx.storage.all_attempts().await[0];

        let result = fx.audit.replay(tenant_id, attempt.id).await;

        assert!(matches!(result, Err(DeliveryError::Conflict { .. })));
        let summary = fx.audit.event_summary(tenant_id, event.id).await.unwrap();
        assert_eq!(summary.event.status, EventStatus::Failed);
        assert_eq!(summary.settled_status, None);
    }

    #[tokio::test]
    async fn replay_appends_attempt_without_touching_history() {
        let fx = fixture();
        let (tenant_id, event, server) = failing_delivery(&fx, 1).await;
        let original = fx.storage.all_attempts().await[0].clone();
        assert!(original.next_retry_at.is_none());

        server.reset().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let outcome = fx.audit.replay(tenant_id, original.id).await.unwrap();

        assert!(outcome.succeeded);
        assert_eq!(outcome.attempt_number, 2);
        let attempts = fx.audit.list_for_event(tenant_id, event.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].id, original.id);
        assert!(!attempts[0].succeeded);
        assert_eq!(attempts[1].trigger, AttemptTrigger::Replay);

        let summary = fx.audit.event_summary(tenant_id, event.id).await.unwrap();
        assert_eq!(summary.event.status, EventStatus::Failed);
        assert_eq!(summary.settled_status, Some(EventStatus::Delivered));

        let result = fx.audit.replay(tenant_id, attempts[1].id).await;
        assert!(matches!(result, Err(DeliveryError::Conflict { .. })));
    }

    #[tokio::test]
    async fn other_tenants_see_nothing() {
        let fx = fixture();
        let (_, event, _server) = failing_delivery(&fx, 1).await;
        let attempt = &fx.storage.all_attempts().await[0];
        let stranger = TenantId::new();

        assert!(matches!(
            fx.audit.replay(stranger, attempt.id).await,
            Err(DeliveryError::NotFound { .. })
        ));
        assert!(matches!(
            fx.audit.list_for_event(stranger, event.id).await,
            Err(DeliveryError::NotFound { .. })
        ));
        assert!(matches!(
            fx.audit.list_for_endpoint(stranger, attempt.endpoint_id, None).await,
            Err(DeliveryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stats_cover_the_current_utc_day() {
        let fx = fixture();
        let (tenant_id, _, _server) = failing_delivery(&fx, 1).await;

        let stats = fx.audit.stats(tenant_id).await.unwrap();
        assert_eq!(stats.endpoint_count, 1);
        assert_eq!(stats.active_endpoint_count, 1);
        assert_eq!(stats.events_today, 1);
        assert_eq!(stats.deliveries_today, 1);
        assert_eq!(stats.success_rate, 0.0);

        fx.clock.advance(Duration::from_secs(10 * 3600));
        let tomorrow = fx.audit.stats(tenant_id).await.unwrap();
        assert_eq!(tomorrow.events_today, 0);
        assert_eq!(tomorrow.deliveries_today, 0);
        assert_eq!(tomorrow.endpoint_count, 1);
    }

    #[test]
    fn settled_status_waits_for_pending_pairs() {
        let pair = |succeeded, next_retry_at: Option<DateTime<Utc>>| PairSummary {
            endpoint_id: EndpointId::new(),
            attempts: 1,
            latest_attempt_number: 1,
            succeeded,
            in_flight: false,
            next_retry_at,
        };

        assert_eq!(settled_status(EventStatus::Processing, &[]), None);
        assert_eq!(settled_status(EventStatus::Delivered, &[]), Some(EventStatus::Delivered));
        assert_eq!(
            settled_status(EventStatus::Partial, &[pair(true, None), pair(false, Some(Utc::now()))]),
            None
        );
        assert_eq!(
            settled_status(EventStatus::Partial, &[pair(true, None), pair(false, None)]),
            Some(EventStatus::Partial)
        );
    }
}
