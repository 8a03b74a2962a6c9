//! Durable retry scheduling.
//!
//! A failed attempt carries the due time of its successor in
//! `next_retry_at`. The scheduler polls for due attempts that have no
//! successor and no live lease, leases them with `SKIP LOCKED`, and runs
//! the next attempt. Nothing lives in memory between polls, so a restart
//! picks up exactly where the previous process stopped.

use std::{sync::Arc, time::Duration};

use courier_core::{AttemptTrigger, Clock, DeliveryAttempt};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::chrono_duration,
    engine::DeliveryConfig,
    error::{DeliveryError, Result},
    executor::{AttemptOutcome, DeliveryExecutor},
    storage::DeliveryStorage,
};

const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Polls the attempt table for due retries and interrupted attempts.
#[derive(Clone)]
pub struct RetryScheduler {
    storage: Arc<dyn DeliveryStorage>,
    executor: DeliveryExecutor,
    clock: Arc<dyn Clock>,
    delivery_slots: Arc<Semaphore>,
    poll_interval: Duration,
    batch_size: usize,
    retry_lease: Duration,
    interrupted_after: Duration,
}

impl RetryScheduler {
    /// Creates a scheduler sharing `delivery_slots` with the dispatcher.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        executor: DeliveryExecutor,
        clock: Arc<dyn Clock>,
        delivery_slots: Arc<Semaphore>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            storage,
            executor,
            clock,
            delivery_slots,
            poll_interval: config.retry_poll_interval,
            batch_size: config.retry_batch_size,
            retry_lease: config.processing_lease,
            interrupted_after: config.interrupted_after(),
        }
    }

    /// Scheduler loop: polls until cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "retry scheduler starting");

        loop {
            if cancellation_token.is_cancelled() {
                break;
            }

            let pause = match self.run_once().await {
                Ok(fired) if fired >= self.batch_size => Duration::ZERO,
                Ok(_) => self.poll_interval,
                Err(error) => {
                    error!(error = %error, "retry scheduler poll failed");
                    ERROR_BACKOFF
                },
            };

            if !pause.is_zero() {
                tokio::select! {
                    () = self.clock.sleep(pause) => {},
                    () = cancellation_token.cancelled() => break,
                }
            }
        }

        info!("retry scheduler stopped");
    }

    /// Recovers interrupted attempts, then fires every due retry in one
    /// batch. Returns the number of retries fired.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the attempt table cannot be read.
    pub async fn run_once(&self) -> Result<usize> {
        self.recover_interrupted().await?;

        let now = self.clock.now_utc();
        let lease_expired_before = now - chrono_duration(self.retry_lease);
        let due = self.storage.claim_due_retries(now, lease_expired_before, self.batch_size).await?;
        let fired = due.len();
        if fired == 0 {
            return Ok(0);
        }

        debug!(fired, "firing due retries");

        let mut tasks = JoinSet::new();
        for failed in due {
            let scheduler = self.clone();
            tasks.spawn(async move {
                let _permit = scheduler
                    .delivery_slots
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| DeliveryError::internal("delivery slots closed"))?;
                scheduler.fire(&failed).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => {},
                Ok(Err(error)) => warn!(error = %error, "retry not recorded, will be re-leased"),
                Err(join_error) => error!(error = %join_error, "retry task failed"),
            }
        }

        Ok(fired)
    }

    /// Runs the successor of `failed`. Returns `None` when the successor
    /// already exists or its event or endpoint is gone.
    async fn fire(&self, failed: &DeliveryAttempt) -> Result<Option<AttemptOutcome>> {
        let (Some(event), Some(endpoint)) = (
            self.storage.find_event(failed.event_id).await?,
            self.storage.find_endpoint(failed.endpoint_id).await?,
        ) else {
            warn!(
                attempt_id = %failed.id,
                event_id = %failed.event_id,
                endpoint_id = %failed.endpoint_id,
                "retry target missing, skipping"
            );
            return Ok(None);
        };

        let next = failed.attempt_number + 1;
        debug!(event_id = %event.id, endpoint_id = %endpoint.id, attempt_number = next, "retrying delivery");

        match self.executor.attempt(&endpoint, &event, next, AttemptTrigger::Retry).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(DeliveryError::Conflict { .. }) => {
                debug!(event_id = %event.id, endpoint_id = %endpoint.id, "retry already issued");
                Ok(None)
            },
            Err(error) => Err(error),
        }
    }

    async fn recover_interrupted(&self) -> Result<usize> {
        let started_before = self.clock.now_utc() - chrono_duration(self.interrupted_after);
        let stuck = self.storage.find_interrupted_attempts(started_before, self.batch_size).await?;

        let mut recovered = 0;
        for attempt in stuck {
            if self.executor.is_in_flight(attempt.id) {
                continue;
            }
            match self.executor.recover_interrupted(&attempt).await {
                Ok(Some(_)) => recovered += 1,
                Ok(None) => {},
                Err(error) => {
                    warn!(attempt_id = %attempt.id, error = %error, "interrupted attempt not recovered");
                },
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{Endpoint, EventType, NoOpEventHandler, TestClock, TenantId};
    use serde_json::json;
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{
        client::{ClientConfig, DeliveryClient},
        dispatcher::Dispatcher,
        registry::{EndpointRegistry, NewEndpoint, RegistryDefaults},
        storage::mock::MockDeliveryStorage,
    };

    struct Fixture {
        storage: Arc<MockDeliveryStorage>,
        clock: Arc<TestClock>,
        registry: EndpointRegistry,
        dispatcher: Dispatcher,
        scheduler: RetryScheduler,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MockDeliveryStorage::new());
        let clock = Arc::new(TestClock::new());
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
        let slots = Arc::new(Semaphore::new(config.max_concurrent_deliveries));
        let dispatcher = Dispatcher::new(
            storage.clone(),
            executor.clone(),
            clock.clone(),
            handler,
            slots.clone(),
            &config,
        );
        let scheduler = RetryScheduler::new(storage.clone(), executor, clock.clone(), slots, &config);
        let registry =
            EndpointRegistry::new(storage.clone(), clock.clone(), RegistryDefaults::default());
        Fixture { storage, clock, registry, dispatcher, scheduler }
    }

    async fn register(fx: &Fixture, tenant_id: TenantId, url: String) -> Endpoint {
        fx.registry
            .create(
                tenant_id,
                NewEndpoint {
                    name: "receiver".to_string(),
                    url,
                    event_types: vec!["*".to_string()],
                    retry_delay_seconds: Some(10),
                    ..NewEndpoint::default()
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn retries_fire_only_when_due() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let fx = fixture();
        let tenant_id = TenantId::new();
        register(&fx, tenant_id, server.uri()).await;
        fx.dispatcher
            .create_event(tenant_id, EventType::CommentCreated, json!({}), None, None)
            .await
            .unwrap();
        fx.dispatcher.process_batch().await.unwrap();

        assert_eq!(fx.scheduler.run_once().await.unwrap(), 0);

        fx.clock.advance(Duration::from_secs(10));
        assert_eq!(fx.scheduler.run_once().await.unwrap(), 1);
        assert_eq!(fx.storage.all_attempts().await.len(), 2);

        // Attempt 3 is due 20 seconds after attempt 2.
        fx.clock.advance(Duration::from_secs(19));
        assert_eq!(fx.scheduler.run_once().await.unwrap(), 0);
        fx.clock.advance(Duration::from_secs(1));
        assert_eq!(fx.scheduler.run_once().await.unwrap(), 1);

        // Attempt 3 exhausts the default budget of 3.
        fx.clock.advance(Duration::from_secs(3600));
        assert_eq!(fx.scheduler.run_once().await.unwrap(), 0);

        let attempts = fx.storage.all_attempts().await;
        let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(attempts[2].next_retry_at.is_none());
        assert!(attempts[1..].iter().all(|a| a.trigger == AttemptTrigger::Retry));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn retries_still_fire_for_deactivated_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let fx = fixture();
        let tenant_id = TenantId::new();
        let endpoint = register(&fx, tenant_id, server.uri()).await;
        fx.dispatcher
            .create_event(tenant_id, EventType::VoteCreated, json!({}), None, None)
            .await
            .unwrap();
        fx.dispatcher.process_batch().await.unwrap();
        fx.registry.set_active(tenant_id, endpoint.id, false).await.unwrap();

        fx.clock.advance(Duration::from_secs(10));

        assert_eq!(fx.scheduler.run_once().await.unwrap(), 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn leased_retry_is_not_fired_twice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let fx = fixture();
        let tenant_id = TenantId::new();
        register(&fx, tenant_id, server.uri()).await;
        fx.dispatcher
            .create_event(tenant_id, EventType::FeedbackDeleted, json!({}), None, None)
            .await
            .unwrap();
        fx.dispatcher.process_batch().await.unwrap();
        fx.clock.advance(Duration::from_secs(10));

        let now = fx.clock.now_utc();
        let leased = fx.storage.claim_due_retries(now, now, 10).await.unwrap();
        assert_eq!(leased.len(), 1);

        assert_eq!(fx.scheduler.run_once().await.unwrap(), 0);
        assert_eq!(fx.storage.all_attempts().await.len(), 1);
    }

    #[tokio::test]
    async fn storage_outage_is_reported_and_retry_survives() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let fx = fixture();
        let tenant_id = TenantId::new();
        register(&fx, tenant_id, server.uri()).await;
        fx.dispatcher
            .create_event(tenant_id, EventType::FeedbackUpdated, json!({}), None, None)
            .await
            .unwrap();
        fx.dispatcher.process_batch().await.unwrap();
        fx.clock.advance(Duration::from_secs(10));

        fx.storage.fail_always("claim_due_retries").await;
        assert!(fx.scheduler.run_once().await.is_err());
        fx.storage.recover().await;

        assert_eq!(fx.scheduler.run_once().await.unwrap(), 1);
    }
}
