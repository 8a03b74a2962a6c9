//! Event intake and first-round fan-out.
//!
//! `create_event` persists a pending event and wakes a worker. Workers claim
//! pending events, plus processing events whose lease has expired, one at a
//! time with `FOR UPDATE SKIP LOCKED`, run attempt 1 against every subscribed
//! endpoint concurrently, and record the first-round status. Each claim
//! starts a fresh lease, so a long batch never ages out events it has not
//! reached yet.
//!
//! ```text
//! pending ──claim──▶ processing ──first round──▶ delivered | failed | partial
//!                        ▲   │
//!                        └───┘ lease expired, reclaimed
//! ```

use std::{collections::HashMap, sync::Arc, time::Duration};

use courier_core::{
    AttemptTrigger, Clock, DeliveryAttempt, DeliveryEvent, Endpoint, EndpointId, Event, EventHandler,
    EventProcessedEvent, EventStatus, EventType, TenantId,
};
use serde_json::Value;
use tokio::{
    sync::{Notify, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::DeliveryConfig,
    error::{DeliveryError, Result},
    executor::{AttemptOutcome, DeliveryExecutor},
    storage::DeliveryStorage,
};

const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Creates events and drives their first fan-out round.
#[derive(Clone)]
pub struct Dispatcher {
    storage: Arc<dyn DeliveryStorage>,
    executor: DeliveryExecutor,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
    delivery_slots: Arc<Semaphore>,
    wakeup: Arc<Notify>,
    batch_size: usize,
    poll_interval: Duration,
    processing_lease: Duration,
    interrupted_after: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher sharing `delivery_slots` with the retry
    /// scheduler.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        executor: DeliveryExecutor,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
        delivery_slots: Arc<Semaphore>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            storage,
            executor,
            clock,
            event_handler,
            delivery_slots,
            wakeup: Arc::new(Notify::new()),
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            processing_lease: config.processing_lease,
            interrupted_after: config.interrupted_after(),
        }
    }

    /// Persists a pending event and wakes a worker to process it.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the insert fails.
    pub async fn create_event(
        &self,
        tenant_id: TenantId,
        event_type: EventType,
        payload: Value,
        origin_model: Option<String>,
        origin_id: Option<String>,
    ) -> Result<Event> {
        let event =
            Event::new(tenant_id, event_type, payload, origin_model, origin_id, self.clock.now_utc());
        self.storage.insert_event(event.clone()).await?;
        self.wakeup.notify_one();

        info!(event_id = %event.id, %tenant_id, %event_type, "event created");
        Ok(event)
    }

    /// Worker loop: claims and processes batches until cancelled.
    pub async fn run(&self, worker_id: usize, cancellation_token: CancellationToken) {
        info!(worker_id, "dispatcher worker starting");

        loop {
            if cancellation_token.is_cancelled() {
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.poll_interval) => {},
                        () = self.wakeup.notified() => {},
                        () = cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(worker_id, error = %error, "dispatcher batch failed");
                    tokio::select! {
                        () = self.clock.sleep(ERROR_BACKOFF) => {},
                        () = cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id, "dispatcher worker stopped");
    }

    /// Claims and processes up to one batch of events, one claim per event.
    /// Returns how many events were claimed.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the first claim fails. Per-event failures
    /// are logged and leave the event to be reclaimed after its lease.
    pub async fn process_batch(&self) -> Result<usize> {
        let mut claimed = 0;

        while claimed < self.batch_size {
            let now = self.clock.now_utc();
            let stale_before = now - chrono_duration(self.processing_lease);
            let event = match self.storage.claim_events(1, now, stale_before).await {
                Ok(mut events) => match events.pop() {
                    Some(event) => event,
                    None => break,
                },
                Err(error) if claimed == 0 => return Err(error.into()),
                Err(error) => {
                    warn!(claimed, error = %error, "claim failed mid-batch");
                    break;
                },
            };
            claimed += 1;

            let event_id = event.id;
            debug!(%event_id, "claimed event");
            if let Err(error) = self.process_event(event).await {
                error!(%event_id, error = %error, "event processing failed");
            }
        }

        Ok(claimed)
    }

    /// Runs the first delivery round for a claimed event and records its
    /// status.
    ///
    /// Endpoints that already have a first attempt, from a worker that died
    /// mid-round, keep that attempt's outcome. An attempt without an outcome
    /// is recovered as interrupted only once it is older than twice the HTTP
    /// timeout and no local call for it is running. Otherwise it may still
    /// get its response, so the event is left `processing` for a later lease
    /// and `Processing` is returned.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if any attempt could not be recorded.
    /// The event then stays `processing` until its lease expires.
    pub async fn process_event(&self, event: Event) -> Result<EventStatus> {
        let event = Arc::new(event);
        let existing: HashMap<EndpointId, DeliveryAttempt> = self
            .storage
            .attempts_for_event(event.id)
            .await?
            .into_iter()
            .filter(|a| a.attempt_number == 1)
            .map(|a| (a.endpoint_id, a))
            .collect();

        let now = self.clock.now_utc();
        let live_before = now - chrono_duration(self.interrupted_after);
        if let Some(live) = existing.values().find(|a| {
            !a.is_completed() && (a.created_at > live_before || self.executor.is_in_flight(a.id))
        }) {
            debug!(
                event_id = %event.id,
                attempt_id = %live.id,
                endpoint_id = %live.endpoint_id,
                "first attempt may still be in flight, leaving event for a later lease"
            );
            return Ok(EventStatus::Processing);
        }

        let endpoints = self.round_endpoints(&event, &existing).await?;

        debug!(event_id = %event.id, endpoints = endpoints.len(), "fanning out event");

        let mut outcomes = Vec::with_capacity(endpoints.len());
        let mut tasks = JoinSet::new();

        for endpoint in endpoints {
            match existing.get(&endpoint.id) {
                Some(attempt) if attempt.is_completed() => {
                    outcomes.push(AttemptOutcome::from_attempt(attempt));
                },
                Some(attempt) => {
                    outcomes.push(self.recover_first_attempt(attempt).await?);
                },
                None => {
                    let executor = self.executor.clone();
                    let slots = self.delivery_slots.clone();
                    let event = event.clone();
                    tasks.spawn(async move {
                        let _permit = slots
                            .acquire_owned()
                            .await
                            .map_err(|_| DeliveryError::internal("delivery slots closed"))?;
                        executor
                            .attempt(&endpoint, &event, 1, AttemptTrigger::Dispatch)
                            .await
                    });
                },
            }
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(error)) => {
                    warn!(event_id = %event.id, error = %error, "first attempt not recorded");
                    first_error.get_or_insert(error);
                },
                Err(join_error) => {
                    first_error
                        .get_or_insert(DeliveryError::internal(format!("attempt task failed: {join_error}")));
                },
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        let succeeded = outcomes.iter().filter(|o| o.succeeded).count();
        let failed = outcomes.len() - succeeded;
        let status = EventStatus::from_round(succeeded, failed);

        if self.storage.complete_event(event.id, status, self.clock.now_utc()).await? {
            info!(event_id = %event.id, %status, succeeded, failed, "event processed");
            self.event_handler
                .handle_event(DeliveryEvent::EventProcessed(EventProcessedEvent {
                    event_id: event.id,
                    tenant_id: event.tenant_id,
                    status,
                    succeeded,
                    failed,
                }))
                .await;
        } else {
            debug!(event_id = %event.id, "event already completed by another worker");
        }

        Ok(status)
    }

    /// Subscribers at claim time, plus endpoints that already received
    /// attempt 1 in an interrupted round.
    async fn round_endpoints(
        &self,
        event: &Event,
        existing: &HashMap<EndpointId, DeliveryAttempt>,
    ) -> Result<Vec<Endpoint>> {
        let mut endpoints =
            self.storage.find_active_subscribers(event.tenant_id, event.event_type).await?;

        for endpoint_id in existing.keys() {
            if endpoints.iter().any(|e| e.id == *endpoint_id) {
                continue;
            }
            if let Some(endpoint) = self.storage.find_endpoint(*endpoint_id).await? {
                endpoints.push(endpoint);
            }
        }
        Ok(endpoints)
    }

    async fn recover_first_attempt(&self, attempt: &DeliveryAttempt) -> Result<AttemptOutcome> {
        if let Some(outcome) = self.executor.recover_interrupted(attempt).await? {
            return Ok(outcome);
        }
        let recorded = self
            .storage
            .find_attempt(attempt.id)
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("attempt {}", attempt.id)))?;
        Ok(AttemptOutcome::from_attempt(&recorded))
    }
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
