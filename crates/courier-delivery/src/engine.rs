//! Delivery engine: wires the registry, dispatcher, executor, retry
//! scheduler and audit store over one storage backend and runs the
//! background workers.

use std::{sync::Arc, time::Duration};

use courier_core::{
    AttemptTrigger, Clock, EndpointId, Event, EventHandler, EventStatus, EventType,
    NoOpEventHandler, TenantId,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    audit::{AuditStore, StatsWindow},
    client::{ClientConfig, DeliveryClient},
    dispatcher::Dispatcher,
    error::Result,
    executor::{AttemptOutcome, DeliveryExecutor},
    registry::{EndpointRegistry, RegistryDefaults},
    scheduler::RetryScheduler,
    storage::DeliveryStorage,
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of dispatcher workers.
    pub worker_count: usize,

    /// Maximum events claimed per dispatcher batch.
    pub batch_size: usize,

    /// How often idle dispatcher workers poll for events.
    pub poll_interval: Duration,

    /// How often the retry scheduler polls for due retries.
    pub retry_poll_interval: Duration,

    /// Maximum retries fired per scheduler poll.
    pub retry_batch_size: usize,

    /// Upper bound on concurrent HTTP attempts across the engine.
    pub max_concurrent_deliveries: usize,

    /// How long a claimed event or leased retry stays owned by one worker
    /// before another may take it over.
    pub processing_lease: Duration,

    /// Maximum time to wait for workers on shutdown.
    pub shutdown_timeout: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Defaults for new endpoints.
    pub registry_defaults: RegistryDefaults,

    /// Window covered by delivery statistics.
    pub stats_window: StatsWindow,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            retry_poll_interval: Duration::from_secs(1),
            retry_batch_size: 50,
            max_concurrent_deliveries: 64,
            processing_lease: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            client_config: ClientConfig::default(),
            registry_defaults: RegistryDefaults::default(),
            stats_window: StatsWindow::UtcDay,
        }
    }
}

impl DeliveryConfig {
    /// Age after which an attempt without an outcome is treated as lost.
    ///
    /// Twice the HTTP timeout, so a call still waiting on its response is
    /// never mistaken for a crashed one.
    pub fn interrupted_after(&self) -> Duration {
        self.client_config.timeout.saturating_mul(2)
    }
}

/// Result of a synthetic test delivery.
#[derive(Debug, Clone, Serialize)]
pub struct TestDelivery {
    /// The `webhook.test` event that was sent.
    pub event: Event,
    /// Outcome of the single attempt.
    pub outcome: AttemptOutcome,
}

/// Cloneable handle to the engine's request-path services.
#[derive(Clone)]
pub struct DeliveryServices {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
    executor: DeliveryExecutor,
    registry: EndpointRegistry,
    dispatcher: Dispatcher,
    audit: AuditStore,
}

impl DeliveryServices {
    /// Endpoint registry.
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Event intake.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Attempt history, replay and stats.
    pub fn audit(&self) -> &AuditStore {
        &self.audit
    }

    /// Sends a `webhook.test` event to one endpoint, bypassing
    /// subscriptions and the active flag. The attempt is a single shot and
    /// the event's status reflects its outcome. Dispatcher workers never
    /// claim test events, so one left `processing` by a failed write is not
    /// fanned out to the tenant's subscribers.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the endpoint is not the tenant's, and
    /// `DatabaseError` if the event or attempt cannot be stored.
    pub async fn send_test_event(
        &self,
        tenant_id: TenantId,
        endpoint_id: EndpointId,
    ) -> Result<TestDelivery> {
        let endpoint = self.registry.get(tenant_id, endpoint_id).await?;
        let now = self.clock.now_utc();

        let mut event = Event::new(
            tenant_id,
            EventType::WebhookTest,
            json!({
                "message": "This is a test delivery from Courier",
                "endpoint_id": endpoint.id,
                "endpoint_name": endpoint.name,
            }),
            Some("endpoint".to_string()),
            Some(endpoint.id.to_string()),
            now,
        );
        event.status = EventStatus::Processing;
        event.claimed_at = Some(now);
        self.storage.insert_event(event.clone()).await?;

        let outcome = self.executor.attempt(&endpoint, &event, 1, AttemptTrigger::Test).await?;

        let status = if outcome.succeeded { EventStatus::Delivered } else { EventStatus::Failed };
        let processed_at = self.clock.now_utc();
        self.storage.complete_event(event.id, status, processed_at).await?;
        event.status = status;
        event.processed_at = Some(processed_at);

        info!(%endpoint_id, event_id = %event.id, succeeded = outcome.succeeded, "test delivery sent");
        Ok(TestDelivery { event, outcome })
    }

    /// Verifies the storage backend is reachable.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if it is not.
    pub async fn health_check(&self) -> Result<()> {
        Ok(self.storage.health_check().await?)
    }
}

/// The delivery engine.
pub struct DeliveryEngine {
    config: DeliveryConfig,
    services: DeliveryServices,
    scheduler: RetryScheduler,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates an engine that publishes no outcome notifications.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_event_handler(storage, config, clock, Arc::new(NoOpEventHandler::new()))
    }

    /// Creates an engine publishing outcomes to `event_handler`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built.
    pub fn with_event_handler(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);
        let executor =
            DeliveryExecutor::new(storage.clone(), client, clock.clone(), event_handler.clone());
        let delivery_slots = Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1)));

        let dispatcher = Dispatcher::new(
            storage.clone(),
            executor.clone(),
            clock.clone(),
            event_handler,
            delivery_slots.clone(),
            &config,
        );
        let scheduler = RetryScheduler::new(
            storage.clone(),
            executor.clone(),
            clock.clone(),
            delivery_slots,
            &config,
        );
        let registry =
            EndpointRegistry::new(storage.clone(), clock.clone(), config.registry_defaults);
        let audit =
            AuditStore::new(storage.clone(), executor.clone(), clock.clone(), config.stats_window);

        Ok(Self {
            services: DeliveryServices { storage, clock, executor, registry, dispatcher, audit },
            scheduler,
            config,
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
        })
    }

    /// Handle for request-path callers such as the management API.
    pub fn services(&self) -> DeliveryServices {
        self.services.clone()
    }

    /// Engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Spawns dispatcher workers and the retry scheduler. Returns
    /// immediately.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for startup checks.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Ok(());
        }

        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            max_concurrent_deliveries = self.config.max_concurrent_deliveries,
            "starting delivery engine"
        );

        let mut pool = WorkerPool::new(
            self.services.dispatcher.clone(),
            self.scheduler.clone(),
            self.config.worker_count,
            self.cancellation_token.clone(),
        );
        pool.spawn_workers();
        self.worker_pool = Some(pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Number of running background tasks.
    pub fn active_workers(&self) -> usize {
        self.worker_pool.as_ref().map_or(0, WorkerPool::active_workers)
    }

    /// Stops workers, letting in-flight attempts finish within the
    /// configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` or `WorkerPanic`.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        match self.worker_pool.take() {
            Some(pool) => pool.shutdown_graceful(self.config.shutdown_timeout).await,
            None => {
                info!("delivery engine was not started");
                Ok(())
            },
        }
    }

    /// Claims and processes one batch of pending events in the caller's
    /// task, without background workers.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if claiming fails.
    pub async fn process_batch(&self) -> Result<usize> {
        self.services.dispatcher.process_batch().await
    }

    /// Runs one retry scheduler poll in the caller's task.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the attempt table cannot be read.
    pub async fn run_retries_once(&self) -> Result<usize> {
        self.scheduler.run_once().await
    }
}
