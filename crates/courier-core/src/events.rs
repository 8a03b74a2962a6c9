//! Delivery outcome notifications.
//!
//! The executor and dispatcher publish outcomes through [`EventHandler`] so
//! that downstream consumers (metrics sinks, alerting, tests) observe the
//! pipeline without the pipeline knowing about them.
//!
//! ```text
//! DeliveryExecutor ──AttemptSucceeded/AttemptFailed──┐
//!                                                    ├──▶ EventHandler
//! Dispatcher ───────────EventProcessed───────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AttemptTrigger, EndpointId, EventId, EventStatus, TenantId};

/// Notifications emitted by the delivery pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// An endpoint answered with a 2xx status.
    AttemptSucceeded(AttemptSucceededEvent),

    /// An attempt ended with a non-2xx status or a transport error.
    AttemptFailed(AttemptFailedEvent),

    /// An event finished its first fan-out round.
    EventProcessed(EventProcessedEvent),
}

/// Emitted when an endpoint accepts a delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSucceededEvent {
    /// Attempt row id.
    pub attempt_id: Uuid,
    /// Event that was delivered.
    pub event_id: EventId,
    /// Endpoint that accepted it.
    pub endpoint_id: EndpointId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Attempt number for this pair.
    pub attempt_number: u32,
    /// What caused the attempt.
    pub trigger: AttemptTrigger,
    /// HTTP status returned.
    pub response_status: u16,
    /// Call duration in milliseconds.
    pub duration_ms: i64,
    /// When the response arrived.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted when an attempt fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFailedEvent {
    /// Attempt row id.
    pub attempt_id: Uuid,
    /// Event that failed to deliver.
    pub event_id: EventId,
    /// Endpoint that was attempted.
    pub endpoint_id: EndpointId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Attempt number for this pair.
    pub attempt_number: u32,
    /// What caused the attempt.
    pub trigger: AttemptTrigger,
    /// HTTP status, when the endpoint answered at all.
    pub response_status: Option<u16>,
    /// Failure description.
    pub error_message: String,
    /// When the follow-up attempt is due, if one was scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the failure was observed.
    pub failed_at: DateTime<Utc>,
}

/// Emitted when the dispatcher records an event's first-round status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventProcessedEvent {
    /// Event that was processed.
    pub event_id: EventId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Terminal status written.
    pub status: EventStatus,
    /// Number of endpoints that accepted the first attempt.
    pub succeeded: usize,
    /// Number of endpoints that rejected the first attempt.
    pub failed: usize,
}

/// Subscriber side of the notification stream.
///
/// Implementations must not block delivery; failures are logged by the
/// implementation and never returned to the pipeline.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one notification.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Discards every notification.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingHandler {
        seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: DeliveryEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn processed() -> DeliveryEvent {
        DeliveryEvent::EventProcessed(EventProcessedEvent {
            event_id: EventId::new(),
            tenant_id: TenantId::new(),
            status: EventStatus::Partial,
            succeeded: 1,
            failed: 1,
        })
    }

    #[tokio::test]
    async fn noop_accepts_every_notification() {
        let handler: Arc<dyn EventHandler> = Arc::new(NoOpEventHandler::new());
        handler.handle_event(processed()).await;
    }

    #[tokio::test]
    async fn handlers_observe_through_the_trait_object() {
        let counter = Arc::new(CountingHandler::default());
        let handler: Arc<dyn EventHandler> = counter.clone();

        handler.handle_event(processed()).await;
        handler.handle_event(processed()).await;

        assert_eq!(counter.seen.load(Ordering::SeqCst), 2);
    }
}
