//! Core domain models, persistence and signing for the courier delivery
//! engine.
//!
//! Everything the delivery crate and the management API share lives here:
//! strongly-typed ids, the event type catalog, the event status state machine,
//! canonical payload signing and the PostgreSQL repositories.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod signing;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    AttemptFailedEvent, AttemptSucceededEvent, DeliveryEvent, EventHandler, EventProcessedEvent,
    NoOpEventHandler,
};
pub use models::{
    AttemptCompletion, AttemptTrigger, DeliveryAttempt, DeliveryStats, Endpoint, EndpointId,
    EndpointUpdate, Event, EventId, EventStatus, EventType, TenantId, WILDCARD_SUBSCRIPTION,
};
pub use time::{Clock, RealClock, TestClock};
