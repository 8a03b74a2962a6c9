//! Outbound event delivery with durable retries and a full audit trail.
//!
//! Application events are fanned out to every active endpoint of the owning
//! tenant that subscribes to the event type. Each HTTP call is recorded as a
//! delivery attempt before it is issued and completed with its outcome
//! afterwards, so the attempt table is both the audit log and the retry
//! queue.
//!
//! # Architecture
//!
//! 1. **Registry** - tenant endpoints, subscriptions and secrets
//! 2. **Dispatcher** - claims pending events and fans out the first round
//! 3. **Executor** - signs, sends and records one attempt
//! 4. **Retry scheduler** - re-arms failed attempts from the attempt table
//! 5. **Audit store** - attempt listings, replay and statistics
//!
//! Workers claim events and due retries with `FOR UPDATE SKIP LOCKED`, so any
//! number of engine instances can share one database.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::RealClock;
//! use courier_delivery::{storage::mock::MockDeliveryStorage, DeliveryConfig, DeliveryEngine};
//!
//! # async fn example() -> courier_delivery::Result<()> {
//! let storage = Arc::new(MockDeliveryStorage::new());
//! let mut engine = DeliveryEngine::new(storage, DeliveryConfig::default(), Arc::new(RealClock::new()))?;
//!
//! engine.start().await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod storage;
mod worker_pool;

pub use audit::{AuditStore, EventDeliverySummary, PairSummary};
pub use dispatcher::Dispatcher;
pub use engine::{DeliveryConfig, DeliveryEngine, DeliveryServices, TestDelivery};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use executor::{AttemptOutcome, DeliveryExecutor};
pub use registry::{EndpointRegistry, NewEndpoint, RegistryDefaults};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::RetryScheduler;

/// Default number of concurrent dispatcher workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default number of events claimed per dispatcher batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Response bodies are truncated to this many bytes before being stored.
pub const DEFAULT_RESPONSE_BODY_LIMIT: usize = 10 * 1024;

/// Default attempt budget for new endpoints.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Default base retry delay for new endpoints, in seconds.
pub const DEFAULT_RETRY_DELAY_SECONDS: i32 = 60;

/// User agent sent with every delivery.
pub const USER_AGENT: &str = "Courier-Webhook/1.0";

/// Header carrying the event type tag.
pub const EVENT_HEADER: &str = "X-Courier-Event";

/// Header carrying the `sha256=<hex>` body signature.
pub const SIGNATURE_HEADER: &str = "X-Courier-Signature";

/// Header carrying the event id.
pub const DELIVERY_HEADER: &str = "X-Courier-Delivery";

/// Header carrying the Unix timestamp of the attempt.
pub const TIMESTAMP_HEADER: &str = "X-Courier-Timestamp";
