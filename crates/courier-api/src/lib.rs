//! Courier management HTTP API.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use courier_core::Clock;
use courier_delivery::DeliveryServices;

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use server::{create_router, start_server};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Registry, dispatcher and audit store.
    pub services: DeliveryServices,
    /// Clock used for health check timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates handler state.
    pub fn new(services: DeliveryServices, clock: Arc<dyn Clock>) -> Self {
        Self { services, clock }
    }
}
