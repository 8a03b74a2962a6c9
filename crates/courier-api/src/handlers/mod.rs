//! HTTP request handlers.

pub mod deliveries;
pub mod endpoints;
pub mod event_types;
pub mod events;
pub mod health;
pub mod stats;

pub use deliveries::replay_delivery;
pub use endpoints::{
    create_endpoint, delete_endpoint, get_endpoint, list_endpoint_deliveries, list_endpoints,
    rotate_secret, send_test_event, update_endpoint,
};
pub use event_types::list_event_types;
pub use events::{create_event, get_event, list_event_deliveries};
pub use health::{health_check, liveness_check, readiness_check};
pub use stats::tenant_stats;
