//! Event type catalog.

use axum::Json;
use courier_core::EventType;
use serde::Serialize;

/// One catalog entry.
#[derive(Debug, Serialize)]
pub struct EventTypeInfo {
    /// Wire tag, e.g. `feedback.created`.
    #[serde(rename = "type")]
    pub event_type: &'static str,
    /// What the event means.
    pub description: &'static str,
}

/// `GET /v1/event-types`
pub async fn list_event_types() -> Json<Vec<EventTypeInfo>> {
    Json(
        EventType::ALL
            .iter()
            .map(|t| EventTypeInfo { event_type: t.as_str(), description: t.description() })
            .collect(),
    )
}
