//! Event intake and inspection.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use courier_core::{EventId, EventType, TenantId};
use courier_delivery::EventDeliverySummary;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use super::endpoints::AttemptView;
use crate::{ApiError, ApiResult, AppState};

/// Body of an event creation request.
#[derive(Debug, Deserialize)]
pub struct CreateEventRequest {
    /// Wire tag, e.g. `feedback.created`.
    pub event_type: String,
    /// Opaque payload delivered as `data`.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Originating entity type.
    pub origin_model: Option<String>,
    /// Originating entity id.
    pub origin_id: Option<String>,
}

/// Acknowledgement of an accepted event.
#[derive(Debug, Serialize)]
pub struct CreateEventResponse {
    /// Identifier to look the event up by.
    pub event_id: Uuid,
    /// Always `pending` on acceptance.
    pub status: courier_core::EventStatus,
}

/// `POST /v1/tenants/{tenant_id}/events`
///
/// Persists the event and returns before any delivery is made.
#[instrument(name = "create_event", skip(state, body))]
pub async fn create_event(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    body: Result<Json<CreateEventRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreateEventResponse>)> {
    let Json(request) = body?;
    let event_type: EventType =
        request.event_type.parse().map_err(|e: courier_core::CoreError| {
            ApiError::bad_request(e.to_string())
        })?;

    let event = state
        .services
        .dispatcher()
        .create_event(
            TenantId(tenant_id),
            event_type,
            request.payload,
            request.origin_model,
            request.origin_id,
        )
        .await?;

    info!(event_id = %event.id, %event_type, "event accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateEventResponse { event_id: event.id.0, status: event.status }),
    ))
}

/// `GET /v1/tenants/{tenant_id}/events/{event_id}`
#[instrument(name = "get_event", skip(state))]
pub async fn get_event(
    State(state): State<AppState>,
    Path((tenant_id, event_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<EventDeliverySummary>> {
    let summary =
        state.services.audit().event_summary(TenantId(tenant_id), EventId(event_id)).await?;
    Ok(Json(summary))
}

/// `GET /v1/tenants/{tenant_id}/events/{event_id}/deliveries`
#[instrument(name = "list_event_deliveries", skip(state))]
pub async fn list_event_deliveries(
    State(state): State<AppState>,
    Path((tenant_id, event_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Vec<AttemptView>>> {
    let attempts =
        state.services.audit().list_for_event(TenantId(tenant_id), EventId(event_id)).await?;
    Ok(Json(attempts.into_iter().map(AttemptView::from).collect()))
}
