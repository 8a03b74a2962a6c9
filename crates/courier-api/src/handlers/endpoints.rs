//! Endpoint management handlers.

use std::collections::BTreeMap;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::{AttemptTrigger, DeliveryAttempt, Endpoint, EndpointId, EndpointUpdate, TenantId};
use courier_delivery::{NewEndpoint, TestDelivery};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{ApiResult, AppState};

/// Endpoint returned once at creation, secret included.
#[derive(Debug, Serialize)]
pub struct CreatedEndpoint {
    /// The stored endpoint.
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// Signing secret. Not retrievable later except by rotation.
    pub secret: String,
}

/// Body of a secret rotation response.
#[derive(Debug, Serialize)]
pub struct RotatedSecret {
    /// The new signing secret.
    pub secret: String,
}

/// Query parameters for attempt listings.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Page size, capped server side.
    pub limit: Option<usize>,
}

/// One attempt as shown in the delivery log, body decoded as text.
#[allow(missing_docs)]
#[derive(Debug, Serialize)]
pub struct AttemptView {
    pub id: Uuid,
    pub event_id: Uuid,
    pub endpoint_id: Uuid,
    pub attempt_number: u32,
    pub trigger: AttemptTrigger,
    pub request_url: String,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: String,
    pub response_status: Option<i32>,
    pub response_headers: Option<BTreeMap<String, String>>,
    pub response_body: Option<String>,
    pub duration_ms: Option<i64>,
    pub succeeded: bool,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<DeliveryAttempt> for AttemptView {
    fn from(attempt: DeliveryAttempt) -> Self {
        Self {
            id: attempt.id,
            event_id: attempt.event_id.0,
            endpoint_id: attempt.endpoint_id.0,
            attempt_number: attempt.attempt_number,
            trigger: attempt.trigger,
            request_url: attempt.request_url,
            request_headers: attempt.request_headers,
            request_body: String::from_utf8_lossy(&attempt.request_body).into_owned(),
            response_status: attempt.response_status,
            response_headers: attempt.response_headers,
            response_body: attempt.response_body,
            duration_ms: attempt.duration_ms,
            succeeded: attempt.succeeded,
            error_message: attempt.error_message,
            next_retry_at: attempt.next_retry_at,
            created_at: attempt.created_at,
            completed_at: attempt.completed_at,
        }
    }
}

/// `GET /v1/tenants/{tenant_id}/endpoints`
#[instrument(name = "list_endpoints", skip(state))]
pub async fn list_endpoints(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Endpoint>>> {
    let endpoints = state.services.registry().list(TenantId(tenant_id)).await?;
    Ok(Json(endpoints))
}

/// `POST /v1/tenants/{tenant_id}/endpoints`
#[instrument(name = "create_endpoint", skip(state, body))]
pub async fn create_endpoint(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    body: Result<Json<NewEndpoint>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreatedEndpoint>)> {
    let Json(input) = body?;
    let endpoint = state.services.registry().create(TenantId(tenant_id), input).await?;
    info!(endpoint_id = %endpoint.id, "endpoint created");

    let secret = endpoint.secret.clone();
    Ok((StatusCode::CREATED, Json(CreatedEndpoint { endpoint, secret })))
}

/// `GET /v1/tenants/{tenant_id}/endpoints/{endpoint_id}`
#[instrument(name = "get_endpoint", skip(state))]
pub async fn get_endpoint(
    State(state): State<AppState>,
    Path((tenant_id, endpoint_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Endpoint>> {
    let endpoint =
        state.services.registry().get(TenantId(tenant_id), EndpointId(endpoint_id)).await?;
    Ok(Json(endpoint))
}

/// `PATCH /v1/tenants/{tenant_id}/endpoints/{endpoint_id}`
#[instrument(name = "update_endpoint", skip(state, body))]
pub async fn update_endpoint(
    State(state): State<AppState>,
    Path((tenant_id, endpoint_id)): Path<(Uuid, Uuid)>,
    body: Result<Json<EndpointUpdate>, JsonRejection>,
) -> ApiResult<Json<Endpoint>> {
    let Json(update) = body?;
    let endpoint = state
        .services
        .registry()
        .update(TenantId(tenant_id), EndpointId(endpoint_id), update)
        .await?;
    Ok(Json(endpoint))
}

/// `DELETE /v1/tenants/{tenant_id}/endpoints/{endpoint_id}`
#[instrument(name = "delete_endpoint", skip(state))]
pub async fn delete_endpoint(
    State(state): State<AppState>,
    Path((tenant_id, endpoint_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.services.registry().delete(TenantId(tenant_id), EndpointId(endpoint_id)).await?;
    info!("endpoint deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/tenants/{tenant_id}/endpoints/{endpoint_id}/rotate-secret`
#[instrument(name = "rotate_secret", skip(state))]
pub async fn rotate_secret(
    State(state): State<AppState>,
    Path((tenant_id, endpoint_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<RotatedSecret>> {
    let secret = state
        .services
        .registry()
        .rotate_secret(TenantId(tenant_id), EndpointId(endpoint_id))
        .await?;
    Ok(Json(RotatedSecret { secret }))
}

/// `POST /v1/tenants/{tenant_id}/endpoints/{endpoint_id}/test`
#[instrument(name = "send_test_event", skip(state))]
pub async fn send_test_event(
    State(state): State<AppState>,
    Path((tenant_id, endpoint_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<TestDelivery>> {
    let delivery =
        state.services.send_test_event(TenantId(tenant_id), EndpointId(endpoint_id)).await?;
    Ok(Json(delivery))
}

/// `GET /v1/tenants/{tenant_id}/endpoints/{endpoint_id}/deliveries`
#[instrument(name = "list_endpoint_deliveries", skip(state, query))]
pub async fn list_endpoint_deliveries(
    State(state): State<AppState>,
    Path((tenant_id, endpoint_id)): Path<(Uuid, Uuid)>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<AttemptView>>> {
    let Query(query) = query?;
    let attempts = state
        .services
        .audit()
        .list_for_endpoint(TenantId(tenant_id), EndpointId(endpoint_id), query.limit)
        .await?;
    Ok(Json(attempts.into_iter().map(AttemptView::from).collect()))
}
