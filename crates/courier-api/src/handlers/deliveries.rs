//! Delivery replay.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use courier_core::TenantId;
use courier_delivery::AttemptOutcome;
use tracing::instrument;
use uuid::Uuid;

use crate::{ApiResult, AppState};

/// `POST /v1/tenants/{tenant_id}/deliveries/{attempt_id}/replay`
///
/// Sends the attempt's event again as a new attempt, signed with the
/// endpoint's current secret.
#[instrument(name = "replay_delivery", skip(state))]
pub async fn replay_delivery(
    State(state): State<AppState>,
    Path((tenant_id, attempt_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<(StatusCode, Json<AttemptOutcome>)> {
    let outcome = state.services.audit().replay(TenantId(tenant_id), attempt_id).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}
