//! Tenant delivery statistics.

use axum::{
    extract::{Path, State},
    Json,
};
use courier_core::{DeliveryStats, TenantId};
use tracing::instrument;
use uuid::Uuid;

use crate::{ApiResult, AppState};

/// `GET /v1/tenants/{tenant_id}/stats`
#[instrument(name = "tenant_stats", skip(state))]
pub async fn tenant_stats(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<DeliveryStats>> {
    Ok(Json(state.services.audit().stats(TenantId(tenant_id)).await?))
}
