use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use serde_json::json;

use crate::app::dto::QueueStatsResponse;
use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::{PrincipalContext, TenantContext};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> impl IntoResponse {
    Json(json!({
        "tenant_id": tenant.tenant_id().to_string(),
        "user_id": principal.user_id().to_string(),
        "roles": principal.roles().iter().map(|r| r.as_str()).collect::<Vec<_>>(),
    }))
}

/// GET /usage: current period usage and quota for the caller's tenant.
pub async fn usage(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    let identity = principal.identity(&tenant);
    match services.system.service.usage(&identity).await {
        Ok(summary) => Json(json!({
            "tenant_id": summary.tenant_id,
            "period_start": summary.period_start,
            "processing_minutes": summary.processing_minutes(),
            "storage_mb": summary.storage_mb,
            "quota": summary.quota,
        }))
        .into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

/// GET /queue: the caller's tenant queue depth and workers.
pub async fn queue_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> impl IntoResponse {
    let queues = &services.system.queues;
    let tenant_id = tenant.tenant_id();
    Json(QueueStatsResponse {
        tenant_id,
        queue_length: queues.queue_length(tenant_id),
        in_flight: queues.in_flight(tenant_id),
        workers: queues.worker_count(tenant_id),
        active_tenants: principal
            .identity(&tenant)
            .is_admin()
            .then(|| queues.active_tenants().len()),
    })
}
