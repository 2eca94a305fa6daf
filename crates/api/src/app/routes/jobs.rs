use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
};

use scribe_core::JobId;

use crate::app::dto::{self, CreateJobRequest, JobListResponse, JobResponse, ListJobsQuery};
use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::{PrincipalContext, TenantContext};

/// POST /jobs
pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<CreateJobRequest>,
) -> axum::response::Response {
    let request = match body.into_submit() {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match services.system.service.submit(&principal.identity(&tenant), request).await {
        Ok(job) => (StatusCode::CREATED, Json(JobResponse::from(job))).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

/// GET /jobs?status=&limit=&offset=
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<ListJobsQuery>,
) -> axum::response::Response {
    let filter = match query.into_filter() {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let (limit, offset) = (filter.limit, filter.offset);

    match services.system.service.list(&principal.identity(&tenant), filter).await {
        Ok(jobs) => Json(JobListResponse {
            jobs: jobs.into_iter().map(JobResponse::from).collect(),
            limit,
            offset,
        })
        .into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

/// GET /jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match dto::parse_id(&id, "job id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.system.service.get(&principal.identity(&tenant), job_id).await {
        Ok(job) => Json(JobResponse::from(job)).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

/// PUT /jobs/:id/cancel
///
/// Returns the job as currently stored; a running job may still be
/// finishing its cancellation.
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match dto::parse_id(&id, "job id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.system.service.cancel(&principal.identity(&tenant), job_id).await {
        Ok(job) => Json(JobResponse::from(job)).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

/// PUT /jobs/:id/retry
pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match dto::parse_id(&id, "job id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.system.service.retry(&principal.identity(&tenant), job_id).await {
        Ok(job) => (StatusCode::CREATED, Json(JobResponse::from(job))).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}
