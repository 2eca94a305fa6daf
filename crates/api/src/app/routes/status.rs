//! Conditional status polling.
//!
//! The fingerprint goes out as a strong `ETag`; clients send it back in
//! `If-None-Match` (or `?etag=` when they cannot set headers) and get `304`
//! until the job transitions.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::IntoResponse,
};

use scribe_core::JobId;
use scribe_infra::StatusSnapshot;

use crate::app::dto::{self, StatusQuery};
use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::{PrincipalContext, TenantContext};

/// GET /jobs/:id/status
pub async fn get_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> axum::response::Response {
    let job_id: JobId = match dto::parse_id(&id, "job id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let prior = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.etag);

    let snapshot = match services
        .system
        .snapshots
        .get_status(&principal.identity(&tenant), job_id, prior.as_deref())
        .await
    {
        Ok(s) => s,
        Err(e) => return errors::job_error_to_response(e),
    };

    let etag = HeaderValue::from_str(&snapshot.fingerprint().to_etag()).ok();
    let mut response = match snapshot {
        StatusSnapshot::NotModified { .. } => StatusCode::NOT_MODIFIED.into_response(),
        StatusSnapshot::Modified { view, .. } => Json(view).into_response(),
    };
    let response_headers = response.headers_mut();
    if let Some(etag) = etag {
        response_headers.insert(header::ETAG, etag);
    }
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}
