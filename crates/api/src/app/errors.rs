use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use scribe_infra::JobError;

pub fn job_error_to_response(err: JobError) -> axum::response::Response {
    let status = match &err {
        JobError::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        JobError::NotFound(_) => StatusCode::NOT_FOUND,
        JobError::Unauthorized(_) => StatusCode::FORBIDDEN,
        JobError::Validation(_) => StatusCode::BAD_REQUEST,
        JobError::InvalidTransition { .. } => StatusCode::CONFLICT,
        JobError::HandlerFailure(_) | JobError::InternalFault(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    json_error(status, err.kind(), err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
