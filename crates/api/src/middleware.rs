use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::debug;

use scribe_auth::JwtValidator;

use crate::app::errors::json_error;
use crate::context::{PrincipalContext, TenantContext};

#[derive(Clone)]
pub struct AuthState {
    pub jwt: Arc<dyn JwtValidator>,
}

/// Resolve the bearer credential into tenant and principal contexts.
///
/// The token comes from the `Authorization` header, or from a `token` query
/// parameter for clients that cannot set headers on a WebSocket upgrade.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let token = extract_bearer(req.headers())
        .or_else(|| extract_query_token(req.uri()))
        .ok_or_else(|| json_error(StatusCode::UNAUTHORIZED, "unauthenticated", "missing bearer token"))?;

    let claims = state.jwt.validate(&token, Utc::now()).map_err(|e| {
        debug!(error = %e, "rejected credential");
        json_error(StatusCode::UNAUTHORIZED, "unauthenticated", "invalid or expired token")
    })?;

    req.extensions_mut()
        .insert(TenantContext::new(claims.tenant_id));
    req.extensions_mut()
        .insert(PrincipalContext::new(claims.sub, claims.roles));

    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn extract_query_token(uri: &Uri) -> Option<String> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}
