//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: job core wiring (stores, ledger, policy, handlers)
//! - `routes/`: HTTP and WebSocket handlers (one file per area)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, build_services, default_handlers};

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(jwt_secret: &str, services: Arc<AppServices>) -> Router {
    let jwt = Arc::new(scribe_auth::Hs256JwtValidator::new(jwt_secret.as_bytes()));
    let auth_state = middleware::AuthState { jwt };

    // Protected routes: require auth + tenant context.
    let protected = routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new())
}
