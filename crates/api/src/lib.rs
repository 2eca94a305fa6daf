//! HTTP API: configuration, routing, authentication and the WebSocket
//! status channel in front of the job core.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;
