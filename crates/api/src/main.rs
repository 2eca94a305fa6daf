use std::sync::Arc;

use anyhow::Context;

use scribe_api::app::{build_app, build_services, default_handlers};
use scribe_api::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scribe_observability::init();

    let config = ServerConfig::from_env()?;
    let services = Arc::new(build_services(&config, default_handlers(&config)).await?);
    let app = build_app(&config.jwt_secret, Arc::clone(&services));

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let fanout = Arc::clone(&services.system.fanout);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open sockets would otherwise hold the server open.
            let closed = fanout.close_all();
            tracing::info!(closed, "closing websocket connections");
        })
        .await
        .context("server error")?;

    services.system.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
