//! WebSocket transport for live job status.
//!
//! After the upgrade the connection is registered with the status fanout
//! under the caller's identity and served by two halves:
//! 1. A sender task draining the fanout's outbound channel into the socket
//! 2. A receive loop feeding text frames to the fanout
//!
//! The sender task ends when the fanout drops the connection (overflow,
//! keep-alive reap, shutdown), which also ends the receive loop.

use std::sync::Arc;

use axum::{
    extract::{
        Extension,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use scribe_auth::Identity;
use scribe_infra::StatusFanout;
use scribe_infra::fanout::{PROTOCOL_VIOLATION, ServerMessage};

use crate::app::services::AppServices;
use crate::context::{PrincipalContext, TenantContext};

/// GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> impl IntoResponse {
    let identity = principal.identity(&tenant);
    let fanout = Arc::clone(&services.system.fanout);
    ws.on_upgrade(move |socket| handle_socket(socket, fanout, identity))
}

async fn handle_socket(socket: WebSocket, fanout: Arc<StatusFanout>, identity: Identity) {
    let connection = fanout.connect(identity);
    let conn_id = connection.id;
    let mut outbound = connection.outbound;
    info!(connection = %conn_id, tenant_id = %connection.identity.tenant_id, "websocket connected");

    let (mut sink, mut stream) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(t) => t,
                Err(e) => {
                    warn!(connection = %conn_id, error = %e, "failed to encode server message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                debug!(connection = %conn_id, "websocket sink closed");
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let mut sender_done = false;
    loop {
        tokio::select! {
            _ = &mut send_task => {
                sender_done = true;
                break;
            }
            frame = stream.next() => {
                let Some(frame) = frame else { break };
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Err(violation) = fanout.handle_frame(conn_id, &text).await {
                            debug!(connection = %conn_id, error = %violation, "closing on protocol violation");
                            break;
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        fanout.send_to(
                            conn_id,
                            ServerMessage::error(PROTOCOL_VIOLATION, "binary frames are not supported"),
                        );
                        break;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => fanout.touch(conn_id),
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        debug!(connection = %conn_id, error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    // Dropping the registration closes the outbound channel; the sender
    // flushes what is buffered (e.g. a final error frame) and closes.
    fanout.disconnect(conn_id);
    if !sender_done {
        let _ = send_task.await;
    }
    info!(connection = %conn_id, "websocket disconnected");
}
