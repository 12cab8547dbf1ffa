//! WebSocket connection lifecycle: one session per client socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::session::Outbound;
use crate::state::GatewayState;

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    let session = state.registry.on_client_connected(out_tx);
    let session_id = session.id().to_string();
    info!(session_id = %session_id, "New WebSocket connection");

    // writer: ends when the session drops its sender or the socket fails
    let writer_id = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let msg = match frame {
                Outbound::Text(text) => Message::Text(text.into()),
                Outbound::Binary(data) => Message::Binary(data),
            };
            if let Err(e) = ws_tx.send(msg).await {
                debug!(session_id = %writer_id, error = %e, "Client writer closed");
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    while let Some(msg_result) = ws_rx.next().await {
        let delivered = match msg_result {
            Ok(Message::Binary(data)) => session.send_binary(data),
            Ok(Message::Text(text)) => session.send_text(text.to_string()),
            Ok(Message::Close(_)) => {
                debug!(session_id = %session_id, "Client requested close");
                break;
            }
            // axum answers pings itself
            Ok(_) => true,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "WebSocket error");
                session.transport_error(e.to_string());
                break;
            }
        };
        if !delivered {
            debug!(session_id = %session_id, "Session closed, dropping client");
            break;
        }
    }

    state.registry.on_client_disconnected(&session_id);
    // let the writer flush the session's last events before the socket goes
    let abort = send_task.abort_handle();
    if tokio::time::timeout(std::time::Duration::from_secs(2), send_task)
        .await
        .is_err()
    {
        debug!(session_id = %session_id, "Client writer did not finish in time");
        abort.abort();
    }
    info!(session_id = %session_id, "WebSocket connection closed");
}
