use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::state::DashboardState;
use crate::messages::Message;
use crate::relay;

/// Axum handler that upgrades `/ws/:client_id/:session_id` to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((client_id, session_id)): Path<(String, String)>,
    State(state): State<Arc<DashboardState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id, session_id))
}

/// Relays one browser connection: frames from the session's outbox go out,
/// inbound frames go to the session's execution context.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<DashboardState>,
    client_id: String,
    session_id: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let (outbox, mut inbox) = mpsc::channel::<String>(state.registry.outbox_capacity());

    let Some((session, token)) = state.registry.attach(&session_id, &client_id, outbox).await else {
        warn!(%session_id, %client_id, "websocket for unknown session");
        if let Ok(text) = Message::SessionError.encode() {
            let _ = sender.send(WsMessage::Text(text)).await;
        }
        let _ = sender.close().await;
        return;
    };

    // The app answers with a config addressed to this connection only.
    session.comm().to_execution.send(Message::GetWidgetStates {
        client_id: client_id.clone(),
    });

    // Task: forward outbox frames → WebSocket client
    let poll = state.registry.poll_interval();
    let comm = Arc::clone(session.comm());
    let mut send_task = tokio::spawn(async move {
        loop {
            match timeout(poll, inbox.recv()).await {
                Ok(Some(text)) => {
                    if sender.send(WsMessage::Text(text)).await.is_err() {
                        break; // client disconnected
                    }
                }
                Ok(None) => break,
                Err(_) if comm.stop_requested() => {
                    let _ = sender.send(WsMessage::Close(None)).await;
                    break;
                }
                Err(_) => {}
            }
        }
    });

    // Task: read from WebSocket → execution context
    let inbound = Arc::clone(&session);
    let origin = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                WsMessage::Text(text) => {
                    relay::forward_inbound(&inbound, &origin, &text);
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish, then abort the other to prevent leaks
    tokio::select! {
        _ = &mut send_task => { recv_task.abort(); },
        _ = &mut recv_task => { send_task.abort(); },
    }

    debug!(%session_id, %client_id, "websocket closed");
    state.registry.detach(&session, &client_id, token).await;
}
