use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::messages::ClientMessage;
use crate::server::AppState;
use crate::ws::{Frame, HubHandle};

/// Detaches a connection from the hub when dropped.
struct ConnectionGuard {
    hub: HubHandle,
    connection_id: Uuid,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.disconnect_detached(self.connection_id);
    }
}

/// WebSocket handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(app_state): State<AppState>) -> Response {
    debug!("New WebSocket connection attempt");
    let hub = app_state.hub.clone();
    let outbox_capacity = app_state.config.outbox_capacity;
    ws.on_upgrade(move |socket| handle_socket(socket, hub, outbox_capacity))
}

/// Handle WebSocket connection
///
/// The reader task forwards parsed client messages to the hub in receipt
/// order. The writer task drains this connection's outbox. When the hub drops
/// the outbox sender the writer ends and the socket closes.
pub async fn handle_socket(socket: WebSocket, hub: HubHandle, outbox_capacity: usize) {
    let connection_id = Uuid::new_v4();
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Frame>(outbox_capacity);

    if hub.connect(connection_id, outbox_tx).await.is_err() {
        warn!("Hub unavailable, refusing connection {}", connection_id);
        return;
    }
    info!("WebSocket connection established: {}", connection_id);

    // Whatever way this function exits, the hub forgets the connection
    let _guard = ConnectionGuard {
        hub: hub.clone(),
        connection_id,
    };

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            if sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                // Pings are answered by axum; binary frames are not part of the protocol
                _ => continue,
            };

            let client_msg = match ClientMessage::parse(&text) {
                Ok(client_msg) => client_msg,
                Err(e) => {
                    warn!("Rejected message on connection {}: {}", connection_id, e);
                    continue;
                }
            };

            if hub.client_message(connection_id, client_msg).await.is_err() {
                break;
            }
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };
    info!("WebSocket connection terminated: {}", connection_id);
}
