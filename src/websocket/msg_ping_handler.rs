use chrono::Utc;
use tracing::{debug, error};

use crate::models::messages::{PongMessage, ServerMessage};
use crate::ws::{ConnectionId, Hub};

/// Handle PingMessage
pub fn handle_ping_message(hub: &mut Hub, connection_id: ConnectionId) {
    // Reply with pong; registration is not required
    debug!("Ping received on connection {}", connection_id);

    let pong = ServerMessage::Pong(PongMessage { date: Utc::now().to_rfc3339() });
    match pong.to_frame() {
        Ok(frame) => hub.send_to(connection_id, frame),
        Err(e) => error!("Failed to encode pong for {}: {}", connection_id, e),
    }
}
