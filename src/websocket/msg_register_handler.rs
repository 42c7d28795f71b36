use tracing::{debug, error, warn};

use crate::models::messages::RegisterMessage;
use crate::ws::bootstrap::{bootstrap_connection, BootstrapError};
use crate::ws::{ConnectionId, Hub};

/// Handle RegisterMessage
pub fn handle_register_message(hub: &mut Hub, connection_id: ConnectionId, register_msg: &RegisterMessage) {
    let result = bootstrap_connection(
        &mut hub.sessions,
        &hub.document,
        &hub.snapshots,
        connection_id,
        register_msg.user_id.as_deref(),
        hub.allow_declared_user_id,
    );

    match result {
        Ok(boot) => {
            let [user_info, board] = boot.frames;
            hub.send_to(connection_id, user_info);
            hub.send_to(connection_id, board);
            debug!("Bootstrap frames queued for {} on {}", boot.user_id, connection_id);
        }
        Err(BootstrapError::Session(e)) => warn!("Register rejected: {}", e),
        Err(e) => error!("Failed to bootstrap connection {}: {}", connection_id, e),
    }
}
