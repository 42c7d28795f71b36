use tracing::{debug, error, warn};

use crate::models::messages::{DrawBroadcastMessage, ServerMessage};
use crate::relay::{RelayEnvelope, RelayEvent};
use crate::store::Applied;
use crate::ws::bootstrap::BoardFrameKind;
use crate::ws::Hub;

/// Handle an envelope received from a sibling node.
///
/// The operation is merged into the local document and, if it changed
/// anything visible, forwarded to every registered connection. Nothing is
/// re-published.
pub fn handle_relayed_envelope(hub: &mut Hub, envelope: RelayEnvelope) {
    let op = envelope.event.operation();
    let applied = match hub.document.apply(&op) {
        Ok(applied) => applied,
        Err(e) => {
            warn!("Relayed operation {}#{} rejected: {}", envelope.origin, envelope.seq, e);
            return;
        }
    };

    let frame = match applied {
        Applied::Inserted(fragment) | Applied::Appended(fragment) | Applied::Finalized(fragment) => {
            ServerMessage::Draw(DrawBroadcastMessage { stroke: fragment }).to_frame()
        }
        Applied::Deleted(hidden) if !hidden.is_empty() => {
            let emptied = hub.document.stats().visible == 0;
            match envelope.event {
                RelayEvent::ClearAll(_) if emptied => ServerMessage::ClearAll.to_frame(),
                _ => hub.snapshots.board_frame(&hub.document, BoardFrameKind::ResetBoard),
            }
        }
        other => {
            debug!("Relayed operation {}#{} produced {:?}", envelope.origin, envelope.seq, other);
            return;
        }
    };

    match frame {
        Ok(frame) => hub.broadcast(frame, None),
        Err(e) => error!("Failed to encode relayed update: {}", e),
    }
}
