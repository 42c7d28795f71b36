use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::dbcanvas::PersistJob;
use crate::models::messages::{DrawBroadcastMessage, DrawMessage, ServerMessage};
use crate::relay::RelayEvent;
use crate::store::{Applied, Operation, Stroke, StrokeId, UserId};
use crate::ws::session::SessionError;
use crate::ws::{ConnectionId, Hub};

/// Handle DrawMessage
///
/// Turns one client draw event into document operations:
/// * no `strokeId`: a standalone finished stroke with a server-minted id
/// * unknown `strokeId`: insert, finalized right away if `end` is set
/// * `strokeId` started by this connection: append, then finalize on `end`
pub fn handle_draw_message(hub: &mut Hub, connection_id: ConnectionId, draw_msg: DrawMessage) {
    let Some(user_id) = hub.require_user(connection_id) else {
        return;
    };

    match draw_msg.stroke_id.clone() {
        None => {
            if draw_msg.points.is_empty() {
                debug!("Ignoring empty standalone draw from {}", user_id);
                return;
            }
            let stroke = new_stroke(Uuid::new_v4().to_string(), user_id, draw_msg, true);
            apply_local(hub, connection_id, Operation::Insert { stroke });
        }
        Some(stroke_id) if hub.document.is_tombstoned(&stroke_id) => {
            warn!("Draw on deleted stroke {} from {}", stroke_id, user_id);
            hub.sessions.end_stroke(&connection_id, &stroke_id);
        }
        Some(stroke_id) if !hub.document.contains(&stroke_id) => {
            let end = draw_msg.end;
            if !end {
                if let Err(e) = hub.sessions.begin_stroke(&connection_id, &stroke_id) {
                    warn!("Cannot start stroke: {}", e);
                    return;
                }
            }
            let stroke = new_stroke(stroke_id, user_id, draw_msg, end);
            apply_local(hub, connection_id, Operation::Insert { stroke });
        }
        Some(stroke_id) if hub.sessions.owns_stroke(&connection_id, &stroke_id) => {
            if !draw_msg.points.is_empty() {
                let start = hub.document.next_index(&stroke_id);
                let append = Operation::Append {
                    stroke_id: stroke_id.clone(),
                    start,
                    points: draw_msg.points,
                };
                apply_local(hub, connection_id, append);
            }
            if draw_msg.end {
                hub.sessions.end_stroke(&connection_id, &stroke_id);
                finish_stroke(hub, connection_id, stroke_id);
            }
        }
        Some(stroke_id) => {
            warn!("Rejecting draw from {}: {}", user_id, SessionError::NotStrokeOwner(stroke_id));
        }
    }
}

/// Finalize a stroke at the points it has received so far.
///
/// Also used for strokes whose connection went away mid-gesture.
pub fn finish_stroke(hub: &mut Hub, origin: ConnectionId, stroke_id: StrokeId) {
    let len = hub.document.next_index(&stroke_id);
    apply_local(hub, origin, Operation::Finalize { stroke_id, len });
}

fn new_stroke(id: String, user_id: UserId, draw_msg: DrawMessage, finalized: bool) -> Stroke {
    Stroke {
        id,
        user_id,
        color: draw_msg.color,
        width: draw_msg.width,
        points: draw_msg.points,
        finalized,
        op_id: draw_msg.op_id.unwrap_or_else(Uuid::new_v4),
        created_at: Utc::now(),
    }
}

/// Apply an operation that originated on this node, then fan it out locally,
/// to sibling nodes and to the stroke store.
fn apply_local(hub: &mut Hub, origin: ConnectionId, op: Operation) {
    let fragment = match hub.document.apply(&op) {
        Ok(Applied::Inserted(fragment)) | Ok(Applied::Appended(fragment)) | Ok(Applied::Finalized(fragment)) => fragment,
        Ok(applied) => {
            debug!("Local draw left the document unchanged: {:?}", applied);
            return;
        }
        Err(e) => {
            warn!("Local draw rejected: {}", e);
            return;
        }
    };

    match ServerMessage::Draw(DrawBroadcastMessage { stroke: fragment }).to_frame() {
        Ok(frame) => hub.broadcast(frame, Some(origin)),
        Err(e) => error!("Failed to encode draw broadcast: {}", e),
    }

    let persisted = match &op {
        Operation::Insert { stroke } => Some(stroke.id.clone()),
        Operation::Finalize { stroke_id, .. } => Some(stroke_id.clone()),
        _ => None,
    };
    if let Some(stroke_id) = persisted {
        if let Some(stroke) = hub.document.stroke(&stroke_id) {
            if stroke.finalized {
                info!("Stroke {} finished with {} points", stroke.id, stroke.points.len());
            }
            hub.persist(PersistJob::SaveStroke(stroke));
        }
    }

    hub.relay.publish(RelayEvent::Draw(op));
}
