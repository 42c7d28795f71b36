use std::time::Duration;

use moka::sync::Cache;
use thiserror::Error;
use tracing::{debug, info};

use super::session::{ConnectionId, Frame, SessionError, SessionManager};
use crate::models::messages::{BoardMessage, ServerMessage, UserInfoMessage};
use crate::store::{Document, UserId};

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to encode board: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardFrameKind {
    InitBoard,
    ResetBoard,
}

/// Encoded board frames keyed by document version.
///
/// A version identifies one exact visible state on this node, so a cached
/// frame can be reused until the document changes.
#[derive(Clone)]
pub struct SnapshotCache {
    cache: Cache<(u64, BoardFrameKind), Frame>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        let cache = Cache::builder()
            .max_capacity(16)
            .time_to_idle(Duration::from_secs(60))
            .build();
        info!("Snapshot cache initialized");
        Self { cache }
    }

    pub fn board_frame(&self, document: &Document, kind: BoardFrameKind) -> Result<Frame, serde_json::Error> {
        let key = (document.version(), kind);
        if let Some(frame) = self.cache.get(&key) {
            debug!("Snapshot cache hit for version {}", key.0);
            return Ok(frame);
        }

        let board = BoardMessage { strokes: document.snapshot() };
        let message = match kind {
            BoardFrameKind::InitBoard => ServerMessage::InitBoard(board),
            BoardFrameKind::ResetBoard => ServerMessage::ResetBoard(board),
        };
        let frame = message.to_frame()?;
        self.cache.insert(key, frame.clone());
        Ok(frame)
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The frames a newly registered connection must receive, in order.
#[derive(Debug)]
pub struct Bootstrap {
    pub user_id: UserId,
    pub frames: [Frame; 2],
}

/// Register a connection and build its `user-info` + `init-board` frames.
///
/// Must run in the same hub step that makes the connection part of the
/// fan-out set: registration flips the session into `registered()`, and the
/// snapshot is taken from the same document state, so no operation can land
/// between the two.
pub fn bootstrap_connection(
    sessions: &mut SessionManager,
    document: &Document,
    snapshots: &SnapshotCache,
    connection_id: ConnectionId,
    declared_user_id: Option<&str>,
    allow_declared: bool,
) -> Result<Bootstrap, BootstrapError> {
    let board = snapshots.board_frame(document, BoardFrameKind::InitBoard)?;
    let user_id = sessions.register(connection_id, declared_user_id, allow_declared)?;
    let user_info = ServerMessage::UserInfo(UserInfoMessage { user_id: user_id.clone() }).to_frame()?;

    info!(
        "Connection {} registered as {} ({} strokes on board)",
        connection_id,
        user_id,
        document.stats().visible
    );
    Ok(Bootstrap {
        user_id,
        frames: [user_info, board],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Operation, Point, Stroke};
    use chrono::Utc;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn document_with(ids: &[&str]) -> Document {
        let mut doc = Document::new();
        for id in ids {
            let stroke = Stroke {
                id: id.to_string(),
                user_id: "u1".into(),
                color: "#000".into(),
                width: 1.0,
                points: vec![Point { x: 0.0, y: 0.0 }],
                finalized: true,
                op_id: Uuid::new_v4(),
                created_at: Utc::now(),
            };
            doc.apply(&Operation::Insert { stroke }).unwrap();
        }
        doc
    }

    #[test]
    fn frames_are_user_info_then_init_board() {
        let doc = document_with(&["a", "b"]);
        let cid = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(4);
        let mut sessions = SessionManager::new();
        sessions.connect(cid, tx);

        let boot = bootstrap_connection(&mut sessions, &doc, &SnapshotCache::new(), cid, Some("alice"), true).unwrap();
        assert_eq!(boot.user_id, "alice");
        assert!(boot.frames[0].starts_with(r#"{"type":"user-info""#));

        let board: serde_json::Value = serde_json::from_str(&boot.frames[1]).unwrap();
        assert_eq!(board["type"], "init-board");
        assert_eq!(board["strokes"].as_array().unwrap().len(), 2);
        assert_eq!(sessions.registered_count(), 1);
    }

    #[test]
    fn second_bootstrap_fails_on_reregistration() {
        let doc = Document::new();
        let cid = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(4);
        let mut sessions = SessionManager::new();
        sessions.connect(cid, tx);
        let cache = SnapshotCache::new();

        bootstrap_connection(&mut sessions, &doc, &cache, cid, None, true).unwrap();
        let err = bootstrap_connection(&mut sessions, &doc, &cache, cid, None, true).unwrap_err();
        assert!(matches!(err, BootstrapError::Session(SessionError::AlreadyRegistered(_))));
    }

    #[test]
    fn cached_frame_is_reused_until_the_version_changes() {
        let mut doc = document_with(&["a"]);
        let cache = SnapshotCache::new();

        let first = cache.board_frame(&doc, BoardFrameKind::InitBoard).unwrap();
        let again = cache.board_frame(&doc, BoardFrameKind::InitBoard).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        doc.clear_all();
        let after = cache.board_frame(&doc, BoardFrameKind::InitBoard).unwrap();
        assert!(!Arc::ptr_eq(&first, &after));
        assert_eq!(&*after, r#"{"type":"init-board","strokes":[]}"#);
    }
}
