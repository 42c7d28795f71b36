//! The per-node hub.
//!
//! One task owns the document and the session map. Connection events and
//! relayed envelopes are queued to it and handled one at a time, so each
//! handler sees and mutates a consistent state without locks.

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bootstrap::SnapshotCache;
use super::session::{ConnectionId, Frame, Session, SessionManager};
use crate::db::dbcanvas::{PersistHandle, PersistJob};
use crate::models::messages::ClientMessage;
use crate::relay::{Relay, RelayEnvelope};
use crate::store::{Document, DocumentStats, Stroke, UserId};
use crate::websocket::msg_clear_handler::{handle_clear_all_message, handle_clear_mine_message};
use crate::websocket::msg_draw_handler::{finish_stroke, handle_draw_message};
use crate::websocket::msg_ping_handler::handle_ping_message;
use crate::websocket::msg_register_handler::handle_register_message;
use crate::websocket::relay_handler::handle_relayed_envelope;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HubError {
    #[error("hub is not running")]
    Closed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BoardSnapshot {
    pub board: String,
    pub version: u64,
    pub strokes: Vec<Stroke>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub registered: usize,
    pub version: u64,
    pub document: DocumentStats,
}

#[derive(Debug)]
pub enum HubCommand {
    Connect {
        connection_id: ConnectionId,
        outbox: mpsc::Sender<Frame>,
    },
    Disconnect {
        connection_id: ConnectionId,
    },
    Client {
        connection_id: ConnectionId,
        message: ClientMessage,
    },
    Snapshot {
        reply: oneshot::Sender<BoardSnapshot>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Cloneable sender side of a running hub.
#[derive(Clone, Debug)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub async fn connect(&self, connection_id: ConnectionId, outbox: mpsc::Sender<Frame>) -> Result<(), HubError> {
        self.send(HubCommand::Connect { connection_id, outbox }).await
    }

    pub async fn client_message(&self, connection_id: ConnectionId, message: ClientMessage) -> Result<(), HubError> {
        self.send(HubCommand::Client { connection_id, message }).await
    }

    /// Queue a disconnect from a synchronous context such as a drop guard.
    pub fn disconnect_detached(&self, connection_id: ConnectionId) {
        match self.tx.try_send(HubCommand::Disconnect { connection_id }) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(command).await;
                });
            }
            Err(TrySendError::Closed(_)) => debug!("Hub closed before disconnect of {}", connection_id),
        }
    }

    pub async fn snapshot(&self) -> Result<BoardSnapshot, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.tx.send(command).await.map_err(|_| HubError::Closed)
    }
}

/// State owned by the hub task. Handlers get `&mut Hub`.
pub struct Hub {
    pub(crate) board: String,
    pub(crate) document: Document,
    pub(crate) sessions: SessionManager,
    pub(crate) relay: Relay,
    pub(crate) persistence: Option<PersistHandle>,
    pub(crate) snapshots: SnapshotCache,
    pub(crate) allow_declared_user_id: bool,
}

impl Hub {
    pub fn new(board: &str, document: Document, relay: Relay, persistence: Option<PersistHandle>) -> Self {
        Self {
            board: board.to_string(),
            document,
            sessions: SessionManager::new(),
            relay,
            persistence,
            snapshots: SnapshotCache::new(),
            allow_declared_user_id: true,
        }
    }

    pub fn allow_declared_user_id(mut self, allow: bool) -> Self {
        self.allow_declared_user_id = allow;
        self
    }

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect { connection_id, outbox } => {
                self.sessions.connect(connection_id, outbox);
                debug!("Connection {} attached ({} open)", connection_id, self.sessions.connection_count());
            }
            HubCommand::Disconnect { connection_id } => {
                if let Some(session) = self.close_session(connection_id) {
                    info!(
                        "Connection {} closed after {}s",
                        connection_id,
                        (chrono::Utc::now() - session.connected_at).num_seconds()
                    );
                }
            }
            HubCommand::Client { connection_id, message } => self.handle_client_message(connection_id, message),
            HubCommand::Snapshot { reply } => {
                let _ = reply.send(BoardSnapshot {
                    board: self.board.clone(),
                    version: self.document.version(),
                    strokes: self.document.snapshot(),
                });
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(HubStats {
                    connections: self.sessions.connection_count(),
                    registered: self.sessions.registered_count(),
                    version: self.document.version(),
                    document: self.document.stats(),
                });
            }
        }
    }

    fn handle_client_message(&mut self, connection_id: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Register(register) => handle_register_message(self, connection_id, &register),
            ClientMessage::Draw(draw) => handle_draw_message(self, connection_id, draw),
            ClientMessage::ClearAll => handle_clear_all_message(self, connection_id),
            ClientMessage::ClearMine => handle_clear_mine_message(self, connection_id),
            ClientMessage::Ping => handle_ping_message(self, connection_id),
        }
    }

    /// The identity of a registered connection, or `None` with a warning.
    pub(crate) fn require_user(&self, connection_id: ConnectionId) -> Option<UserId> {
        match self.sessions.user_id(&connection_id) {
            Ok(user_id) => Some(user_id.clone()),
            Err(e) => {
                warn!("Rejecting mutation: {}", e);
                None
            }
        }
    }

    /// Queue a frame for one connection. A full or closed outbox drops the session.
    pub(crate) fn send_to(&mut self, connection_id: ConnectionId, frame: Frame) {
        let Some(session) = self.sessions.get(&connection_id) else {
            return;
        };
        if let Err(e) = session.outbox.try_send(frame) {
            self.evict(connection_id, &e);
        }
    }

    /// Queue a frame for every registered connection except `except`.
    pub(crate) fn broadcast(&mut self, frame: Frame, except: Option<ConnectionId>) {
        let mut failed = Vec::new();
        for session in self.sessions.registered() {
            if Some(session.connection_id) == except {
                continue;
            }
            if let Err(e) = session.outbox.try_send(frame.clone()) {
                failed.push((session.connection_id, e));
            }
        }
        for (connection_id, e) in failed {
            self.evict(connection_id, &e);
        }
    }

    pub(crate) fn persist(&self, job: PersistJob) {
        if let Some(persistence) = &self.persistence {
            persistence.submit(job);
        }
    }

    fn evict(&mut self, connection_id: ConnectionId, reason: &TrySendError<Frame>) {
        if self.sessions.get(&connection_id).is_none() {
            return;
        }
        match reason {
            TrySendError::Full(_) => warn!("Outbox of {} is full, dropping the session", connection_id),
            TrySendError::Closed(_) => debug!("Outbox of {} closed, dropping the session", connection_id),
        }
        self.close_session(connection_id);
    }

    /// Forget a connection. Strokes it left open end where they are.
    fn close_session(&mut self, connection_id: ConnectionId) -> Option<Session> {
        let session = self.sessions.disconnect(&connection_id)?;
        for stroke_id in session.active_strokes() {
            debug!("Ending stroke {} left open by {}", stroke_id, connection_id);
            finish_stroke(self, connection_id, stroke_id.clone());
        }
        Some(session)
    }
}

/// Run the hub until every `HubHandle` is dropped.
pub fn spawn_hub(
    mut hub: Hub,
    capacity: usize,
    mut relayed: mpsc::Receiver<RelayEnvelope>,
) -> (HubHandle, JoinHandle<()>) {
    let (tx, mut commands) = mpsc::channel::<HubCommand>(capacity);

    let task = tokio::spawn(async move {
        info!("Hub started for board '{}' on node {}", hub.board, hub.relay.node_id());
        let mut relay_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => hub.handle_command(command),
                    None => break,
                },
                envelope = relayed.recv(), if relay_open => match envelope {
                    Some(envelope) => handle_relayed_envelope(&mut hub, envelope),
                    None => {
                        warn!("Relay subscriber stopped, continuing without sibling updates");
                        relay_open = false;
                    }
                },
            }
        }
        info!("Hub stopped for board '{}'", hub.board);
    });

    (HubHandle { tx }, task)
}
