use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::operation::{validate_id, StrokeId, UserId};

pub type ConnectionId = Uuid;

/// One pre-encoded text frame, shared between every outbox it is sent to.
pub type Frame = Arc<str>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} is not registered")]
    NotRegistered(ConnectionId),
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),
    #[error("stroke '{0}' was not started by this connection")]
    NotStrokeOwner(StrokeId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registered(UserId),
    Disconnected,
}

#[derive(Debug)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub state: SessionState,
    pub outbox: mpsc::Sender<Frame>,
    pub connected_at: DateTime<Utc>,
    /// Strokes this connection started and has not ended yet.
    active_strokes: HashSet<StrokeId>,
}

impl Session {
    pub fn user_id(&self) -> Option<&UserId> {
        match &self.state {
            SessionState::Registered(user_id) => Some(user_id),
            _ => None,
        }
    }

    /// Strokes this connection started and has not ended yet.
    pub fn active_strokes(&self) -> impl Iterator<Item = &StrokeId> {
        self.active_strokes.iter()
    }
}

/// `anon-<uuid>` identity for connections that did not declare one.
pub fn derive_user_id(connection_id: ConnectionId) -> UserId {
    format!("anon-{}", connection_id.simple())
}

/// Connection to user mapping for the lifetime of each connection.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<ConnectionId, Session>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, connection_id: ConnectionId, outbox: mpsc::Sender<Frame>) {
        self.sessions.insert(
            connection_id,
            Session {
                connection_id,
                state: SessionState::Unregistered,
                outbox,
                connected_at: Utc::now(),
                active_strokes: HashSet::new(),
            },
        );
    }

    /// Move a connection to `Registered` and return the identity it was given.
    pub fn register(
        &mut self,
        connection_id: ConnectionId,
        declared: Option<&str>,
        allow_declared: bool,
    ) -> Result<UserId, SessionError> {
        let session = self
            .sessions
            .get_mut(&connection_id)
            .ok_or(SessionError::UnknownConnection(connection_id))?;

        if session.state != SessionState::Unregistered {
            return Err(SessionError::AlreadyRegistered(connection_id));
        }

        let user_id = match declared {
            Some(id) if allow_declared && validate_id(id).is_ok() => id.to_string(),
            Some(id) => {
                if allow_declared {
                    warn!("Ignoring invalid declared user id on connection {}", connection_id);
                } else {
                    debug!("Declared user id '{}' ignored on connection {}", id, connection_id);
                }
                derive_user_id(connection_id)
            }
            None => derive_user_id(connection_id),
        };

        session.state = SessionState::Registered(user_id.clone());
        Ok(user_id)
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<&Session> {
        self.sessions.get(connection_id)
    }

    /// The identity stamped on every mutation from this connection.
    pub fn user_id(&self, connection_id: &ConnectionId) -> Result<&UserId, SessionError> {
        let session = self
            .sessions
            .get(connection_id)
            .ok_or(SessionError::UnknownConnection(*connection_id))?;
        session.user_id().ok_or(SessionError::NotRegistered(*connection_id))
    }

    /// Remove a connection. The returned session is in its terminal state.
    pub fn disconnect(&mut self, connection_id: &ConnectionId) -> Option<Session> {
        let mut session = self.sessions.remove(connection_id)?;
        session.state = SessionState::Disconnected;
        Some(session)
    }

    /// Sessions that take part in fan-out.
    pub fn registered(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values().filter(|s| s.user_id().is_some())
    }

    pub fn begin_stroke(&mut self, connection_id: &ConnectionId, stroke_id: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(connection_id)
            .ok_or(SessionError::UnknownConnection(*connection_id))?;
        session.active_strokes.insert(stroke_id.to_string());
        Ok(())
    }

    pub fn owns_stroke(&self, connection_id: &ConnectionId, stroke_id: &str) -> bool {
        self.sessions
            .get(connection_id)
            .is_some_and(|s| s.active_strokes.contains(stroke_id))
    }

    pub fn end_stroke(&mut self, connection_id: &ConnectionId, stroke_id: &str) {
        if let Some(session) = self.sessions.get_mut(connection_id) {
            session.active_strokes.remove(stroke_id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn registered_count(&self) -> usize {
        self.registered().count()
    }
}
