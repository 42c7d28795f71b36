use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::sync::Arc;
use uuid::Uuid;

use crate::store::operation::{
    validate_id, validate_points, validate_style, Point, Stroke, StrokeFragment, ValidationError,
    MAX_POINTS_PER_MESSAGE,
};

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMessage {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Incremental drawing input.
///
/// Without a `stroke_id` the message is a standalone finished stroke. With
/// one, the first message for the id starts the stroke and the following
/// ones append to it until `end` is set.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrawMessage {
    #[serde(default)]
    pub stroke_id: Option<String>,
    #[serde(default)]
    pub points: Vec<Point>,
    pub color: String,
    pub width: f64,
    #[serde(default)]
    pub end: bool,
    #[serde(default)]
    pub op_id: Option<Uuid>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserInfoMessage {
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BoardMessage {
    pub strokes: Vec<Stroke>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrawBroadcastMessage {
    pub stroke: StrokeFragment,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PongMessage {
    pub date: String,
}

/// Messages a client may send.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "register")]
    Register(RegisterMessage),
    #[serde(rename = "draw")]
    Draw(DrawMessage),
    #[serde(rename = "clear-all")]
    ClearAll,
    #[serde(rename = "clear-mine")]
    ClearMine,
    #[serde(rename = "ping")]
    Ping,
}

/// Messages the server sends to a client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "user-info")]
    UserInfo(UserInfoMessage),
    #[serde(rename = "init-board")]
    InitBoard(BoardMessage),
    #[serde(rename = "draw")]
    Draw(DrawBroadcastMessage),
    #[serde(rename = "clear-all")]
    ClearAll,
    #[serde(rename = "reset-board")]
    ResetBoard(BoardMessage),
    #[serde(rename = "pong")]
    Pong(PongMessage),
}

impl ClientMessage {
    /// Parse and validate one text frame. Anything malformed stops here.
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let msg: ClientMessage = serde_json::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            ClientMessage::Draw(draw) => {
                if let Some(id) = &draw.stroke_id {
                    validate_id(id)?;
                }
                validate_style(&draw.color, draw.width)?;
                validate_points(&draw.points, MAX_POINTS_PER_MESSAGE)
            }
            // Bad declared ids fall back to a derived one at registration
            ClientMessage::Register(_) | ClientMessage::ClearAll | ClientMessage::ClearMine | ClientMessage::Ping => Ok(()),
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Encode once for fan-out to many outboxes.
    pub fn to_frame(&self) -> Result<Arc<str>, serde_json::Error> {
        self.encode().map(Arc::from)
    }
}
