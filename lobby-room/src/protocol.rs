//! JSON wire protocol for the lobby transport.
//!
//! Every WebSocket text frame carries exactly one frame object, tagged by
//! `type`:
//!
//! ```text
//! client → server   {"type":"request","id":1,"route":"room.join","body":{}}
//!                   {"type":"notify","route":"room.message","body":{"name":"a","content":"hi"}}
//!                   {"type":"heartbeat"}
//!
//! server → client   {"type":"push","route":"onMembers","body":{"members":[1,2]}}
//!                   {"type":"response","id":1,"body":{"code":0,"result":"Success"}}
//!                   {"type":"heartbeat"}
//! ```
//!
//! Bodies are kept as `serde_json::Value` on the frame so the transport can
//! route without knowing every payload type; handlers decode the typed
//! payloads below.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::session::SessionId;

/// Inbound route: join the room.
pub const ROUTE_JOIN: &str = "room.join";
/// Inbound route: chat message to the room.
pub const ROUTE_MESSAGE: &str = "room.message";

/// Outbound route: membership snapshot sent to a new member.
pub const ON_MEMBERS: &str = "onMembers";
/// Outbound route: arrival announcement sent to existing members.
pub const ON_NEW_USER: &str = "onNewUser";
/// Outbound route: chat message fan-out.
pub const ON_MESSAGE: &str = "onMessage";
/// Outbound route: rejection of an inbound action.
pub const ON_ERROR: &str = "onError";

/// Status code of a successful response.
pub const CODE_OK: i32 = 0;
/// Sender is not a member of the room.
pub const CODE_NOT_JOINED: i32 = 403;
/// Request addressed an unknown route.
pub const CODE_UNKNOWN_ROUTE: i32 = 404;
/// Request body could not be decoded.
pub const CODE_BAD_REQUEST: i32 = 400;
/// Join failed (identity binding or delivery).
pub const CODE_JOIN_FAILED: i32 = 500;
/// Room is at its configured member limit.
pub const CODE_ROOM_FULL: i32 = 503;

/// Frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Expects exactly one `response` frame carrying the same `id`.
    Request {
        id: u64,
        route: String,
        #[serde(default)]
        body: Value,
    },
    /// Fire-and-forget.
    Notify {
        route: String,
        #[serde(default)]
        body: Value,
    },
    Heartbeat,
}

/// Frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Push { route: String, body: Value },
    Response { id: u64, body: Value },
    Heartbeat,
}

impl ClientFrame {
    pub fn request(id: u64, route: impl Into<String>, body: &impl Serialize) -> Result<Self, ProtocolError> {
        Ok(Self::Request {
            id,
            route: route.into(),
            body: to_body(body)?,
        })
    }

    pub fn notify(route: impl Into<String>, body: &impl Serialize) -> Result<Self, ProtocolError> {
        Ok(Self::Notify {
            route: route.into(),
            body: to_body(body)?,
        })
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ServerFrame {
    pub fn push(route: impl Into<String>, body: &impl Serialize) -> Result<Self, ProtocolError> {
        Ok(Self::Push {
            route: route.into(),
            body: to_body(body)?,
        })
    }

    pub fn response(id: u64, body: &impl Serialize) -> Result<Self, ProtocolError> {
        Ok(Self::Response {
            id,
            body: to_body(body)?,
        })
    }

    /// Route of a push frame, `None` for other frame kinds.
    pub fn route(&self) -> Option<&str> {
        match self {
            Self::Push { route, .. } => Some(route),
            _ => None,
        }
    }

    /// Decode the body into a typed payload.
    pub fn body_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let body = match self {
            Self::Push { body, .. } | Self::Response { body, .. } => body,
            Self::Heartbeat => return Err(ProtocolError::Deserialization("heartbeat has no body".into())),
        };
        serde_json::from_value(body.clone()).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

fn to_body(body: &impl Serialize) -> Result<Value, ProtocolError> {
    serde_json::to_value(body).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Decode a typed payload from an inbound body.
pub fn from_body<T: serde::de::DeserializeOwned>(body: &Value) -> Result<T, ProtocolError> {
    T::deserialize(body).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

// ─── Payloads ────────────────────────────────────────────────────

/// Chat message, inbound on `room.message` and outbound on `onMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub name: String,
    pub content: String,
}

/// Arrival announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub content: String,
}

impl NewUser {
    pub fn announce(id: SessionId) -> Self {
        Self {
            content: format!("New user: {id}"),
        }
    }
}

/// Membership snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllMembers {
    pub members: Vec<SessionId>,
}

/// Status reply used for join responses and `onError` pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub code: i32,
    pub result: String,
}

impl JoinResponse {
    pub fn success() -> Self {
        Self {
            code: CODE_OK,
            result: "Success".to_string(),
        }
    }

    pub fn failure(code: i32, result: impl Into<String>) -> Self {
        Self {
            code,
            result: result.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unknown route: {0}")]
    UnknownRoute(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
