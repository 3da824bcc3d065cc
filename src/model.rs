//! Wire model: activities, attachments, and the multi-stream request/response envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ClientError;

/// One chat-protocol message frame. Unknown fields round-trip through `extra`
/// so the crate never has to understand the full activity schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    #[serde(rename = "type")]
    pub activity_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<From>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Activity {
    pub fn new(activity_type: impl Into<String>) -> Self {
        Self {
            activity_type: activity_type.into(),
            id: None,
            from: None,
            attachments: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn is_message(&self) -> bool {
        self.activity_type == "message"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct From {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    #[serde(rename = "contentType")]
    pub content_type: String,

    #[serde(rename = "contentUrl")]
    pub content_url: String,
}

/// Server-pushed envelope: exactly one activity plus zero or more attachment streams.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivitySet {
    pub activities: Vec<Activity>,
}

/// A single binary or text stream within a multi-stream request or response.
#[derive(Debug, Clone)]
pub struct ContentStream {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl ContentStream {
    pub fn json(value: &impl Serialize) -> Self {
        Self::json_typed("application/json", value)
    }

    /// A JSON-encoded stream under an explicit content type, for wire
    /// envelopes (e.g. `application/vnd.microsoft.activity`) that are not
    /// plain `application/json`.
    pub fn json_typed(content_type: impl Into<String>, value: &impl Serialize) -> Self {
        Self {
            content_type: content_type.into(),
            data: serde_json::to_vec(value).expect("activity payloads are always serializable"),
        }
    }

    pub fn as_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, TransportDecodeError> {
        serde_json::from_slice(&self.data).map_err(|e| TransportDecodeError(e.to_string()))
    }
}

#[derive(Debug)]
pub struct TransportDecodeError(pub String);

impl std::fmt::Display for TransportDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportDecodeError {}

/// One request sent over the framed transport, either direction.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub id: u64,
    pub method: String,
    pub path: String,
    pub streams: Vec<ContentStream>,
}

/// The response to a [`StreamRequest`].
#[derive(Debug, Clone)]
pub struct StreamResponse {
    pub id: u64,
    pub status_code: u16,
    pub streams: Vec<ContentStream>,
}

impl StreamResponse {
    pub fn ok(id: u64, streams: Vec<ContentStream>) -> Self {
        Self {
            id,
            status_code: 200,
            streams,
        }
    }

    pub fn error(id: u64, status_code: u16) -> Self {
        Self {
            id,
            status_code,
            streams: Vec::new(),
        }
    }
}

/// Observable state of the connection, replayed to new subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Uninitialized,
    Connecting,
    Online,
    Ended,
}

/// Credentials swapped in by an explicit [`crate::client::DirectLineClient::reconnect`] call.
#[derive(Debug, Clone)]
pub struct ConversationCredentials {
    pub conversation_id: Option<String>,
    pub token: String,
}

/// Explicit replacement for a nullable-token sentinel: the refresher either
/// holds a usable token or has given up for good.
#[derive(Debug, Clone)]
pub enum AuthState {
    Token(String),
    Exhausted,
}

impl AuthState {
    pub fn as_token(&self) -> Option<&str> {
        match self {
            AuthState::Token(t) => Some(t),
            AuthState::Exhausted => None,
        }
    }
}

/// Items delivered on the public activity stream.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    Activity(Activity),
    Error(ClientError),
}
