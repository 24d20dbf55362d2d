use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

pub const WELCOME_MESSAGE: &str = "Connected to relay server";
pub const INVALID_JSON: &str = "Invalid JSON format";

/// Notifications the server sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Welcome { message: String, timestamp: String },
    Echo { original: Value, timestamp: String },
    Broadcast { message: Value, timestamp: String },
    Error { message: String },
}

impl ServerMessage {
    pub fn welcome() -> Self {
        ServerMessage::Welcome {
            message: WELCOME_MESSAGE.to_string(),
            timestamp: timestamp(),
        }
    }

    pub fn echo(original: Value) -> Self {
        ServerMessage::Echo {
            original,
            timestamp: timestamp(),
        }
    }

    pub fn broadcast(message: Value) -> Self {
        ServerMessage::Broadcast {
            message,
            timestamp: timestamp(),
        }
    }

    pub fn invalid_json() -> Self {
        ServerMessage::Error {
            message: INVALID_JSON.to_string(),
        }
    }

    pub fn to_text(&self) -> Result<String, RelayError> {
        serde_json::to_string(self)
            .map_err(|e| RelayError::Transport(format!("Failed to serialize message: {}", e)))
    }
}

/// Parses an inbound frame. Any JSON value is accepted, not only objects.
pub fn parse_payload(raw: &[u8]) -> Result<Value, RelayError> {
    serde_json::from_slice(raw).map_err(|e| RelayError::ParseFailure(e.to_string()))
}

/// Current time as RFC 3339 in UTC with millisecond precision.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
