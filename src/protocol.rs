//! JSON messages exchanged on `/ws/logs`.

use serde::{Deserialize, Deserializer, Serialize};

use crate::demux::{LogRecord, StreamKind};

pub const INVALID_MESSAGE_FORMAT: &str = "invalid message format";
pub const CONTAINER_ID_REQUIRED: &str = "containerId is required";

/// Control messages sent by the client. An absent or `null` `containerId`
/// decodes as an empty string so that each handler decides how to treat it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "containerId", default, deserialize_with = "null_as_empty")]
        container_id: String,
    },
    Unsubscribe {
        #[serde(rename = "containerId", default, deserialize_with = "null_as_empty")]
        container_id: String,
    },
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl ClientMessage {
    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Log {
        #[serde(rename = "containerId")]
        container_id: String,
        timestamp: String,
        message: String,
        stream: StreamKind,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<LogRecord> for ServerMessage {
    fn from(record: LogRecord) -> Self {
        ServerMessage::Log {
            container_id: record.container_id,
            timestamp: record.timestamp,
            message: record.message,
            stream: record.stream,
        }
    }
}
