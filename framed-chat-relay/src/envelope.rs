//! JSON envelopes carried inside frames.
//!
//! Clients send either `{"USERNAME": name}` or `{"MESSAGES": [...]}`. Each
//! chat message travels as a 4-element array
//! `[sender, destination, timestamp, body]`.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::ProtocolError, frame};

/// Destination value that addresses every registered user.
pub const BROADCAST: &str = "ALL";

/// Greeting sent with an accepted registration.
pub const WELCOME: &str = "Welcome!";

type WireMessage = (String, String, i64, String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireMessage", into = "WireMessage")]
pub struct ChatMessage {
    pub sender: String,
    pub destination: String,
    /// Seconds since the Unix epoch. The relay restamps every message it
    /// accepts with its own clock.
    pub timestamp: i64,
    pub body: String,
}

impl ChatMessage {
    pub fn new(
        sender: impl Into<String>,
        destination: impl Into<String>,
        timestamp: i64,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            destination: destination.into(),
            timestamp,
            body: body.into(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination == BROADCAST
    }

    /// True when `username` should see this message in its backlog.
    pub fn is_visible_to(&self, username: &str) -> bool {
        self.is_broadcast() || self.destination == username
    }
}

/// Current time in whole seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

impl From<WireMessage> for ChatMessage {
    fn from((sender, destination, timestamp, body): WireMessage) -> Self {
        Self {
            sender,
            destination,
            timestamp,
            body,
        }
    }
}

impl From<ChatMessage> for WireMessage {
    fn from(message: ChatMessage) -> Self {
        (
            message.sender,
            message.destination,
            message.timestamp,
            message.body,
        )
    }
}

/// Envelopes flowing from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ClientEnvelope {
    Register {
        #[serde(rename = "USERNAME")]
        username: String,
    },
    Batch {
        #[serde(rename = "MESSAGES")]
        messages: Vec<ChatMessage>,
    },
}

impl ClientEnvelope {
    /// Decodes a client payload.
    ///
    /// Only text that is not JSON at all is an error. `Ok(None)` covers JSON
    /// that is not a client envelope: anything other than an object, an
    /// object with neither `USERNAME` nor `MESSAGES`, or one of those keys
    /// holding the wrong type. When both keys are present the username wins.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let Value::Object(mut fields) = serde_json::from_slice::<Value>(payload)? else {
            return Ok(None);
        };
        if let Some(username) = fields.remove("USERNAME") {
            return Ok(match username {
                Value::String(username) => Some(ClientEnvelope::Register { username }),
                _ => None,
            });
        }
        let Some(messages) = fields.remove("MESSAGES") else {
            return Ok(None);
        };
        Ok(serde_json::from_value(messages)
            .ok()
            .map(|messages| ClientEnvelope::Batch { messages }))
    }

    pub fn to_payload(&self) -> Result<Bytes, ProtocolError> {
        Ok(serde_json::to_vec(self)?.into())
    }
}

/// Reply to a `USERNAME` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationReply {
    #[serde(rename = "USERNAME_ACCEPTED", with = "flag")]
    pub accepted: bool,
    #[serde(rename = "INFO")]
    pub info: String,
    #[serde(rename = "USER_LIST", default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,
    #[serde(rename = "MESSAGES", default, skip_serializing_if = "Option::is_none")]
    pub backlog: Option<Vec<ChatMessage>>,
}

/// Envelopes flowing from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerEnvelope {
    // Tried first: a registration reply may also carry `MESSAGES`.
    Registration(RegistrationReply),
    UsersJoined {
        #[serde(rename = "USERS_JOINED")]
        users: Vec<String>,
    },
    UsersLeft {
        #[serde(rename = "USERS_LEFT")]
        users: Vec<String>,
    },
    Messages {
        #[serde(rename = "MESSAGES")]
        messages: Vec<ChatMessage>,
    },
    Error {
        #[serde(rename = "ERROR")]
        message: String,
    },
}

impl ServerEnvelope {
    pub fn accepted(users: Vec<String>, backlog: Vec<ChatMessage>) -> Self {
        ServerEnvelope::Registration(RegistrationReply {
            accepted: true,
            info: WELCOME.to_string(),
            users: Some(users),
            backlog: Some(backlog),
        })
    }

    pub fn rejected(info: impl Into<String>) -> Self {
        ServerEnvelope::Registration(RegistrationReply {
            accepted: false,
            info: info.into(),
            users: None,
            backlog: None,
        })
    }

    pub fn joined(username: impl Into<String>) -> Self {
        ServerEnvelope::UsersJoined {
            users: vec![username.into()],
        }
    }

    pub fn left(username: impl Into<String>) -> Self {
        ServerEnvelope::UsersLeft {
            users: vec![username.into()],
        }
    }

    pub fn relay(message: ChatMessage) -> Self {
        ServerEnvelope::Messages {
            messages: vec![message],
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEnvelope::Error {
            message: message.into(),
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Serializes and frames the envelope, ready to write to a socket.
    pub fn to_frame(&self) -> Result<Bytes, ProtocolError> {
        let payload = serde_json::to_vec(self)?;
        Ok(frame::encode(&payload)?)
    }
}

/// `USERNAME_ACCEPTED` travels as the strings `"true"` / `"false"`.
mod flag {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(if *value { "true" } else { "false" })
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(D::Error::custom(format!(
                "expected \"true\" or \"false\", got {other:?}"
            ))),
        }
    }
}
