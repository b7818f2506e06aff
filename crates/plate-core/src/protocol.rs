//! Relay wire protocol.
//!
//! Every event travels as one JSON text frame of the form
//! `{"event": "<name>", "data": {...}}`. Inbound payloads are permissive:
//! missing fields are filled with documented defaults instead of being
//! rejected, so that a sloppy client still pairs.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::code::PairingCode;
use crate::errors::ProtocolError;
use crate::ids::ConnectionId;

/// Role a connection declares when it joins a room.
///
/// The relay does not enforce the host/client asymmetry. Unknown role
/// strings are kept verbatim and echoed back to peers.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq)]
pub enum Role {
    Host,
    #[default]
    Client,
    Other(String),
}

impl Role {
    /// Default-fill rule: absent or empty means `Client`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None | Some("") => Self::Client,
            Some("host") => Self::Host,
            Some("client") => Self::Client,
            Some(other) => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Host => "host",
            Self::Client => "client",
            Self::Other(s) => s,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Non-string roles fall back to the default rather than failing the frame.
        let raw = Option::<Value>::deserialize(deserializer)?;
        Ok(Self::parse(raw.as_ref().and_then(Value::as_str)))
    }
}

/// Accept `"4821"` or `4821`. Null, empty strings and other JSON types
/// count as a missing code.
fn lenient_code<'de, D>(deserializer: D) -> Result<Option<PairingCode>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) if !s.is_empty() => Some(PairingCode::from(s)),
        Some(Value::Number(n)) => Some(PairingCode::from(n.to_string())),
        _ => None,
    })
}

/// Payload of an inbound `join`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct JoinRequest {
    #[serde(default, deserialize_with = "lenient_code")]
    pub code: Option<PairingCode>,
    #[serde(default)]
    pub role: Role,
}

/// Payload of an inbound `select`. `key` is application-defined and
/// forwarded untouched.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct SelectRequest {
    #[serde(default, deserialize_with = "lenient_code")]
    pub code: Option<PairingCode>,
    #[serde(default)]
    pub key: Value,
}

/// Payload of an inbound `end-session`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct EndSessionRequest {
    #[serde(default, deserialize_with = "lenient_code")]
    pub code: Option<PairingCode>,
}

/// Client → server events.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join(JoinRequest),
    Select(SelectRequest),
    EndSession(EndSessionRequest),
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Malformed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Select(_) => "select",
            Self::EndSession(_) => "end-session",
        }
    }
}

/// Server → room events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    PeerJoined {
        id: ConnectionId,
        role: Role,
    },
    Select {
        #[serde(default)]
        key: Value,
        from: ConnectionId,
    },
    SessionEnded {
        code: PairingCode,
    },
    PeerLeft {
        id: ConnectionId,
        role: Role,
    },
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PeerJoined { .. } => "peer-joined",
            Self::Select { .. } => "select",
            Self::SessionEnded { .. } => "session-ended",
            Self::PeerLeft { .. } => "peer-left",
        }
    }
}
