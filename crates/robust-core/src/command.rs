use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A message target. Group channels carry a leading `#`; anything else is
/// direct addressing and is never persisted locally.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn is_group(&self) -> bool {
        self.0.starts_with('#')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Channel {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Sender descriptor attached to each message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The authenticated user returned by a successful auth reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

/// One chat message as it appears on the wire and in the store.
/// `id` is server-assigned and unique; re-delivery overwrites by id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub body: String,
    /// Epoch milliseconds, UTC. Not assumed monotonic or unique.
    pub ts: i64,
    pub target: Channel,
    pub from: Sender,
}

/// Stored credential triple echoed back in a successful auth reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthData {
    pub key: String,
    pub secret: String,
}

/// Challenge issued when the server wants an interactive authorization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthChallenge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Inbound auth reply. `success: false` with a challenge url means the
/// server expects the client to complete an external flow and wait for a
/// later auth frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<AuthData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<AuthChallenge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

/// Ordered batch of historical messages for one target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BacklogBatch {
    pub target: Channel,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
}

/// Join/part notification payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    pub target: Channel,
}

/// A decoded inbound frame. Immutable by construction: no mutating API.
#[derive(Clone, Debug)]
pub enum Command {
    Auth(AuthReply),
    Message(MessageRecord),
    Backlog(BacklogBatch),
    Join(ChannelUpdate),
    Part(ChannelUpdate),
    Ping,
    /// Well-formed JSON with a type this client does not route. Still
    /// surfaces through the raw-command event.
    Unknown(Value),
}

/// Malformed frame. Non-fatal: the frame is dropped and the connection
/// stays open.
#[derive(Clone, Debug, thiserror::Error)]
#[error("malformed frame: {detail}")]
pub struct ProtocolError {
    pub detail: String,
}

impl Command {
    /// Decode one frame of UTF-8 text. Returns the typed command together
    /// with the raw decoded value (for the raw-command notification).
    pub fn decode(frame: &str) -> Result<(Self, Value), ProtocolError> {
        let value: Value = serde_json::from_str(frame).map_err(|e| ProtocolError {
            detail: e.to_string(),
        })?;
        let command = Self::from_value(&value)?;
        Ok((command, value))
    }

    /// Route by the `type` discriminator. A missing or unrecognized type is
    /// not an error; it decodes to `Unknown`.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        let parse_err = |e: serde_json::Error| ProtocolError {
            detail: format!("bad {kind} command: {e}"),
        };
        match kind {
            "auth" => Ok(Self::Auth(
                serde_json::from_value(value.clone()).map_err(parse_err)?,
            )),
            "message" => Ok(Self::Message(
                serde_json::from_value(value.clone()).map_err(parse_err)?,
            )),
            "backlog" => Ok(Self::Backlog(
                serde_json::from_value(value.clone()).map_err(parse_err)?,
            )),
            "join" => Ok(Self::Join(
                serde_json::from_value(value.clone()).map_err(parse_err)?,
            )),
            "part" => Ok(Self::Part(
                serde_json::from_value(value.clone()).map_err(parse_err)?,
            )),
            "ping" => Ok(Self::Ping),
            _ => Ok(Self::Unknown(value.clone())),
        }
    }

    pub fn command_type(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Message(_) => "message",
            Self::Backlog(_) => "backlog",
            Self::Join(_) => "join",
            Self::Part(_) => "part",
            Self::Ping => "ping",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Outbound frames. The connection writer appends the newline terminator;
/// the liveness probe is a bare empty frame and never goes through here.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundCommand {
    Auth {
        mode: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        challenge: Option<AuthData>,
    },
    Backlog {
        target: Channel,
    },
    Ping,
}

impl OutboundCommand {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
