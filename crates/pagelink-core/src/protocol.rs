//! Wire protocol definitions
//!
//! Control messages and meta envelopes are JSON text. Stream frames used by
//! the QUIC transport are serialized with bincode and prefixed with a 4-byte
//! little-endian length.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::{
    ChannelId, EpisodeMeta, EpisodeRequest, RemoteError, Role, TransferRequest,
};
use crate::MAX_FRAME_SIZE;

pub const CMD_ABSTRACT: &str = "abstract";
pub const CMD_EPISODE: &str = "episode";
pub const CMD_FETCH: &str = "fetch";
pub const CMD_META: &str = "meta";
pub const CMD_ERROR: &str = "error";

/// Message exchanged over the control channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub cmd: String,
    pub target: Role,
    #[serde(default)]
    pub args: Value,
}

impl ControlMessage {
    pub fn new(cmd: impl Into<String>, target: Role, args: Value) -> Self {
        Self {
            cmd: cmd.into(),
            target,
            args,
        }
    }

    /// Parse from JSON text
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to JSON text
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Decoded control command
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Batched preview request (client -> host)
    Abstract(TransferRequest),
    /// Episode metadata request (client -> host)
    EpisodeRequest(EpisodeRequest),
    /// Episode metadata reply (host -> client)
    EpisodeReply(EpisodeMeta),
    /// Full file request (client -> host)
    Fetch(TransferRequest),
    /// Ask the host to push its session summary again
    Meta,
    /// A request could not be served
    Error(RemoteError),
}

impl Command {
    /// Wire name of the command
    pub fn name(&self) -> &'static str {
        match self {
            Command::Abstract(_) => CMD_ABSTRACT,
            Command::EpisodeRequest(_) | Command::EpisodeReply(_) => CMD_EPISODE,
            Command::Fetch(_) => CMD_FETCH,
            Command::Meta => CMD_META,
            Command::Error(_) => CMD_ERROR,
        }
    }

    /// Decode the command carried by a control message
    ///
    /// `episode` is both a request and a reply; the direction is taken from
    /// the target, falling back to the argument shape for unspecified targets.
    pub fn decode(msg: &ControlMessage) -> Result<Command, ProtocolError> {
        match msg.cmd.as_str() {
            CMD_ABSTRACT => Ok(Command::Abstract(args(msg)?)),
            CMD_FETCH => {
                let req: TransferRequest = args(msg)?;
                if req.index.is_none() {
                    return Err(ProtocolError::InvalidArguments {
                        command: msg.cmd.clone(),
                        reason: "missing file index".into(),
                    });
                }
                Ok(Command::Fetch(req))
            }
            CMD_EPISODE => {
                let is_reply = match msg.target {
                    Role::Client => true,
                    Role::Host => false,
                    Role::Unspecified => msg.args.get("length").is_some(),
                };
                if is_reply {
                    Ok(Command::EpisodeReply(args(msg)?))
                } else {
                    Ok(Command::EpisodeRequest(args(msg)?))
                }
            }
            CMD_META => Ok(Command::Meta),
            CMD_ERROR => Ok(Command::Error(args(msg)?)),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Encode into a control message addressed to `target`
    pub fn to_message(&self, target: Role) -> Result<ControlMessage, ProtocolError> {
        let args = match self {
            Command::Abstract(req) | Command::Fetch(req) => to_value(req)?,
            Command::EpisodeRequest(req) => to_value(req)?,
            Command::EpisodeReply(meta) => to_value(meta)?,
            Command::Meta => Value::Null,
            Command::Error(err) => to_value(err)?,
        };
        Ok(ControlMessage::new(self.name(), target, args))
    }
}

fn args<T: DeserializeOwned>(msg: &ControlMessage) -> Result<T, ProtocolError> {
    serde_json::from_value(msg.args.clone()).map_err(|e| ProtocolError::InvalidArguments {
        command: msg.cmd.clone(),
        reason: e.to_string(),
    })
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// First message on a transfer channel, declaring the payload length
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaEnvelope {
    pub size: u64,
}

#[derive(Deserialize)]
struct MetaWire {
    #[serde(rename = "type")]
    kind: String,
    size: u64,
}

const META_TYPE: &str = "meta";

impl MetaEnvelope {
    pub fn new(size: u64) -> Self {
        Self { size }
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let wire: MetaWire = serde_json::from_str(json)?;
        if wire.kind != META_TYPE {
            return Err(ProtocolError::Malformed(format!(
                "expected meta envelope, got type {:?}",
                wire.kind
            )));
        }
        Ok(Self { size: wire.size })
    }

    pub fn to_json(&self) -> String {
        format!(r#"{{"type":"{}","size":{}}}"#, META_TYPE, self.size)
    }
}

/// Framing unit on a QUIC stream carrying one data channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamFrame {
    /// First frame of every stream: binds it to a channel
    Open {
        id: ChannelId,
        label: String,
        /// Session token presented on the control stream
        token: Option<[u8; 16]>,
    },
    Text(String),
    Binary(Vec<u8>),
}

impl StreamFrame {
    /// Payload size as counted against the buffered amount
    pub fn payload_len(&self) -> usize {
        match self {
            StreamFrame::Open { .. } => 0,
            StreamFrame::Text(text) => text.len(),
            StreamFrame::Binary(data) => data.len(),
        }
    }
}

/// Serialize a frame with length prefix
pub fn serialize_frame(frame: &StreamFrame) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        bincode::serialize(frame).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = payload.len() as u32;

    let mut result = Vec::with_capacity(4 + payload.len());
    result.extend_from_slice(&len.to_le_bytes());
    result.extend_from_slice(&payload);

    Ok(result)
}

/// Deserialize a frame (without length prefix)
pub fn deserialize_frame(data: &[u8]) -> Result<StreamFrame, ProtocolError> {
    Ok(bincode::deserialize(data)?)
}
