//! Presence protocol message types.
//!
//! Every message is one JSON object posted to the broadcast channel. The
//! `action` field selects the protocol message; anything that does not parse
//! as one of them is handed to `message` subscribers untouched.

use crate::{ContextId, MemberRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages the presence protocol itself understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum BusMessage {
    /// Start of a heartbeat round; every live context answers with a pong.
    Ping {
        /// Sender of the ping
        id: ContextId,
    },

    /// Answer to a ping carrying the responder's current attributes.
    Pong {
        /// Responder
        id: ContextId,
        /// Responder's member record
        attributes: MemberRecord,
    },

    /// Announcement of the election winner.
    Elect {
        /// The context that should lead
        id: ContextId,
    },
}

impl BusMessage {
    /// Create a ping.
    pub fn ping(id: ContextId) -> Self {
        Self::Ping { id }
    }

    /// Create a pong.
    pub fn pong(id: ContextId, attributes: MemberRecord) -> Self {
        Self::Pong { id, attributes }
    }

    /// Create an election announcement.
    pub fn elect(id: ContextId) -> Self {
        Self::Elect { id }
    }

    /// The context id carried by the message.
    pub fn id(&self) -> ContextId {
        match self {
            Self::Ping { id } | Self::Pong { id, .. } | Self::Elect { id } => *id,
        }
    }

    /// Short name for logging.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Elect { .. } => "elect",
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// JSON value form, as delivered to `message` subscribers.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// A delivery from the bus after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A ping, pong or elect message
    Protocol(BusMessage),
    /// Any other JSON object, passed through verbatim
    Other(Value),
}

impl Inbound {
    /// Parse raw bytes from the bus.
    ///
    /// Fails only when the bytes are not JSON at all.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(data)?;
        Ok(Self::from_value(value))
    }

    /// Classify an already-parsed JSON value.
    pub fn from_value(value: Value) -> Self {
        match BusMessage::deserialize(&value) {
            Ok(message) => Self::Protocol(message),
            Err(_) => Self::Other(value),
        }
    }
}
