//! Gateway wire protocol: JSON frames `{op, d, s, t}` and their payloads.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};

/// Gateway opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// An event was dispatched.
    Dispatch = 0,
    /// Heartbeat, sent by either side.
    Heartbeat = 1,
    /// Start a new session.
    Identify = 2,
    /// Update the client's presence.
    PresenceUpdate = 3,
    /// Join, move or leave voice channels.
    VoiceStateUpdate = 4,
    /// Resume a previous session.
    Resume = 6,
    /// The server asks the client to reconnect and resume.
    Reconnect = 7,
    /// Request guild member chunks.
    RequestGuildMembers = 8,
    /// The session was invalidated.
    InvalidSession = 9,
    /// First frame after connecting, carries the heartbeat interval.
    Hello = 10,
    /// Acknowledges a heartbeat.
    HeartbeatAck = 11,
}

impl Opcode {
    /// Decodes a raw opcode.
    pub fn from_u8(op: u8) -> Option<Self> {
        let opcode = match op {
            0 => Opcode::Dispatch,
            1 => Opcode::Heartbeat,
            2 => Opcode::Identify,
            3 => Opcode::PresenceUpdate,
            4 => Opcode::VoiceStateUpdate,
            6 => Opcode::Resume,
            7 => Opcode::Reconnect,
            8 => Opcode::RequestGuildMembers,
            9 => Opcode::InvalidSession,
            10 => Opcode::Hello,
            11 => Opcode::HeartbeatAck,
            _ => return None,
        };
        Some(opcode)
    }

    /// True for opcodes a caller may send through a shard handle.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Opcode::PresenceUpdate | Opcode::VoiceStateUpdate | Opcode::RequestGuildMembers
        )
    }
}

/// One gateway frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayFrame {
    /// Raw opcode.
    pub op: u8,
    /// Payload.
    #[serde(default)]
    pub d: Value,
    /// Sequence number, dispatches only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// Event name, dispatches only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayFrame {
    /// A frame without sequence or event name.
    pub fn new(op: Opcode, d: Value) -> Self {
        Self {
            op: op as u8,
            d,
            s: None,
            t: None,
        }
    }

    /// Parses a text frame.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes to a text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The opcode, if known.
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.op)
    }

    /// A heartbeat carrying the last sequence number seen.
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::new(Opcode::Heartbeat, json!(sequence))
    }

    /// A resume request.
    pub fn resume(token: &str, session_id: &str, sequence: Option<u64>) -> Self {
        Self::new(
            Opcode::Resume,
            json!({
                "token": token,
                "session_id": session_id,
                "seq": sequence,
            }),
        )
    }

    /// An identify request.
    pub fn identify(identify: &Identify) -> Result<Self> {
        Ok(Self::new(Opcode::Identify, serde_json::to_value(identify)?))
    }
}

/// Connection properties sent with identify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    /// Operating system.
    pub os: String,
    /// Library name.
    pub browser: String,
    /// Library name.
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "gatewire".to_string(),
            device: "gatewire".to_string(),
        }
    }
}

/// Identify payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    /// Authentication token.
    pub token: String,
    /// Gateway intents bitfield.
    pub intents: u64,
    /// `[shard_index, shard_count]`.
    pub shard: [u32; 2],
    /// Member count above which offline members are omitted.
    pub large_threshold: u32,
    /// Client properties.
    pub properties: ConnectionProperties,
    /// Payload compression; always false.
    pub compress: bool,
}

/// Hello payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Hello {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
}

impl Hello {
    /// Extracts the hello payload from a frame.
    pub fn from_frame(frame: &GatewayFrame) -> Result<Self> {
        if frame.opcode() != Some(Opcode::Hello) {
            return Err(GatewayError::Protocol {
                reason: format!("expected HELLO opcode 10 but received {}", frame.op),
            });
        }
        let hello: Hello = serde_json::from_value(frame.d.clone())?;
        if hello.heartbeat_interval == 0 {
            return Err(GatewayError::Protocol {
                reason: "HELLO carried a zero heartbeat interval".to_string(),
            });
        }
        Ok(hello)
    }
}

/// The parts of a READY dispatch the shard itself needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Ready {
    /// New session id.
    pub session_id: String,
    /// URL to use when resuming this session.
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// A decoded inbound event handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEvent {
    /// Shard that received it.
    pub shard_id: u32,
    /// Opcode of the frame.
    pub opcode: Opcode,
    /// Sequence number, dispatches only.
    pub sequence: Option<u64>,
    /// Event name, dispatches only.
    pub name: Option<String>,
    /// Payload.
    pub data: Value,
}
