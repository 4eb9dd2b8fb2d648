//! Mesh packet types and framing
//!
//! Every frame on the radio link is a fixed 5-byte header followed by an
//! opaque payload. The codec never interprets the payload; each command
//! handler owns its own layout.
//!
//! ## Packet Structure
//!
//! ```text
//! ┌──────────┬─────────┬───────────┬─────────┬─────────────┬──────────────┐
//! │ Dest(1B) │ Src(1B) │ Control   │ TTL(1B) │ Command(1B) │ Payload      │
//! │          │         │   (1B)    │         │             │ (0..n bytes) │
//! └──────────┴─────────┴───────────┴─────────┴─────────────┴──────────────┘
//!
//! Control byte:
//!   bit 7-6  frame type   00 = CMD, 01 = RESP, 10 = ACK, 11 = NACK
//!   bit 5    ack required
//!   bit 4-0  reserved
//! ```

use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node address on the mesh
pub type NodeId = u8;

/// Destination that every node accepts
pub const BROADCAST_ID: NodeId = 255;

/// Hop budget given to freshly originated packets
pub const INITIAL_TTL: u8 = 16;

/// Header size in bytes
pub const HEADER_SIZE: usize = 5;

/// Frame type carried in the two high bits of the control byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Command
    Cmd = 0x00,
    /// Response
    Resp = 0x40,
    /// Acknowledgment
    Ack = 0x80,
    /// Negative acknowledgment
    Nack = 0xC0,
}

/// Control byte: frame type plus option bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Control(u8);

impl Control {
    const FRAME_MASK: u8 = 0xC0;
    const ACK_REQUIRED: u8 = 0x20;

    /// Plain command frame
    pub const CMD: Control = Control(FrameType::Cmd as u8);
    /// Plain response frame
    pub const RESP: Control = Control(FrameType::Resp as u8);

    /// Control byte for a frame type
    pub fn new(frame_type: FrameType) -> Self {
        Control(frame_type as u8)
    }

    /// Frame type from the two high bits
    pub fn frame_type(&self) -> FrameType {
        match self.0 & Self::FRAME_MASK {
            0x00 => FrameType::Cmd,
            0x40 => FrameType::Resp,
            0x80 => FrameType::Ack,
            _ => FrameType::Nack,
        }
    }

    /// Check if the sender asked for an acknowledgment
    pub fn ack_required(&self) -> bool {
        (self.0 & Self::ACK_REQUIRED) != 0
    }

    /// Set ack-required flag
    pub fn set_ack_required(&mut self, value: bool) {
        if value {
            self.0 |= Self::ACK_REQUIRED;
        } else {
            self.0 &= !Self::ACK_REQUIRED;
        }
    }

    /// Builder form of [`Control::set_ack_required`]
    pub fn with_ack_required(mut self) -> Self {
        self.set_ack_required(true);
        self
    }

    /// Get the raw byte value
    pub fn as_byte(&self) -> u8 {
        self.0
    }

    /// Create from raw byte
    pub fn from_byte(byte: u8) -> Self {
        Control(byte)
    }
}

/// Command codes
///
/// | Code | Command           | Range       |
/// |------|-------------------|-------------|
/// | 0x01 | HELLO             | network     |
/// | 0x02 | ROUTE_AD          | network     |
/// | 0x10 | PING              | application |
/// | 0x20 | GET_SENSOR_STATUS | application |
/// | 0x30 | SET_CONFIG        | application |
/// | 0x31 | GET_CONFIG        | application |
/// | 0x40 | UPDATE_RTC        | application |
/// | 0x41 | MODULE_CTRL       | application |
/// | 0x50 | GET_PARAM         | application |
/// | 0x51 | SET_PARAM         | application |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Neighbor presence announcement
    Hello,
    /// Distance-vector route advertisement
    RouteAd,
    /// Ping request
    Ping,
    /// Request current sensor readings
    GetSensorStatus,
    /// Set a configuration value
    SetConfig,
    /// Read a configuration value
    GetConfig,
    /// Set the real-time clock
    UpdateRtc,
    /// Stop or resume a module
    ModuleCtrl,
    /// Read a parameter by id
    GetParam,
    /// Write a parameter by id
    SetParam,
    /// Code outside the table; carried through untouched
    Unknown(u8),
}

impl Command {
    /// Create from byte value
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Command::Hello,
            0x02 => Command::RouteAd,
            0x10 => Command::Ping,
            0x20 => Command::GetSensorStatus,
            0x30 => Command::SetConfig,
            0x31 => Command::GetConfig,
            0x40 => Command::UpdateRtc,
            0x41 => Command::ModuleCtrl,
            0x50 => Command::GetParam,
            0x51 => Command::SetParam,
            other => Command::Unknown(other),
        }
    }

    /// Wire value
    pub fn as_byte(&self) -> u8 {
        match self {
            Command::Hello => 0x01,
            Command::RouteAd => 0x02,
            Command::Ping => 0x10,
            Command::GetSensorStatus => 0x20,
            Command::SetConfig => 0x30,
            Command::GetConfig => 0x31,
            Command::UpdateRtc => 0x40,
            Command::ModuleCtrl => 0x41,
            Command::GetParam => 0x50,
            Command::SetParam => 0x51,
            Command::Unknown(code) => *code,
        }
    }

    /// Parse a command by wire name (`GET_PARAM`) or numeric code (`0x50`, `80`)
    pub fn parse(text: &str) -> Option<Self> {
        let upper = text.trim().to_ascii_uppercase();
        let named = match upper.trim_start_matches("CMD_") {
            "HELLO" => Some(Command::Hello),
            "ROUTE_AD" => Some(Command::RouteAd),
            "PING" => Some(Command::Ping),
            "GET_SENSOR_STATUS" => Some(Command::GetSensorStatus),
            "SET_CONFIG" => Some(Command::SetConfig),
            "GET_CONFIG" => Some(Command::GetConfig),
            "UPDATE_RTC" => Some(Command::UpdateRtc),
            "MODULE_CTRL" => Some(Command::ModuleCtrl),
            "GET_PARAM" => Some(Command::GetParam),
            "SET_PARAM" => Some(Command::SetParam),
            _ => None,
        };
        named.or_else(|| {
            let code = match upper.strip_prefix("0X") {
                Some(hex) => u8::from_str_radix(hex, 16).ok()?,
                None => upper.parse().ok()?,
            };
            Some(Command::from_byte(code))
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Hello => "HELLO",
            Command::RouteAd => "ROUTE_AD",
            Command::Ping => "PING",
            Command::GetSensorStatus => "GET_SENSOR_STATUS",
            Command::SetConfig => "SET_CONFIG",
            Command::GetConfig => "GET_CONFIG",
            Command::UpdateRtc => "UPDATE_RTC",
            Command::ModuleCtrl => "MODULE_CTRL",
            Command::GetParam => "GET_PARAM",
            Command::SetParam => "SET_PARAM",
            Command::Unknown(code) => return write!(f, "0x{code:02x}"),
        };
        f.write_str(name)
    }
}

/// A decoded mesh frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Final destination (BROADCAST_ID for all nodes)
    pub dest: NodeId,
    /// Originating node
    pub src: NodeId,
    /// Frame type and option bits
    pub control: Control,
    /// Remaining hop budget
    pub ttl: u8,
    /// Command code
    pub command: Command,
    /// Opaque command-specific payload
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet from its fields
    pub fn new(
        dest: NodeId,
        src: NodeId,
        control: Control,
        ttl: u8,
        command: Command,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            dest,
            src,
            control,
            ttl,
            command,
            payload: payload.into(),
        }
    }

    /// Command frame with the initial hop budget
    pub fn command(dest: NodeId, src: NodeId, command: Command, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(dest, src, Control::CMD, INITIAL_TTL, command, payload)
    }

    /// Response frame with the initial hop budget
    pub fn response(dest: NodeId, src: NodeId, command: Command, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(dest, src, Control::RESP, INITIAL_TTL, command, payload)
    }

    /// Single-hop broadcast command (neighbor-only traffic)
    pub fn link_local(src: NodeId, command: Command, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(BROADCAST_ID, src, Control::CMD, 1, command, payload)
    }

    /// Check if this is a broadcast packet
    pub fn is_broadcast(&self) -> bool {
        self.dest == BROADCAST_ID
    }

    /// Whether `src` is necessarily the radio neighbor that sent this frame.
    ///
    /// Hello and route advertisements are never relayed, and a broadcast with
    /// a single hop of budget cannot have been forwarded either.
    pub fn is_link_local(&self) -> bool {
        matches!(self.command, Command::Hello | Command::RouteAd)
            || (self.is_broadcast() && self.ttl == 1)
    }

    /// Copy with one hop consumed, or `None` once the budget is spent
    pub fn forwarded(&self) -> Option<Self> {
        if self.ttl <= 1 {
            return None;
        }
        Some(Self {
            ttl: self.ttl - 1,
            ..self.clone()
        })
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(
            self.dest,
            self.src,
            self.control,
            self.ttl,
            self.command,
            &self.payload,
        )
    }

    /// Deserialize from wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Encode header fields and payload into a frame
pub fn encode(
    dest: NodeId,
    src: NodeId,
    control: Control,
    ttl: u8,
    command: Command,
    payload: &[u8],
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&[dest, src, control.as_byte(), ttl, command.as_byte()]);
    bytes.extend_from_slice(payload);
    bytes
}

/// Decode a frame; anything shorter than the header is rejected
pub fn decode(bytes: &[u8]) -> Result<Packet> {
    if bytes.len() < HEADER_SIZE {
        return Err(NodeError::InvalidPacket(format!(
            "{} bytes, header needs {}",
            bytes.len(),
            HEADER_SIZE
        )));
    }
    Ok(Packet {
        dest: bytes[0],
        src: bytes[1],
        control: Control::from_byte(bytes[2]),
        ttl: bytes[3],
        command: Command::from_byte(bytes[4]),
        payload: bytes[HEADER_SIZE..].to_vec(),
    })
}
