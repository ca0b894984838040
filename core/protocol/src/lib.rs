//! Wire protocol types for the Discord presence host IPC channel.
//!
//! This crate is shared by the sync engine and its tests to prevent schema
//! drift. Frames are an 8-byte little-endian header (opcode, payload length)
//! followed by a JSON payload. The host remains the authority on validation,
//! but clients reuse the same types to construct well-formed frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Handshake protocol version expected by the presence host.
pub const HANDSHAKE_VERSION: u32 = 1;
/// Upper bound on a single frame payload. The host never sends anything
/// close to this; anything larger is treated as a corrupt stream.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
pub const FRAME_HEADER_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Handshake = 0,
    Frame = 1,
    Close = 2,
    Ping = 3,
    Pong = 4,
}

impl Opcode {
    pub fn from_wire(raw: u32) -> Result<Self, WireError> {
        match raw {
            0 => Ok(Opcode::Handshake),
            1 => Ok(Opcode::Frame),
            2 => Ok(Opcode::Close),
            3 => Ok(Opcode::Ping),
            4 => Ok(Opcode::Pong),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),

    #[error("frame payload of {0} bytes exceeds the frame size limit")]
    Oversized(usize),

    #[error("frame payload was not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a JSON payload into a single wire frame.
pub fn encode_frame<T: Serialize>(opcode: Opcode, payload: &T) -> Result<Vec<u8>, WireError> {
    let body = serde_json::to_vec(payload)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(WireError::Oversized(body.len()));
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_BYTES + body.len());
    out.extend_from_slice(&(opcode as u32).to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parses a frame header, returning the opcode and payload length.
pub fn decode_header(header: [u8; FRAME_HEADER_BYTES]) -> Result<(Opcode, usize), WireError> {
    let opcode = Opcode::from_wire(u32::from_le_bytes([
        header[0], header[1], header[2], header[3],
    ]))?;
    let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if length > MAX_FRAME_BYTES {
        return Err(WireError::Oversized(length));
    }
    Ok((opcode, length))
}

/// Opening payload sent with [`Opcode::Handshake`].
#[derive(Debug, Serialize, Deserialize)]
pub struct Handshake {
    pub v: u32,
    pub client_id: String,
}

impl Handshake {
    pub fn new(client_id: &str) -> Self {
        Self {
            v: HANDSHAKE_VERSION,
            client_id: client_id.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    SetActivity,
}

/// A client command carried in an [`Opcode::Frame`] frame.
#[derive(Debug, Serialize, Deserialize)]
pub struct Command {
    pub cmd: CommandKind,
    pub args: Value,
    pub nonce: String,
}

impl Command {
    pub fn set_activity(pid: u32, activity: &Activity, nonce: String) -> Result<Self, WireError> {
        Ok(Self {
            cmd: CommandKind::SetActivity,
            args: serde_json::json!({
                "pid": pid,
                "activity": serde_json::to_value(activity)?,
            }),
            nonce,
        })
    }

    /// Clearing presence is `SET_ACTIVITY` with the activity left out; the
    /// host interprets the absence as "no status".
    pub fn clear_activity(pid: u32, nonce: String) -> Self {
        Self {
            cmd: CommandKind::SetActivity,
            args: serde_json::json!({ "pid": pid }),
            nonce,
        }
    }
}

/// Any frame-level message received from the host.
#[derive(Debug, Deserialize)]
pub struct HostFrame {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub evt: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl HostFrame {
    pub fn is_ready(&self) -> bool {
        self.evt.as_deref() == Some("READY")
    }

    pub fn is_error(&self) -> bool {
        self.evt.as_deref() == Some("ERROR")
    }

    pub fn error_message(&self) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|data| data.get("message"))
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
    }
}

/// Payload of an [`Opcode::Close`] frame.
#[derive(Debug, Deserialize)]
pub struct CloseReason {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// The status object pushed to the presence host.
///
/// Optional fields are omitted from the serialized payload entirely; the
/// host treats absence as "not set" and rejects explicit nulls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Activity {
    pub details: String,
    pub state: String,
    pub timestamps: Timestamps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<Assets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buttons: Option<Vec<Button>>,
    pub instance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timestamps {
    pub start: i64,
}

impl Timestamps {
    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: start.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_text: Option<String>,
}

impl Assets {
    pub fn is_empty(&self) -> bool {
        self.large_image.is_none()
            && self.large_text.is_none()
            && self.small_image.is_none()
            && self.small_text.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub url: String,
}
