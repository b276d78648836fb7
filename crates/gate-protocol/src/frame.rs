//! Binary frames written by the gateway.
//!
//! Every frame starts with a one-byte [`Protocol`] opcode:
//!
//! ```text
//! JOIN_ROOM  [10][utf-8 room id]
//! ERROR      [11][code: i32 little-endian][utf-8 message]
//! ```
//!
//! Payloads relayed on behalf of rooms are written as-is and never carry an
//! opcode added by the gateway.

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    JoinRoom = 10,
    Error = 11,
}

impl Protocol {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            10 => Some(Self::JoinRoom),
            11 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Encode an error frame carrying `{code, message}`.
pub fn encode_error_frame(code: i32, message: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + message.len());
    frame.push(Protocol::Error as u8);
    frame.extend_from_slice(&code.to_le_bytes());
    frame.extend_from_slice(message.as_bytes());
    frame
}

/// Decode an error frame. Returns `None` for other opcodes or truncated frames.
pub fn decode_error_frame(frame: &[u8]) -> Option<(i32, String)> {
    let (&opcode, rest) = frame.split_first()?;
    if Protocol::from_byte(opcode) != Some(Protocol::Error) || rest.len() < 4 {
        return None;
    }
    let (code, message) = rest.split_at(4);
    let code = i32::from_le_bytes(code.try_into().ok()?);
    Some((code, String::from_utf8_lossy(message).into_owned()))
}

/// Encode the frame a room sends once a client has joined.
pub fn encode_join_frame(room_id: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + room_id.len());
    frame.push(Protocol::JoinRoom as u8);
    frame.extend_from_slice(room_id.as_bytes());
    frame
}
