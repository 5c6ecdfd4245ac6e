//! Close codes and close-frame payloads (RFC 6455 Section 5.5.1, 7.4).
//!
//! - [`CloseCode`]: The standard status code registry
//! - [`parse_close_payload`]: Extract status code + reason from a close frame payload
//! - [`build_close_payload`]: Build a close frame payload from code + reason

use crate::error::{ProtocolViolation, WsError};
use crate::frame::{Frame, Opcode, MAX_CONTROL_PAYLOAD};

/// WebSocket close status codes per RFC 6455 Section 7.4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    Normal,
    GoingAway,
    ProtocolError,
    Unsupported,
    /// 1005: no status code present. Never sent on the wire.
    NoStatus,
    /// 1006: connection dropped without a close frame. Never sent on the wire.
    Abnormal,
    InvalidData,
    PolicyViolation,
    MessageTooBig,
    MandatoryExtension,
    InternalError,
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidData => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidData,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::InternalError,
            other => CloseCode::Other(other),
        }
    }

    /// Whether a peer may legally put this code in a close frame.
    ///
    /// 1000-1003 and 1007-1011 are defined for use; 3000-4999 are reserved
    /// for libraries and applications. Everything else is invalid.
    pub fn is_sendable(self) -> bool {
        matches!(self.as_u16(), 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

/// A decoded close frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: CloseCode,
    pub reason: String,
}

/// Parse a close frame payload into a [`CloseReason`].
///
/// An empty payload means "no status" (1005). A single byte is malformed,
/// codes outside the sendable ranges are rejected, and the reason must be
/// valid UTF-8.
pub fn parse_close_payload(payload: &[u8]) -> Result<CloseReason, WsError> {
    match payload.len() {
        0 => Ok(CloseReason {
            code: CloseCode::NoStatus,
            reason: String::new(),
        }),
        1 => Err(ProtocolViolation::TruncatedClosePayload.into()),
        _ => {
            let raw = u16::from_be_bytes([payload[0], payload[1]]);
            let code = CloseCode::from_u16(raw);
            if !code.is_sendable() {
                return Err(ProtocolViolation::InvalidCloseCode(raw).into());
            }
            let reason = std::str::from_utf8(&payload[2..]).map_err(|_| WsError::InvalidUtf8)?;
            Ok(CloseReason {
                code,
                reason: reason.to_string(),
            })
        }
    }
}

/// Build a close frame payload from a status code and reason string.
///
/// The reason is truncated on a character boundary so the payload stays
/// within the 125-byte control frame limit.
pub fn build_close_payload(code: CloseCode, reason: &str) -> Vec<u8> {
    let max_reason_len = MAX_CONTROL_PAYLOAD - 2;
    let mut end = reason.len().min(max_reason_len);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.as_u16().to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

/// A close frame carrying `code` and `reason`.
pub fn close_frame(code: CloseCode, reason: &str) -> Frame {
    Frame::new(Opcode::Close, build_close_payload(code, reason))
}
