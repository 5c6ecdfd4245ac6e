//! Error taxonomy for the WebSocket engine.
//!
//! Every per-connection failure is a [`WsError`]. Errors never cross
//! connection boundaries: the owning read loop maps them to a close code
//! (see [`WsError::close_code`]) and tears its own connection down.

use std::io;

use thiserror::Error;

use crate::close::CloseCode;
use crate::connection::ConnectionState;
use crate::frame::Opcode;
use crate::security::Rejection;

/// Errors produced by the I/O primitives, the frame codec and the
/// connection state machine.
#[derive(Debug, Error)]
pub enum WsError {
    /// The stream ended before an exact read could be satisfied.
    #[error("end of stream: expected {expected} bytes, got {read}")]
    EndOfStream { expected: usize, read: usize },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Structurally invalid frame or frame sequence.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// The opening handshake was refused; the connection never opened.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(Rejection),

    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooBig { size: u64, limit: u64 },

    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("connection is not open (state: {0:?})")]
    NotOpen(ConnectionState),
}

impl WsError {
    /// The close code reported to the peer (or recorded locally) for this
    /// failure.
    pub fn close_code(&self) -> CloseCode {
        match self {
            WsError::Protocol(_) => CloseCode::ProtocolError,
            WsError::InvalidUtf8 => CloseCode::InvalidData,
            WsError::MessageTooBig { .. } => CloseCode::MessageTooBig,
            WsError::HandshakeRejected(_) => CloseCode::PolicyViolation,
            WsError::NotOpen(_) => CloseCode::Normal,
            WsError::EndOfStream { .. } | WsError::Io(_) => CloseCode::Abnormal,
        }
    }

    /// True for read timeouts surfaced by a socket with a read deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            WsError::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

/// The specific way a peer broke the framing rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("reserved bits 0x{0:X} set without a negotiated extension")]
    ReservedBits(u8),

    #[error("unknown opcode 0x{0:X}")]
    UnknownOpcode(u8),

    #[error("control frame {0:?} must not be fragmented")]
    FragmentedControl(Opcode),

    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlPayloadTooLarge(u64),

    #[error("length {length} not minimally encoded in {width}-bit form")]
    NonMinimalLength { length: u64, width: u8 },

    #[error("most significant bit of 64-bit length is set")]
    LengthMsbSet,

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("new data frame while a fragmented message is in progress")]
    InterleavedMessage,

    #[error("close payload of 1 byte")]
    TruncatedClosePayload,

    #[error("close code {0} may not be sent on the wire")]
    InvalidCloseCode(u16),
}
