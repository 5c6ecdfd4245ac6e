//! Application messages and fragment reassembly (RFC 6455 Section 5.4).
//!
//! Control frames are handled by the read loop before they reach the
//! [`Reassembler`]; only Text, Binary and Continuation frames are fed in.

use crate::error::{ProtocolViolation, WsError};
use crate::frame::{Frame, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

impl MessageKind {
    pub fn opcode(self) -> Opcode {
        match self {
            MessageKind::Text => Opcode::Text,
            MessageKind::Binary => Opcode::Binary,
        }
    }
}

/// A fully reassembled application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Message {
            kind: MessageKind::Text,
            payload: text.into().into_bytes(),
        }
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Message {
            kind: MessageKind::Binary,
            payload: data.into(),
        }
    }

    /// The payload as `&str` for text messages. Text payloads are validated
    /// on reassembly, so this only fails for binary messages.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Text => std::str::from_utf8(&self.payload).ok(),
            MessageKind::Binary => None,
        }
    }
}

/// Accumulates data frames until a message is complete.
#[derive(Debug)]
pub struct Reassembler {
    /// Kind of the first fragment. `None` when no message is in progress.
    kind: Option<MessageKind>,
    buffer: Vec<u8>,
    max_message_size: usize,
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Reassembler {
            kind: None,
            buffer: Vec::new(),
            max_message_size,
        }
    }

    pub fn is_assembling(&self) -> bool {
        self.kind.is_some()
    }

    /// Feed one data frame.
    ///
    /// Returns `Ok(Some(message))` when `frame` completes a message and
    /// `Ok(None)` while fragments are still accumulating. On error the
    /// in-progress message is discarded.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, WsError> {
        let result = self.push_inner(frame);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn push_inner(&mut self, frame: Frame) -> Result<Option<Message>, WsError> {
        let kind = match frame.opcode {
            Opcode::Text => Some(MessageKind::Text),
            Opcode::Binary => Some(MessageKind::Binary),
            Opcode::Continuation => None,
            // Control frames never reach the reassembler.
            other => return Err(ProtocolViolation::FragmentedControl(other).into()),
        };

        match (kind, self.kind) {
            (Some(_), Some(_)) => Err(ProtocolViolation::InterleavedMessage.into()),
            (None, None) => Err(ProtocolViolation::UnexpectedContinuation.into()),
            (Some(kind), None) => {
                self.check_size(frame.payload.len())?;
                if frame.fin {
                    return complete(kind, frame.payload).map(Some);
                }
                self.kind = Some(kind);
                self.buffer = frame.payload;
                Ok(None)
            }
            (None, Some(kind)) => {
                self.check_size(self.buffer.len() + frame.payload.len())?;
                self.buffer.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }
                let payload = std::mem::take(&mut self.buffer);
                self.kind = None;
                complete(kind, payload).map(Some)
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<(), WsError> {
        if size > self.max_message_size {
            return Err(WsError::MessageTooBig {
                size: size as u64,
                limit: self.max_message_size as u64,
            });
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.kind = None;
        self.buffer.clear();
    }
}

fn complete(kind: MessageKind, payload: Vec<u8>) -> Result<Message, WsError> {
    if kind == MessageKind::Text && std::str::from_utf8(&payload).is_err() {
        return Err(WsError::InvalidUtf8);
    }
    Ok(Message { kind, payload })
}
