//! WebSocket frame codec (RFC 6455 Section 5.2-5.3).
//!
//! Frames are the smallest unit on the wire. The codec is stateless: it
//! turns bytes from a stream into a [`Frame`] and a [`Frame`] back into
//! bytes. Sequencing rules that span frames (fragment reassembly, close
//! handshake) live in [`crate::message`] and [`crate::connection`].
//!
//! - [`decode_frame`]: Parse one frame from a byte stream (handles masking)
//! - [`encode_frame`]: Serialize an unmasked server frame
//! - [`apply_mask`]: Symmetric XOR masking per RFC 6455 Section 5.3
//! - [`fragment`]: Split an outbound message into continuation frames

use std::io::{Read, Write};

use crate::error::{ProtocolViolation, WsError};
use crate::io::{read_exactly, read_into, read_u16, read_u64, Endian};

/// Control frames carry at most this many payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame opcodes per RFC 6455 Section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Parse a 4-bit opcode value. Reserved values are a protocol violation.
    pub fn from_u8(byte: u8) -> Result<Opcode, ProtocolViolation> {
        match byte {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(ProtocolViolation::UnknownOpcode(other)),
        }
    }

    /// Close, ping and pong.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// A single wire frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// `true` if this is the final fragment of a message.
    pub fin: bool,
    pub opcode: Opcode,
    /// Whether the frame arrived masked. Informational once decoded.
    pub masked: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A final, unmasked frame.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Frame {
            fin: true,
            opcode,
            masked: false,
            payload: payload.into(),
        }
    }

    pub fn text(text: &str) -> Self {
        Frame::new(Opcode::Text, text.as_bytes())
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Frame::new(Opcode::Binary, data)
    }

    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Frame::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Frame::new(Opcode::Pong, payload)
    }
}

/// Apply or remove the 4-byte XOR mask on a payload.
///
/// The operation is symmetric: applying the mask twice returns the original.
pub fn apply_mask(payload: &mut [u8], mask_key: &[u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Append the 7-bit length field (with `mask_bit` OR-ed in) and any
/// extended length, choosing the shortest legal form.
pub fn encode_length(len: u64, mask_bit: u8, out: &mut Vec<u8>) {
    if len <= MAX_CONTROL_PAYLOAD as u64 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as u64 {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&len.to_be_bytes());
    }
}

/// Resolve the payload length from the 7-bit field, reading the extended
/// length if present. Non-minimal encodings are rejected.
pub fn decode_length<R: Read + ?Sized>(len7: u8, reader: &mut R) -> Result<u64, WsError> {
    match len7 & 0x7F {
        126 => {
            let len = read_u16(reader, Endian::Big)? as u64;
            if len < 126 {
                return Err(ProtocolViolation::NonMinimalLength { length: len, width: 16 }.into());
            }
            Ok(len)
        }
        127 => {
            let len = read_u64(reader, Endian::Big)?;
            if len >> 63 != 0 {
                return Err(ProtocolViolation::LengthMsbSet.into());
            }
            if len <= u16::MAX as u64 {
                return Err(ProtocolViolation::NonMinimalLength { length: len, width: 64 }.into());
            }
            Ok(len)
        }
        short => Ok(short as u64),
    }
}

/// Parse one frame from the stream.
///
/// Reads the 2-byte header, the extended length, the masking key and the
/// payload, in that order, each with an exact read. Frames larger than
/// `max_frame_size` are refused before any payload allocation.
pub fn decode_frame<R: Read + ?Sized>(reader: &mut R, max_frame_size: u64) -> Result<Frame, WsError> {
    // Byte 0: FIN(1) RSV(3) Opcode(4)
    // Byte 1: MASK(1) Payload-Length(7)
    let mut header = [0u8; 2];
    read_into(reader, &mut header)?;

    let fin = header[0] & 0x80 != 0;
    let rsv = (header[0] >> 4) & 0x07;
    if rsv != 0 {
        return Err(ProtocolViolation::ReservedBits(rsv).into());
    }
    let opcode = Opcode::from_u8(header[0] & 0x0F)?;
    if opcode.is_control() && !fin {
        return Err(ProtocolViolation::FragmentedControl(opcode).into());
    }

    let masked = header[1] & 0x80 != 0;
    let payload_len = decode_length(header[1], reader)?;

    if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
        return Err(ProtocolViolation::ControlPayloadTooLarge(payload_len).into());
    }
    if payload_len > max_frame_size {
        return Err(WsError::MessageTooBig {
            size: payload_len,
            limit: max_frame_size,
        });
    }

    let mask_key = if masked {
        let mut key = [0u8; 4];
        read_into(reader, &mut key)?;
        Some(key)
    } else {
        None
    };

    let mut payload = read_exactly(payload_len as usize, reader)?;
    if let Some(key) = mask_key {
        apply_mask(&mut payload, &key);
    }

    Ok(Frame {
        fin,
        opcode,
        masked,
        payload,
    })
}

fn encode_with(frame: &Frame, mask_key: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.payload.len() + 14);
    out.push(if frame.fin { 0x80 } else { 0x00 } | frame.opcode as u8);
    let mask_bit = if mask_key.is_some() { 0x80 } else { 0x00 };
    encode_length(frame.payload.len() as u64, mask_bit, &mut out);
    match mask_key {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(&frame.payload);
            apply_mask(&mut out[start..], &key);
        }
        None => out.extend_from_slice(&frame.payload),
    }
    out
}

/// Serialize a server-to-client frame. Servers never mask (RFC 6455 Section 5.1).
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    encode_with(frame, None)
}

/// Serialize a frame the way a client must send it, masked with `mask_key`.
pub fn encode_masked(frame: &Frame, mask_key: [u8; 4]) -> Vec<u8> {
    encode_with(frame, Some(mask_key))
}

/// Encode and write a frame in a single `write_all`, then flush.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, frame: &Frame) -> Result<(), WsError> {
    writer.write_all(&encode_frame(frame))?;
    writer.flush()?;
    Ok(())
}

/// Split a message into frames of at most `max_fragment` payload bytes.
///
/// The first frame carries `opcode`, later frames carry
/// [`Opcode::Continuation`], and only the last has `fin` set. An empty
/// payload (or a zero fragment size) yields one unfragmented frame.
pub fn fragment(opcode: Opcode, payload: &[u8], max_fragment: usize) -> Vec<Frame> {
    if payload.len() <= max_fragment || max_fragment == 0 {
        return vec![Frame::new(opcode, payload)];
    }
    let chunks: Vec<&[u8]> = payload.chunks(max_fragment).collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Frame {
            fin: i == last,
            opcode: if i == 0 { opcode } else { Opcode::Continuation },
            masked: false,
            payload: chunk.to_vec(),
        })
        .collect()
}
