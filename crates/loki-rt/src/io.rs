//! Exact-length binary I/O over byte streams.
//!
//! Every multi-byte read composes on [`read_exactly`], which either fills the
//! whole request or fails with [`WsError::EndOfStream`]. Short reads from a
//! socket are looped over; they are never returned to the caller.
//!
//! The `Endian` argument names the byte order of the bytes on the stream.
//! Reading little-endian-written bytes back as [`Endian::Big`] yields the
//! byte-swapped value, which is exactly how network byte order is recovered.

use std::io::{ErrorKind, Read, Write};

use crate::error::WsError;

/// Byte order of a multi-byte integer on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Map the `little_endian` flag used by callers that think in booleans.
    pub fn from_little(little_endian: bool) -> Self {
        if little_endian {
            Endian::Little
        } else {
            Endian::Big
        }
    }
}

/// Character encoding for [`write_string`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    /// 7-bit ASCII; characters outside the range are written as `?`.
    Ascii,
    Utf16Le,
}

const READ_CHUNK: usize = 64 * 1024;

/// Read exactly `n` bytes or fail.
///
/// `n == 0` returns an empty vector without touching the stream, even if
/// the stream is already exhausted.
///
/// The buffer grows as bytes arrive, so an `n` far beyond what the stream
/// holds fails with `EndOfStream` instead of allocating `n` up front.
pub fn read_exactly<R: Read + ?Sized>(n: usize, stream: &mut R) -> Result<Vec<u8>, WsError> {
    let mut buf = Vec::with_capacity(n.min(READ_CHUNK));
    while buf.len() < n {
        let start = buf.len();
        buf.resize(n.min(start.saturating_add(READ_CHUNK)), 0);
        match read_into(stream, &mut buf[start..]) {
            Ok(()) => {}
            Err(WsError::EndOfStream { read, .. }) => {
                return Err(WsError::EndOfStream {
                    expected: n,
                    read: start + read,
                })
            }
            Err(e) => return Err(e),
        }
    }
    Ok(buf)
}

/// Fill `buf` completely from `stream`.
pub fn read_into<R: Read + ?Sized>(stream: &mut R, buf: &mut [u8]) -> Result<(), WsError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(WsError::EndOfStream {
                    expected: buf.len(),
                    read: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn read_array<R: Read + ?Sized, const N: usize>(stream: &mut R) -> Result<[u8; N], WsError> {
    let mut buf = [0u8; N];
    read_into(stream, &mut buf)?;
    Ok(buf)
}

pub fn read_u16<R: Read + ?Sized>(stream: &mut R, endian: Endian) -> Result<u16, WsError> {
    let bytes = read_array::<_, 2>(stream)?;
    Ok(match endian {
        Endian::Little => u16::from_le_bytes(bytes),
        Endian::Big => u16::from_be_bytes(bytes),
    })
}

pub fn read_u64<R: Read + ?Sized>(stream: &mut R, endian: Endian) -> Result<u64, WsError> {
    let bytes = read_array::<_, 8>(stream)?;
    Ok(match endian {
        Endian::Little => u64::from_le_bytes(bytes),
        Endian::Big => u64::from_be_bytes(bytes),
    })
}

pub fn read_i64<R: Read + ?Sized>(stream: &mut R, endian: Endian) -> Result<i64, WsError> {
    let bytes = read_array::<_, 8>(stream)?;
    Ok(match endian {
        Endian::Little => i64::from_le_bytes(bytes),
        Endian::Big => i64::from_be_bytes(bytes),
    })
}

/// Write `s` in the requested encoding. No length prefix, no terminator.
pub fn write_string<W: Write + ?Sized>(
    s: &str,
    stream: &mut W,
    encoding: TextEncoding,
) -> Result<(), WsError> {
    match encoding {
        TextEncoding::Utf8 => stream.write_all(s.as_bytes())?,
        TextEncoding::Ascii => {
            let bytes: Vec<u8> = s
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect();
            stream.write_all(&bytes)?;
        }
        TextEncoding::Utf16Le => {
            let bytes: Vec<u8> = s.encode_utf16().flat_map(u16::to_le_bytes).collect();
            stream.write_all(&bytes)?;
        }
    }
    Ok(())
}

pub fn write_u16<W: Write + ?Sized>(value: u16, stream: &mut W, endian: Endian) -> Result<(), WsError> {
    let bytes = match endian {
        Endian::Little => value.to_le_bytes(),
        Endian::Big => value.to_be_bytes(),
    };
    stream.write_all(&bytes)?;
    Ok(())
}

pub fn write_u64<W: Write + ?Sized>(value: u64, stream: &mut W, endian: Endian) -> Result<(), WsError> {
    let bytes = match endian {
        Endian::Little => value.to_le_bytes(),
        Endian::Big => value.to_be_bytes(),
    };
    stream.write_all(&bytes)?;
    Ok(())
}

pub fn write_i64<W: Write + ?Sized>(value: i64, stream: &mut W, endian: Endian) -> Result<(), WsError> {
    let bytes = match endian {
        Endian::Little => value.to_le_bytes(),
        Endian::Big => value.to_be_bytes(),
    };
    stream.write_all(&bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    /// Yields at most one byte per `read` call.
    struct Trickle(Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let end = buf.len().min(1);
            self.0.read(&mut buf[..end])
        }
    }

    #[test]
    fn test_read_zero_bytes_from_empty_stream() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let bytes = read_exactly(0, &mut cursor).unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_read_exact_string() {
        let expected = "6f1c2a0e-4bd1-4c7e-9d43-0a5b3f0e9c11";
        let mut cursor = Cursor::new(expected.as_bytes().to_vec());
        let bytes = read_exactly(expected.len(), &mut cursor).unwrap();
        assert_eq!(bytes.len(), expected.len());
        assert_eq!(String::from_utf8(bytes).unwrap(), expected);
    }

    #[test]
    fn test_read_past_end_fails() {
        let data = b"abcdef".to_vec();
        let mut cursor = Cursor::new(data);
        match read_exactly(7, &mut cursor) {
            Err(WsError::EndOfStream { expected, read }) => {
                assert_eq!(expected, 7);
                assert_eq!(read, 6);
            }
            other => panic!("expected EndOfStream, got {:?}", other),
        }
    }

    #[test]
    fn test_huge_request_on_short_stream_is_end_of_stream() {
        let mut cursor = Cursor::new(b"abc".to_vec());
        match read_exactly(usize::MAX, &mut cursor) {
            Err(WsError::EndOfStream { expected, read }) => {
                assert_eq!(expected, usize::MAX);
                assert_eq!(read, 3);
            }
            other => panic!("expected EndOfStream, got {:?}", other),
        }
    }

    #[test]
    fn test_read_spanning_several_chunks() {
        let data: Vec<u8> = (0..READ_CHUNK * 2 + 17).map(|i| i as u8).collect();
        let mut cursor = Cursor::new(data.clone());
        assert_eq!(read_exactly(data.len(), &mut cursor).unwrap(), data);
    }

    #[test]
    fn test_short_reads_are_accumulated() {
        let mut stream = Trickle(Cursor::new(vec![1, 2, 3, 4, 5]));
        assert_eq!(read_exactly(5, &mut stream).unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_u16_little_endian() {
        let mut buf = Vec::new();
        write_u16(12345, &mut buf, Endian::Little).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_u16(&mut cursor, Endian::Little).unwrap(), 12345);
    }

    #[test]
    fn test_u16_big_endian_swaps_bytes() {
        let mut buf = Vec::new();
        write_u16(12345, &mut buf, Endian::Little).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_u16(&mut cursor, Endian::Big).unwrap(), 14640);
    }

    #[test]
    fn test_u64_big_endian_swaps_bytes() {
        let mut buf = Vec::new();
        write_u64(u64::MAX - 1, &mut buf, Endian::Little).unwrap();
        let mut cursor = Cursor::new(buf.clone());
        assert_eq!(read_u64(&mut cursor, Endian::Little).unwrap(), u64::MAX - 1);
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_u64(&mut cursor, Endian::Big).unwrap(),
            18374686479671623679
        );
    }

    #[test]
    fn test_i64_big_endian_swaps_bytes() {
        let mut buf = Vec::new();
        write_i64(i64::MAX - 1, &mut buf, Endian::Little).unwrap();
        let mut cursor = Cursor::new(buf.clone());
        assert_eq!(read_i64(&mut cursor, Endian::Little).unwrap(), i64::MAX - 1);
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_i64(&mut cursor, Endian::Big).unwrap(),
            -72057594037928065
        );
    }

    #[test]
    fn test_u64_written_big_endian_is_network_order() {
        let mut buf = Vec::new();
        write_u64(0x0102_0304_0506_0708, &mut buf, Endian::Big).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_u64(&mut cursor, Endian::Big).unwrap(),
            0x0102_0304_0506_0708
        );
    }

    #[test]
    fn test_write_string_encodings() {
        let mut buf = Vec::new();
        write_string("ASFLKSJDFLKJWEQRLKWEJR", &mut buf, TextEncoding::Utf8).unwrap();
        assert_eq!(buf, b"ASFLKSJDFLKJWEQRLKWEJR");

        let mut buf = Vec::new();
        write_string("naïve", &mut buf, TextEncoding::Ascii).unwrap();
        assert_eq!(buf, b"na?ve");

        let mut buf = Vec::new();
        write_string("hi", &mut buf, TextEncoding::Utf16Le).unwrap();
        assert_eq!(buf, vec![b'h', 0, b'i', 0]);
    }

    #[test]
    fn test_endian_from_flag() {
        assert_eq!(Endian::from_little(true), Endian::Little);
        assert_eq!(Endian::from_little(false), Endian::Big);
    }

    proptest! {
        #[test]
        fn test_u16_cross_endian_is_byte_swap(value: u16) {
            let mut buf = Vec::new();
            write_u16(value, &mut buf, Endian::Little).unwrap();
            let read = read_u16(&mut Cursor::new(buf), Endian::Big).unwrap();
            prop_assert_eq!(read, value.swap_bytes());
        }

        #[test]
        fn test_u64_cross_endian_is_byte_swap(value: u64) {
            let mut buf = Vec::new();
            write_u64(value, &mut buf, Endian::Little).unwrap();
            let read = read_u64(&mut Cursor::new(buf), Endian::Big).unwrap();
            prop_assert_eq!(read, value.swap_bytes());
        }

        #[test]
        fn test_i64_cross_endian_is_byte_swap(value: i64) {
            let mut buf = Vec::new();
            write_i64(value, &mut buf, Endian::Big).unwrap();
            let read = read_i64(&mut Cursor::new(buf), Endian::Little).unwrap();
            prop_assert_eq!(read, value.swap_bytes());
        }

        #[test]
        fn test_short_stream_always_fails(data in proptest::collection::vec(any::<u8>(), 0..64), extra in 1usize..32) {
            let n = data.len() + extra;
            let result = read_exactly(n, &mut Cursor::new(data));
            let is_eos = matches!(result, Err(WsError::EndOfStream { .. }));
            prop_assert!(is_eos);
        }
    }
}
