//! HTTP request metadata for the opening handshake.
//!
//! The engine only ever looks at a request through [`HttpMetadata`]. The
//! default provider, [`HttpRequest`], reads the request head straight off
//! the socket one byte at a time so nothing after the blank line is
//! consumed: a client may pipeline its first frame right behind the
//! upgrade request.

use std::io::{self, Read};
use std::time::Instant;

use percent_encoding::percent_decode_str;
use rustc_hash::FxHashMap;

use crate::error::WsError;
use crate::transport::Socket;

/// Read-only view of an upgrade request.
pub trait HttpMetadata {
    /// Header values keyed by lower-cased name. Repeated headers are
    /// joined with `", "`.
    fn headers(&self) -> &FxHashMap<String, String>;

    /// Decoded query parameters. A key may carry several values.
    fn query_strings(&self) -> &FxHashMap<String, Vec<String>>;

    /// The requested path without the query string.
    fn route(&self) -> &str;

    /// Whether the request line and headers were structurally sound.
    fn is_valid(&self) -> bool;

    fn header(&self, name: &str) -> Option<&str> {
        self.headers()
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn query(&self, key: &str) -> Option<&str> {
        self.query_strings()
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    route: String,
    headers: FxHashMap<String, String>,
    query: FxHashMap<String, Vec<String>>,
    valid: bool,
}

impl HttpRequest {
    /// Read a request head (through the terminating blank line) from
    /// `stream`, consuming at most `max_bytes`.
    ///
    /// I/O failures and a head that exceeds `max_bytes` are errors. A head
    /// that arrives intact but is malformed yields a request with
    /// `is_valid() == false`.
    pub fn read_from<R: Read + ?Sized>(stream: &mut R, max_bytes: usize) -> Result<Self, WsError> {
        let head = read_head(stream, max_bytes)?;
        Ok(Self::parse(&head))
    }

    /// Like [`HttpRequest::read_from`], but the whole head must arrive
    /// before `deadline`. The socket's read timeout is narrowed to the time
    /// left before every read, so a client trickling bytes cannot stretch
    /// the handshake.
    pub fn read_before<S: Socket + ?Sized>(
        socket: &mut S,
        max_bytes: usize,
        deadline: Instant,
    ) -> Result<Self, WsError> {
        let head = read_head_with(socket, max_bytes, |socket| {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "handshake deadline passed").into());
            }
            socket.set_read_timeout(Some(left))?;
            Ok(())
        })?;
        Ok(Self::parse(&head))
    }

    /// Parse a request head. Never fails; malformed input is reported by
    /// [`HttpMetadata::is_valid`].
    pub fn parse(head: &[u8]) -> Self {
        let mut request = HttpRequest::default();
        let Ok(text) = std::str::from_utf8(head) else {
            return request;
        };

        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let parts: Vec<&str> = request_line.split(' ').collect();
        if parts.len() != 3 {
            return request;
        }
        request.method = parts[0].to_string();
        request.target = parts[1].to_string();
        request.version = parts[2].to_string();

        let (path, query) = match request.target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (request.target.as_str(), None),
        };
        request.route = percent_decode_str(path).decode_utf8_lossy().into_owned();
        if let Some(query) = query {
            request.query = parse_query(query);
        }

        let mut headers_ok = true;
        for line in lines.filter(|line| !line.is_empty()) {
            match line.split_once(':') {
                Some((name, value)) if !name.trim().is_empty() => {
                    let name = name.trim().to_ascii_lowercase();
                    let value = value.trim();
                    request
                        .headers
                        .entry(name)
                        .and_modify(|existing| {
                            existing.push_str(", ");
                            existing.push_str(value);
                        })
                        .or_insert_with(|| value.to_string());
                }
                _ => headers_ok = false,
            }
        }

        request.valid = headers_ok
            && request.method.eq_ignore_ascii_case("GET")
            && request.version == "HTTP/1.1"
            && request.route.starts_with('/')
            && request.headers.contains_key("host");
        request
    }
}

impl HttpMetadata for HttpRequest {
    fn headers(&self) -> &FxHashMap<String, String> {
        &self.headers
    }

    fn query_strings(&self) -> &FxHashMap<String, Vec<String>> {
        &self.query
    }

    fn route(&self) -> &str {
        &self.route
    }

    fn is_valid(&self) -> bool {
        self.valid
    }
}

fn read_head<R: Read + ?Sized>(stream: &mut R, max_bytes: usize) -> Result<Vec<u8>, WsError> {
    read_head_with(stream, max_bytes, |_| Ok(()))
}

/// Read the head byte by byte, calling `before_read` ahead of each read.
fn read_head_with<R, F>(stream: &mut R, max_bytes: usize, mut before_read: F) -> Result<Vec<u8>, WsError>
where
    R: Read + ?Sized,
    F: FnMut(&mut R) -> Result<(), WsError>,
{
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= max_bytes {
            return Err(WsError::MessageTooBig {
                size: head.len() as u64 + 1,
                limit: max_bytes as u64,
            });
        }
        before_read(stream)?;
        crate::io::read_into(stream, &mut byte)?;
        head.push(byte[0]);
    }
    head.truncate(head.len() - 4);
    Ok(head)
}

fn parse_query(query: &str) -> FxHashMap<String, Vec<String>> {
    let mut params: FxHashMap<String, Vec<String>> = FxHashMap::default();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(decode_component(key))
            .or_default()
            .push(decode_component(value));
    }
    params
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}
