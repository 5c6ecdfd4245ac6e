//! Handshake authorization (RFC 6455 Section 4.2.1 - 4.2.2).
//!
//! An [`Authorizer`] inspects the upgrade request and either accepts it,
//! supplying the response headers for the `101 Switching Protocols` reply,
//! or rejects it with an HTTP status.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::http::HttpMetadata;

/// RFC 6455 magic GUID concatenated with the client key for Sec-WebSocket-Accept.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the `Sec-WebSocket-Accept` value per RFC 6455 Section 4.2.2.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Why a handshake was refused, and the HTTP status to answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub reason: String,
}

impl Rejection {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Rejection {
            status: 400,
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Rejection {
            status: 403,
            reason: reason.into(),
        }
    }

    pub fn not_found(route: &str) -> Self {
        Rejection {
            status: 404,
            reason: format!("no handler for route {route}"),
        }
    }

    pub fn status_text(&self) -> &'static str {
        match self.status {
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            426 => "Upgrade Required",
            _ => "Error",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status, self.status_text(), self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeDecision {
    /// Upgrade, sending these headers with the 101 response.
    Accept(Vec<(String, String)>),
    Reject(Rejection),
}

/// Decides whether an upgrade request may become a connection.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, request: &dyn HttpMetadata) -> HandshakeDecision;
}

/// Standard RFC 6455 validation with an optional Origin allow-list.
#[derive(Debug, Clone, Default)]
pub struct Rfc6455Authorizer {
    allowed_origins: Vec<String>,
}

impl Rfc6455Authorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept requests whose `Origin` header is in `origins`.
    /// An empty list accepts any origin, including none.
    pub fn with_allowed_origins(origins: Vec<String>) -> Self {
        Rfc6455Authorizer {
            allowed_origins: origins,
        }
    }

    fn validate(&self, request: &dyn HttpMetadata) -> Result<String, Rejection> {
        match request.header("upgrade") {
            Some(v) if has_token(v, "websocket") => {}
            _ => return Err(Rejection::bad_request("missing or invalid Upgrade header")),
        }
        match request.header("connection") {
            Some(v) if has_token(v, "upgrade") => {}
            _ => return Err(Rejection::bad_request("missing or invalid Connection header")),
        }
        let key = match request.header("sec-websocket-key") {
            Some(key) => key.trim(),
            None => return Err(Rejection::bad_request("missing Sec-WebSocket-Key header")),
        };
        match BASE64.decode(key) {
            Ok(nonce) if nonce.len() == 16 => {}
            _ => return Err(Rejection::bad_request("Sec-WebSocket-Key is not a 16-byte nonce")),
        }
        match request.header("sec-websocket-version") {
            Some("13") => {}
            _ => {
                return Err(Rejection::bad_request(
                    "missing or invalid Sec-WebSocket-Version (must be 13)",
                ))
            }
        }
        if !self.allowed_origins.is_empty() {
            let origin = request.header("origin").unwrap_or_default();
            if !self.allowed_origins.iter().any(|o| o.eq_ignore_ascii_case(origin)) {
                return Err(Rejection::forbidden(format!("origin {origin:?} not allowed")));
            }
        }
        Ok(key.to_string())
    }
}

impl Authorizer for Rfc6455Authorizer {
    fn authorize(&self, request: &dyn HttpMetadata) -> HandshakeDecision {
        match self.validate(request) {
            Ok(key) => HandshakeDecision::Accept(vec![
                ("Upgrade".to_string(), "websocket".to_string()),
                ("Connection".to_string(), "Upgrade".to_string()),
                ("Sec-WebSocket-Accept".to_string(), compute_accept_key(&key)),
            ]),
            Err(rejection) => HandshakeDecision::Reject(rejection),
        }
    }
}

/// Case-insensitive membership in a comma-separated token list.
fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}
