//! Server side of the opening handshake (RFC 6455 Section 4.2).
//!
//! - [`accept`]: Main entry point -- reads the request, resolves the route,
//!   authorizes, writes the response and returns an open connection
//! - [`upgrade_response`]: Builds the 101 Switching Protocols response
//! - [`write_rejection`]: Writes a 4xx response for a refused upgrade

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::WsError;
use crate::http::{HttpMetadata, HttpRequest};
use crate::route::{MessageHandler, RouteTable};
use crate::security::{Authorizer, HandshakeDecision, Rejection};
use crate::transport::Socket;

/// Header consulted for the client identifier when the query has none.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// A connection that completed its handshake and is `Open`.
pub struct Accepted {
    pub connection: Arc<Connection>,
    /// Read half for [`Connection::run`].
    pub reader: Box<dyn Socket>,
    pub handler: Arc<dyn MessageHandler>,
}

/// Build the `101 Switching Protocols` response.
pub fn upgrade_response(headers: &[(String, String)]) -> String {
    let mut response = String::from("HTTP/1.1 101 Switching Protocols\r\n");
    for (name, value) in headers {
        response.push_str(name);
        response.push_str(": ");
        response.push_str(value);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response
}

/// Write a plain-text 4xx response for `rejection`.
pub fn write_rejection<W: Write + ?Sized>(stream: &mut W, rejection: &Rejection) -> std::io::Result<()> {
    let body = format!("{}: {}", rejection.status_text(), rejection.reason);
    let mut response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n",
        rejection.status,
        rejection.status_text(),
        body.len()
    );
    if rejection.status == 400 {
        response.push_str("Sec-WebSocket-Version: 13\r\n");
    }
    response.push_str("\r\n");
    response.push_str(&body);
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

/// The client identifier: the configured query parameter, else the
/// `x-client-id` header, else a name derived from the connection id.
pub fn resolve_client_id(request: &dyn HttpMetadata, param: &str, id: ConnectionId) -> String {
    request
        .query(param)
        .or_else(|| request.header(CLIENT_ID_HEADER))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("conn-{id}"))
}

/// Run the opening handshake on a freshly accepted socket.
///
/// On success the returned connection is `Open` and nothing beyond the
/// request head has been read from the socket. On failure the peer has
/// been sent a 4xx response where one applies and the socket is shut down;
/// the connection never reaches `Open`.
pub fn accept(
    mut socket: Box<dyn Socket>,
    routes: &RouteTable,
    authorizer: &dyn Authorizer,
    config: &ServerConfig,
) -> Result<Accepted, WsError> {
    let result = negotiate(&mut socket, routes, authorizer, config);
    if result.is_err() {
        let _ = socket.shutdown();
    }
    let (connection, handler) = result?;
    socket.set_read_timeout(None)?;
    Ok(Accepted {
        connection,
        reader: socket,
        handler,
    })
}

fn negotiate(
    socket: &mut Box<dyn Socket>,
    routes: &RouteTable,
    authorizer: &dyn Authorizer,
    config: &ServerConfig,
) -> Result<(Arc<Connection>, Arc<dyn MessageHandler>), WsError> {
    let deadline = Instant::now() + config.handshake_timeout();
    let request = match HttpRequest::read_before(&mut **socket, config.max_handshake_bytes, deadline) {
        Ok(request) => request,
        Err(WsError::MessageTooBig { .. }) => {
            return reject(socket, Rejection::bad_request("request head too large"));
        }
        Err(e) => return Err(e),
    };
    if !request.is_valid() {
        return reject(socket, Rejection::bad_request("malformed upgrade request"));
    }

    let Some(handler) = routes.resolve(request.route()) else {
        return reject(socket, Rejection::not_found(request.route()));
    };

    let headers = match authorizer.authorize(&request) {
        HandshakeDecision::Accept(headers) => headers,
        HandshakeDecision::Reject(rejection) => return reject(socket, rejection),
    };

    let id = ConnectionId::next();
    let client_id = resolve_client_id(&request, &config.client_id_param, id);
    let connection = Connection::new(
        id,
        client_id,
        request.route(),
        &**socket,
        config.connection_limits(),
    )?;

    connection.write_raw(upgrade_response(&headers).as_bytes())?;
    connection.mark_open();
    info!(
        conn_id = %id,
        client_id = %connection.client_id(),
        route = %connection.route(),
        peer = ?connection.peer_addr(),
        "connection opened"
    );
    Ok((Arc::new(connection), handler))
}

fn reject<T>(socket: &mut Box<dyn Socket>, rejection: Rejection) -> Result<T, WsError> {
    info!(status = rejection.status, reason = %rejection.reason, "handshake rejected");
    if let Err(e) = write_rejection(socket, &rejection) {
        debug!(error = %e, "failed to write handshake rejection");
    }
    Err(WsError::HandshakeRejected(rejection))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::message::Message;
    use crate::registry::Registry;
    use crate::security::Rfc6455Authorizer;
    use crate::transport::MemorySocket;

    fn routes() -> RouteTable {
        RouteTable::new().route("/chat", |_: &Arc<Connection>, _: &Registry, _: Message| {})
    }

    fn request(target: &str, extra: &str) -> String {
        format!(
            "GET {target} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\
             {extra}\r\n"
        )
    }

    fn run(input: &str) -> (Result<Accepted, WsError>, MemorySocket) {
        let socket = MemorySocket::new();
        socket.feed(input.as_bytes());
        let result = accept(
            Box::new(socket.clone()),
            &routes(),
            &Rfc6455Authorizer::new(),
            &ServerConfig::default(),
        );
        (result, socket)
    }

    fn response(socket: &MemorySocket) -> String {
        String::from_utf8(socket.written()).unwrap()
    }

    #[test]
    fn test_successful_upgrade() {
        let (result, socket) = run(&request("/chat?clientId=alice", ""));
        let accepted = result.unwrap();
        assert_eq!(accepted.connection.state(), ConnectionState::Open);
        assert_eq!(accepted.connection.client_id(), "alice");
        assert_eq!(accepted.connection.route(), "/chat");

        let response = response(&socket);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
        assert!(!socket.is_shutdown());
    }

    #[test]
    fn test_client_id_falls_back_to_header_then_connection_id() {
        let (result, _) = run(&request("/chat", "X-Client-Id: bob\r\n"));
        assert_eq!(result.unwrap().connection.client_id(), "bob");

        let (result, _) = run(&request("/chat", ""));
        let conn = result.unwrap().connection;
        assert_eq!(conn.client_id(), format!("conn-{}", conn.id()));
    }

    #[test]
    fn test_pipelined_frame_is_left_for_the_reader() {
        let mut input = request("/chat", "").into_bytes();
        input.extend_from_slice(&[0x81, 0x80, 0, 0, 0, 0]);
        let socket = MemorySocket::with_input(&input);
        let accepted = accept(
            Box::new(socket.clone()),
            &routes(),
            &Rfc6455Authorizer::new(),
            &ServerConfig::default(),
        )
        .unwrap();

        let mut delivered = Vec::new();
        accepted.connection.run(accepted.reader, |m| delivered.push(m));
        assert_eq!(delivered, vec![Message::text("")]);
    }

    #[test]
    fn test_unknown_route_is_404() {
        let (result, socket) = run(&request("/nope", ""));
        match result {
            Err(WsError::HandshakeRejected(r)) => assert_eq!(r.status, 404),
            Err(e) => panic!("expected rejection, got {e:?}"),
            Ok(_) => panic!("expected rejection"),
        }
        assert!(response(&socket).starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(socket.is_shutdown());
    }

    #[test]
    fn test_missing_key_is_400() {
        let input = "GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                     Sec-WebSocket-Version: 13\r\n\r\n";
        let (result, socket) = run(input);
        assert!(matches!(
            result,
            Err(WsError::HandshakeRejected(Rejection { status: 400, .. }))
        ));
        let response = response(&socket);
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("Sec-WebSocket-Key"));
    }

    #[test]
    fn test_malformed_request_is_400() {
        let (result, _) = run("BREW /pot HTCPCP/1.0\r\n\r\n");
        assert!(matches!(
            result,
            Err(WsError::HandshakeRejected(Rejection { status: 400, .. }))
        ));
    }

    #[test]
    fn test_slow_client_times_out() {
        let config = ServerConfig {
            handshake_timeout_ms: 30,
            ..ServerConfig::default()
        };
        let socket = MemorySocket::new();
        socket.feed(b"GET /chat HTTP/1.1\r\n");
        let result = accept(
            Box::new(socket.clone()),
            &routes(),
            &Rfc6455Authorizer::new(),
            &config,
        );
        assert!(matches!(result, Err(ref e) if e.is_timeout()));
        assert!(socket.is_shutdown());
        assert!(socket.written().is_empty());
    }

    #[test]
    fn test_trickling_client_hits_the_handshake_deadline() {
        let config = ServerConfig {
            handshake_timeout_ms: 100,
            ..ServerConfig::default()
        };
        let socket = MemorySocket::new();
        let feeder = socket.clone();
        let input = request("/chat", "");
        let trickle = std::thread::spawn(move || {
            // Each gap stays well inside the timeout.
            for byte in input.bytes() {
                if feeder.is_shutdown() {
                    break;
                }
                feeder.feed(&[byte]);
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
        });

        let started = Instant::now();
        let result = accept(
            Box::new(socket.clone()),
            &routes(),
            &Rfc6455Authorizer::new(),
            &config,
        );
        let elapsed = started.elapsed();
        trickle.join().unwrap();

        assert!(matches!(result, Err(ref e) if e.is_timeout()));
        assert!(elapsed < std::time::Duration::from_secs(1), "took {elapsed:?}");
        assert!(socket.is_shutdown());
        assert!(socket.written().is_empty());
    }
}
