//! Loki: a server-side WebSocket engine (RFC 6455).
//!
//! Accepted sockets go through the opening handshake, become
//! [`Connection`]s tracked by a [`Registry`], and run a per-connection
//! read loop that decodes frames, answers control frames and hands
//! reassembled [`Message`]s to the handler resolved from the
//! [`RouteTable`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use loki_rt::{Connection, Message, Registry, RouteTable, Rfc6455Authorizer, Server, ServerConfig};
//!
//! let routes = RouteTable::new().route("/echo", |conn: &Arc<Connection>, _: &Registry, msg: Message| {
//!     let _ = conn.send(&msg);
//! });
//! let server = Server::bind(ServerConfig::default(), routes, Arc::new(Rfc6455Authorizer::new()))?;
//! server.run()?;
//! # Ok::<(), loki_rt::WsError>(())
//! ```

pub mod close;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod http;
pub mod io;
pub mod message;
pub mod registry;
pub mod route;
pub mod security;
pub mod server;
pub mod transport;

pub use close::{CloseCode, CloseReason};
pub use config::{ConfigError, ServerConfig};
pub use connection::{Connection, ConnectionId, ConnectionLimits, ConnectionState};
pub use error::{ProtocolViolation, WsError};
pub use frame::{Frame, Opcode};
pub use http::{HttpMetadata, HttpRequest};
pub use message::{Message, MessageKind};
pub use registry::{Registry, SweeperHandle};
pub use route::{MessageHandler, RouteTable};
pub use security::{Authorizer, HandshakeDecision, Rejection, Rfc6455Authorizer};
pub use server::{Server, ServerHandle};
pub use transport::{MemorySocket, Socket};
