//! Concurrent registry of live connections.
//!
//! Entries are keyed by [`ConnectionId`]; client identifiers may repeat.
//! Every insert and remove touches a single DashMap shard, so the accept
//! path, the read loops and the sweeper never serialize on one lock.
//!
//! The registry also owns what every new connection needs at handshake
//! time: the route table, the authorizer and the server config.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use crate::close::CloseCode;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::handshake::{self, Accepted};
use crate::route::RouteTable;
use crate::security::Authorizer;
use crate::transport::Socket;

/// Attempts before an unregister under contention is abandoned.
pub const UNREGISTER_ATTEMPTS: usize = 5;

pub struct Registry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    routes: RouteTable,
    authorizer: Arc<dyn Authorizer>,
    config: ServerConfig,
    /// Set by [`Registry::close_all`]; no connection opens afterwards.
    closed: AtomicBool,
}

impl Registry {
    pub fn new(routes: RouteTable, authorizer: Arc<dyn Authorizer>, config: ServerConfig) -> Self {
        Registry {
            connections: DashMap::new(),
            routes,
            authorizer,
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Whether [`Registry::close_all`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Take ownership of an accepted socket and serve it on its own thread:
    /// handshake, registration, read loop, unregistration.
    ///
    /// `None` (a failed accept) is a no-op. After [`Registry::close_all`]
    /// the socket is shut down unserved.
    pub fn register(self: &Arc<Self>, socket: Option<Box<dyn Socket>>) -> Option<JoinHandle<()>> {
        let socket = socket?;
        if self.is_closed() {
            let _ = socket.shutdown();
            return None;
        }
        let registry = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("loki-conn".to_string())
            .spawn(move || registry.serve(socket));
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to spawn connection thread");
                None
            }
        }
    }

    fn serve(&self, socket: Box<dyn Socket>) {
        let Accepted {
            connection,
            reader,
            handler,
        } = match handshake::accept(socket, &self.routes, self.authorizer.as_ref(), &self.config) {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(error = %e, "handshake failed");
                return;
            }
        };

        self.add(Arc::clone(&connection));
        // A handshake that finished after close_all took its snapshot.
        if self.is_closed() {
            connection.force_close(CloseCode::GoingAway, "server shutting down");
            self.unregister(&connection);
            debug!(conn_id = %connection.id(), "opened during shutdown, closed");
            return;
        }
        handler.on_open(&connection, self);
        let code = connection.run(reader, |message| handler.on_message(&connection, self, message));
        self.unregister(&connection);
        handler.on_close(&connection, code);
    }

    /// Insert an open connection. Returns `false` if its id is already present.
    pub fn add(&self, connection: Arc<Connection>) -> bool {
        match self.connections.entry(connection.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(connection);
                true
            }
        }
    }

    /// Remove `connection`. Returns `true` if this call removed it.
    ///
    /// Safe to call repeatedly and concurrently. A shard held by another
    /// caller is retried up to [`UNREGISTER_ATTEMPTS`] times; after that
    /// the removal is abandoned, and a connection left behind is `Closed`
    /// and therefore reclaimed by the next sweep.
    pub fn unregister(&self, connection: &Connection) -> bool {
        let id = connection.id();
        for _ in 0..UNREGISTER_ATTEMPTS {
            match self.connections.try_entry(id) {
                Some(Entry::Occupied(entry)) => {
                    entry.remove();
                    trace!(conn_id = %id, "unregistered");
                    return true;
                }
                Some(Entry::Vacant(_)) => return false,
                None => thread::yield_now(),
            }
        }
        warn!(conn_id = %id, "registry contention: unregister abandoned");
        false
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every connection whose client identifier is `client_id`.
    pub fn get_by_client_identifier(&self, client_id: &str) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().client_id() == client_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Advisory under concurrent mutation.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    // Snapshot before mutating: holding an iterator's shard guard while
    // removing from the same shard would deadlock.
    fn matching(&self, pred: impl Fn(&Connection) -> bool) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| pred(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Unregister and tear down every connection that is no longer alive.
    /// Returns how many entries this sweep removed.
    pub fn sweep_dead(&self) -> usize {
        let mut removed = 0;
        for connection in self.matching(|c| !c.is_alive()) {
            if self.unregister(&connection) {
                removed += 1;
            }
            connection.force_close(CloseCode::GoingAway, "connection timed out");
        }
        removed
    }

    /// Ping every open connection that has been quiet for more than half
    /// its staleness window. Returns the number of pings sent.
    pub fn heartbeat(&self) -> usize {
        let mut sent = 0;
        for connection in self.matching(|c| c.needs_heartbeat()) {
            let payload: [u8; 4] = rand::random();
            match connection.ping(&payload) {
                Ok(()) => sent += 1,
                Err(e) => debug!(conn_id = %connection.id(), error = %e, "heartbeat ping failed"),
            }
        }
        sent
    }

    /// Close and remove every connection. Used at server shutdown.
    ///
    /// Connections whose handshake completes later are closed as soon as
    /// they are added.
    pub fn close_all(&self, code: CloseCode) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let all = self.connections();
        for connection in &all {
            connection.force_close(code, "server shutting down");
            self.unregister(connection);
        }
        all.len()
    }

    /// Run heartbeat and sweep every `interval` on a dedicated thread.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> std::io::Result<SweeperHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);
        let registry = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("loki-sweeper".to_string())
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        let pinged = registry.heartbeat();
                        let removed = registry.sweep_dead();
                        if removed > 0 {
                            info!(removed, remaining = registry.count(), "swept dead connections");
                        }
                        trace!(pinged, "sweep tick");
                    }
                }
            })?;
        Ok(SweeperHandle {
            stop: stop_tx,
            thread,
        })
    }
}

/// Stops the sweeper thread. Dropping the handle also stops it, without
/// waiting for the thread to exit.
pub struct SweeperHandle {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.thread.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionLimits, ConnectionState};
    use crate::message::Message;
    use crate::security::Rfc6455Authorizer;
    use crate::transport::MemorySocket;

    fn registry() -> Arc<Registry> {
        let routes = RouteTable::new().route("/echo", |c: &Arc<Connection>, _: &Registry, m: Message| {
            let _ = c.send(&m);
        });
        Arc::new(Registry::new(
            routes,
            Arc::new(Rfc6455Authorizer::new()),
            ServerConfig::default(),
        ))
    }

    fn open_connection(client_id: &str, limits: ConnectionLimits) -> (Arc<Connection>, MemorySocket) {
        let socket = MemorySocket::new();
        let conn = Connection::new(ConnectionId::next(), client_id, "/echo", &socket, limits).unwrap();
        assert!(conn.mark_open());
        (Arc::new(conn), socket)
    }

    #[test]
    fn test_add_then_unregister() {
        let registry = registry();
        let (conn, _socket) = open_connection("alice", ConnectionLimits::default());
        assert!(registry.add(Arc::clone(&conn)));
        assert!(!registry.add(Arc::clone(&conn)));
        assert_eq!(registry.get_by_client_identifier("alice").len(), 1);

        assert!(registry.unregister(&conn));
        assert!(registry.get_by_client_identifier("alice").is_empty());
        assert!(!registry.unregister(&conn), "second unregister is a no-op");
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_client_ids_may_repeat() {
        let registry = registry();
        for client in ["alice", "alice", "bob"] {
            let (conn, _) = open_connection(client, ConnectionLimits::default());
            registry.add(conn);
        }
        assert_eq!(registry.get_by_client_identifier("alice").len(), 2);
        assert_eq!(registry.get_by_client_identifier("bob").len(), 1);
        assert!(registry.get_by_client_identifier("carol").is_empty());
    }

    #[test]
    fn test_register_none_is_noop() {
        let registry = registry();
        assert!(registry.register(None).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_concurrent_adds_then_sweep_leaves_live_ones() {
        const K: usize = 64;
        const M: usize = 24;
        let registry = registry();

        let handles: Vec<_> = (0..K)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let (conn, socket) = open_connection(&format!("client-{}", i % 8), ConnectionLimits::default());
                    assert!(registry.add(Arc::clone(&conn)));
                    (conn, socket)
                })
            })
            .collect();
        let conns: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(registry.count(), K);

        for (conn, _) in conns.iter().take(M) {
            conn.force_close(CloseCode::Abnormal, "");
        }
        assert_eq!(registry.sweep_dead(), M);
        assert_eq!(registry.count(), K - M);
        for (conn, _) in conns.iter().skip(M) {
            assert!(registry.get(conn.id()).is_some());
        }
    }

    #[test]
    fn test_concurrent_unregister_removes_exactly_once() {
        let registry = registry();
        let (conn, _socket) = open_connection("alice", ConnectionLimits::default());
        registry.add(Arc::clone(&conn));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let conn = Arc::clone(&conn);
                thread::spawn(move || registry.unregister(&conn))
            })
            .collect();
        let removed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|removed| *removed)
            .count();
        assert!(removed <= 1);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_stale_connections_are_swept_with_going_away() {
        let registry = registry();
        let limits = ConnectionLimits {
            stale_after: Duration::from_millis(20),
            ..ConnectionLimits::default()
        };
        let (stale, socket) = open_connection("idle", limits);
        let (fresh, _) = open_connection("busy", ConnectionLimits::default());
        registry.add(Arc::clone(&stale));
        registry.add(Arc::clone(&fresh));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(registry.sweep_dead(), 1);
        assert_eq!(registry.count(), 1);
        assert_eq!(stale.state(), ConnectionState::Closed);
        assert!(socket.is_shutdown());
        // close frame: FIN+Close, length, 1001
        assert_eq!(&socket.written()[..4], &[0x88, 0x16, 0x03, 0xE9]);
    }

    #[test]
    fn test_heartbeat_pings_quiet_connections() {
        let registry = registry();
        let limits = ConnectionLimits {
            stale_after: Duration::from_millis(40),
            ..ConnectionLimits::default()
        };
        let (conn, socket) = open_connection("quiet", limits);
        registry.add(conn);

        assert_eq!(registry.heartbeat(), 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.heartbeat(), 1);
        let written = socket.written();
        assert_eq!(&written[..2], &[0x89, 0x04]);
    }

    #[test]
    fn test_close_all_empties_registry() {
        let registry = registry();
        let mut sockets = Vec::new();
        for _ in 0..3 {
            let (conn, socket) = open_connection("c", ConnectionLimits::default());
            registry.add(conn);
            sockets.push(socket);
        }
        assert_eq!(registry.close_all(CloseCode::GoingAway), 3);
        assert_eq!(registry.count(), 0);
        assert!(sockets.iter().all(MemorySocket::is_shutdown));
    }

    #[test]
    fn test_sweeper_thread_reaps_closed_connections() {
        let registry = registry();
        let (conn, _socket) = open_connection("c", ConnectionLimits::default());
        registry.add(Arc::clone(&conn));
        conn.force_close(CloseCode::Abnormal, "");

        let sweeper = registry.spawn_sweeper(Duration::from_millis(10)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while registry.count() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        sweeper.stop();
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_handshake_finishing_after_close_all_is_closed() {
        let registry = registry();
        let socket = MemorySocket::new();
        let handle = registry.register(Some(Box::new(socket.clone()))).unwrap();

        // The connection thread is still waiting for its request head.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(registry.close_all(CloseCode::GoingAway), 0);

        socket.feed(
            b"GET /echo HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
              Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        );
        handle.join().unwrap();

        assert_eq!(registry.count(), 0);
        assert!(socket.is_shutdown());
        let written = socket.written();
        assert!(written.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
        let close_at = written.len() - (2 + 2 + "server shutting down".len());
        assert_eq!(&written[close_at..close_at + 4], &[0x88, 0x16, 0x03, 0xE9]);
    }

    #[test]
    fn test_register_after_close_all_is_refused() {
        let registry = registry();
        registry.close_all(CloseCode::GoingAway);
        let socket = MemorySocket::new();
        assert!(registry.register(Some(Box::new(socket.clone()))).is_none());
        assert!(socket.is_shutdown());
    }

    #[test]
    fn test_registered_socket_is_served_end_to_end() {
        let registry = registry();
        let socket = MemorySocket::new();
        socket.feed(
            b"GET /echo?clientId=zed HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
              Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        );
        let handle = registry.register(Some(Box::new(socket.clone()))).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while registry.get_by_client_identifier("zed").is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(registry.get_by_client_identifier("zed").len(), 1);

        // Masked "hi" then a close.
        socket.feed(&[0x81, 0x82, 0, 0, 0, 0, b'h', b'i']);
        socket.feed(&[0x88, 0x82, 0, 0, 0, 0, 0x03, 0xE8]);
        handle.join().unwrap();

        assert_eq!(registry.count(), 0);
        let written = socket.written();
        let text = String::from_utf8_lossy(&written);
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(written.ends_with(&[0x81, 0x02, b'h', b'i', 0x88, 0x02, 0x03, 0xE8]));
    }
}
