//! Route table: request path to message handler.
//!
//! Built once before the server starts and read-only afterwards. A
//! handler is resolved a single time per connection, at handshake.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::close::CloseCode;
use crate::connection::Connection;
use crate::message::Message;
use crate::registry::Registry;

/// Receives the events of every connection opened on a route.
///
/// Only `on_message` is required. Any `Fn(&Arc<Connection>, &Registry, Message)`
/// closure is a handler.
pub trait MessageHandler: Send + Sync {
    fn on_open(&self, _conn: &Arc<Connection>, _registry: &Registry) {}

    fn on_message(&self, conn: &Arc<Connection>, registry: &Registry, message: Message);

    /// Called once after the connection reached `Closed` and left the registry.
    fn on_close(&self, _conn: &Arc<Connection>, _code: CloseCode) {}
}

impl<F> MessageHandler for F
where
    F: Fn(&Arc<Connection>, &Registry, Message) + Send + Sync,
{
    fn on_message(&self, conn: &Arc<Connection>, registry: &Registry, message: Message) {
        self(conn, registry, message)
    }
}

#[derive(Clone, Default)]
pub struct RouteTable {
    routes: FxHashMap<String, Arc<dyn MessageHandler>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`RouteTable::insert`].
    pub fn route(mut self, path: &str, handler: impl MessageHandler + 'static) -> Self {
        self.insert(path, handler);
        self
    }

    /// Register `handler` for `path`, replacing any previous handler.
    pub fn insert(&mut self, path: &str, handler: impl MessageHandler + 'static) {
        self.routes.insert(normalize(path).to_string(), Arc::new(handler));
    }

    /// The handler for `path`, ignoring a trailing slash.
    pub fn resolve(&self, path: &str) -> Option<Arc<dyn MessageHandler>> {
        self.routes.get(normalize(path)).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

fn normalize(path: &str) -> &str {
    match path.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => path,
    }
}
