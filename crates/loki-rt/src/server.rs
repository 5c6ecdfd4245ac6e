//! TCP accept loop feeding the registry.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::close::CloseCode;
use crate::config::ServerConfig;
use crate::error::WsError;
use crate::registry::Registry;
use crate::route::RouteTable;
use crate::security::Authorizer;

pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Server {
    /// Bind the configured address. The engine starts on [`Server::run`]
    /// or [`Server::spawn`].
    pub fn bind(
        config: ServerConfig,
        routes: RouteTable,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Server, WsError> {
        let listener = TcpListener::bind(config.bind)?;
        info!(addr = %listener.local_addr()?, routes = routes.len(), "listening");
        Ok(Server {
            listener,
            registry: Arc::new(Registry::new(routes, authorizer, config)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Accept connections on the calling thread until the listener fails.
    pub fn run(self) -> Result<(), WsError> {
        let stopping = AtomicBool::new(false);
        serve(&self.listener, &self.registry, &stopping)
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self) -> Result<ServerHandle, WsError> {
        let local_addr = self.local_addr()?;
        let registry = Arc::clone(&self.registry);
        let stopping = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopping);
        let thread = thread::Builder::new()
            .name("loki-accept".to_string())
            .spawn(move || {
                if let Err(e) = serve(&self.listener, &self.registry, &flag) {
                    warn!(error = %e, "server stopped");
                }
            })?;
        Ok(ServerHandle {
            local_addr,
            registry,
            stopping,
            thread,
        })
    }
}

fn serve(listener: &TcpListener, registry: &Arc<Registry>, stopping: &AtomicBool) -> Result<(), WsError> {
    let sweeper = registry.spawn_sweeper(registry.config().sweep_interval())?;

    for stream in listener.incoming() {
        if stopping.load(Ordering::Acquire) {
            break;
        }
        match stream {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                registry.register(Some(Box::new(stream)));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                registry.register(None);
            }
        }
    }

    sweeper.stop();
    let closed = registry.close_all(CloseCode::GoingAway);
    info!(closed, "server shut down");
    Ok(())
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    stopping: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Stop accepting, close every connection with 1001 and wait for the
    /// accept thread to exit.
    pub fn shutdown(self) {
        self.stopping.store(true, Ordering::Release);
        // Wake the blocking accept.
        let mut wake = self.local_addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(match wake {
                SocketAddr::V4(_) => [127, 0, 0, 1].into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
            });
        }
        let _ = TcpStream::connect(wake);
        let _ = self.thread.join();
    }
}
