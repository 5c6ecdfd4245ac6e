//! The Loki WebSocket server CLI.
//!
//! - `loki serve [--config <file>] [--bind <addr>]` - Run the server
//! - `loki check-config <file>` - Validate a config file and print the effective settings
//!
//! Routes served:
//! - `/echo` - every message is sent straight back
//! - `/broadcast` - every message is relayed to all connections sharing the
//!   sender's client identifier

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info};

use loki_rt::{
    CloseCode, Connection, Message, MessageHandler, Registry, Rfc6455Authorizer, RouteTable, Server,
    ServerConfig,
};

#[derive(Parser)]
#[command(name = "loki", version, about = "The Loki WebSocket server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve {
        /// Path to a TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address, overriding the config file
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Parse and validate a config file
    CheckConfig {
        /// Path to the TOML config file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { config, bind } => serve(config.as_deref(), bind),
        Commands::CheckConfig { file } => check_config(&file),
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<ServerConfig, String> {
    match path {
        Some(path) => ServerConfig::from_file(path).map_err(|e| e.to_string()),
        None => Ok(ServerConfig::default()),
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

fn serve(config_path: Option<&Path>, bind: Option<SocketAddr>) -> Result<(), String> {
    let mut config = load_config(config_path)?;
    if let Some(bind) = bind {
        config.bind = bind;
    }
    init_logging(&config.log_level);

    let authorizer = Rfc6455Authorizer::with_allowed_origins(config.allowed_origins.clone());
    let routes = RouteTable::new()
        .route("/echo", Echo)
        .route("/broadcast", Broadcast);

    let server = Server::bind(config, routes, Arc::new(authorizer)).map_err(|e| e.to_string())?;
    server.run().map_err(|e| e.to_string())
}

fn check_config(path: &Path) -> Result<(), String> {
    let config = load_config(Some(path))?;
    println!("{}: ok", path.display());
    println!("{:#?}", config);
    Ok(())
}

struct Echo;

impl MessageHandler for Echo {
    fn on_message(&self, conn: &Arc<Connection>, _registry: &Registry, message: Message) {
        if let Err(e) = conn.send(&message) {
            debug!(conn_id = %conn.id(), error = %e, "echo failed");
        }
    }
}

struct Broadcast;

impl MessageHandler for Broadcast {
    fn on_open(&self, conn: &Arc<Connection>, registry: &Registry) {
        let peers = registry.get_by_client_identifier(conn.client_id()).len();
        info!(client_id = %conn.client_id(), peers, "joined broadcast");
    }

    fn on_message(&self, conn: &Arc<Connection>, registry: &Registry, message: Message) {
        for peer in registry.get_by_client_identifier(conn.client_id()) {
            if let Err(e) = peer.send(&message) {
                debug!(conn_id = %peer.id(), error = %e, "broadcast delivery failed");
            }
        }
    }

    fn on_close(&self, conn: &Arc<Connection>, code: CloseCode) {
        info!(client_id = %conn.client_id(), code = code.as_u16(), "left broadcast");
    }
}
