//! # casehub
//!
//! Case collaboration hub binary. Wires settings, the message store and the
//! hub together and serves the HTTP/WebSocket surface.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use casehub_hub::{Hub, HubConfig, MemoryMessageStore, MessageStore};
use casehub_server::metrics::install_recorder;
use casehub_server::{CasehubServer, ServerConfig};
use casehub_settings::{CasehubSettings, StoreBackend};
use casehub_store::SqliteMessageStore;
use casehub_store::connection::ConnectionConfig;
use clap::{Parser, ValueEnum};

/// Case collaboration hub server.
#[derive(Parser, Debug)]
#[command(name = "casehub", about = "Case collaboration hub server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.casehub/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Message store backend (overrides settings).
    #[arg(long, value_enum)]
    store: Option<StoreArg>,

    /// Path to the `SQLite` message database (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StoreArg {
    Sqlite,
    Memory,
}

impl From<StoreArg> for StoreBackend {
    fn from(arg: StoreArg) -> Self {
        match arg {
            StoreArg::Sqlite => Self::Sqlite,
            StoreArg::Memory => Self::Memory,
        }
    }
}

impl Cli {
    /// Apply command-line overrides on top of loaded settings.
    fn apply(&self, settings: &mut CasehubSettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(store) = self.store {
            settings.store.backend = store.into();
        }
        if let Some(ref path) = self.db_path {
            settings.store.path.clone_from(path);
        }
    }
}

fn open_store(settings: &CasehubSettings) -> Result<Arc<dyn MessageStore>> {
    match settings.store.backend {
        StoreBackend::Sqlite => {
            let path = &settings.store.path;
            let store = SqliteMessageStore::open(path, &ConnectionConfig::default())
                .with_context(|| format!("Failed to open message store: {}", path.display()))?;
            tracing::info!(path = %path.display(), "sqlite message store ready");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("in-memory message store: undelivered messages are lost on restart");
            Ok(Arc::new(MemoryMessageStore::new()))
        }
    }
}

fn server_config(settings: &CasehubSettings) -> ServerConfig {
    ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        max_message_size: settings.server.max_message_size,
        write_timeout_ms: settings.hub.write_timeout_ms,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(casehub_settings::settings_path);
    let mut settings = casehub_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings: {}", settings_path.display()))?;
    args.apply(&mut settings);

    casehub_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics = install_recorder();

    let store = open_store(&settings)?;
    let hub = Arc::new(Hub::new(HubConfig::from(&settings.hub), store));
    let server = CasehubServer::new(server_config(&settings), hub).with_metrics(metrics);

    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;
    tracing::info!("casehub listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().shutdown();
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
