//! Process entrypoint: loads configuration and persisted preferences,
//! wires up the [`gateway_core::Engine`], and serves the HTTP/WebSocket
//! surface until interrupted.

mod config;
mod definitions_loader;
mod http;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gateway_core::{persistence::ConnectionsStore, persistence::DevicePathsStore, Engine, EventBus};
use once_cell::sync::OnceCell;
use tokio::sync::RwLock;

/// Everything a request handler needs, reached through the global [`APP`]
/// cell the way the teacher's `daemon` binary reaches its own `AppState`.
pub struct AppState {
    pub engine: Engine,
    pub device_paths: DevicePathsStore,
    pub logs: Arc<logging::LogHistory>,
    pub definitions_dir: PathBuf,
}

static APP: OnceCell<Arc<RwLock<AppState>>> = OnceCell::new();

/// Accessor used from every HTTP handler. Panics if called before
/// [`main`] has finished wiring the engine, which never happens in
/// practice since the router isn't served until after that.
pub fn app() -> Arc<RwLock<AppState>> {
    APP.get().expect("app state not initialized").clone()
}

fn state_dir() -> anyhow::Result<PathBuf> {
    let path = confy::get_configuration_file_path("gateway-daemon", "gateway")?;
    Ok(path.parent().expect("confy path always has a parent").to_path_buf())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = config::Opts::parse();
    let config = config::Config::load()?.merge(&opts);

    let events = EventBus::new();
    let logs = logging::init(events.clone(), opts.verbose);

    log::info!("starting device gateway daemon");

    let dir = state_dir()?;
    let connections = Arc::new(ConnectionsStore::load(dir.join("connections.json")));
    let device_paths = DevicePathsStore::load(dir.join("device_paths.json"));

    let definitions = definitions_loader::load_dir(&config.definitions_dir);
    log::info!("loaded {} device definitions", definitions.len());

    let engine = Engine::new(events, definitions, connections, config.udp_bind_port).await;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let workers = engine.spawn_workers(&shutdown_tx);

    let state = AppState {
        engine,
        device_paths,
        logs,
        definitions_dir: config.definitions_dir.clone(),
    };
    APP.set(Arc::new(RwLock::new(state)))
        .unwrap_or_else(|_| panic!("app state initialized twice"));

    let addr = config
        .http_bind_address
        .parse()
        .unwrap_or_else(|_| panic!("invalid http bind address: {}", config.http_bind_address));

    let http_shutdown = shutdown_tx.subscribe();
    let server = tokio::spawn(http::serve(addr, http_shutdown));

    tokio::signal::ctrl_c().await?;
    log::info!("received interrupt, shutting down");
    let _ = shutdown_tx.send(());

    let _ = server.await?;
    for worker in workers {
        let _ = worker.await;
    }

    Ok(())
}
