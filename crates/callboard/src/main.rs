use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use callboard::http::{self, AppState};
use callboard::hub::Hub;
use callboard::sessions::SessionManager;
use callboard::state_loop::{Broadcaster, StateLoop};
use callboard::store::JsonStore;
use callboard::telemetry;
use clap::Parser;
use cueconf::CallboardConfig;
use cueproto::GlobalState;
use tokio_util::sync::CancellationToken;

/// The cue fleet state server.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides config).
    #[arg(short, long)]
    listen: Option<String>,

    /// Data directory (overrides config).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Assets directory served under /assets/ (overrides config).
    #[arg(long)]
    assets_dir: Option<PathBuf>,
}

/// Committed states fan out to both sinks: the monitor hub and every
/// connected deployable session.
struct FanOut {
    hub: Arc<Hub>,
    sessions: Arc<SessionManager>,
}

impl Broadcaster for FanOut {
    fn broadcast_state(&self, state: &GlobalState) {
        self.hub.broadcast_state(state);
        self.sessions.broadcast_state(state);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CallboardConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(assets_dir) = cli.assets_dir {
        config.assets_dir = assets_dir;
    }

    telemetry::init(&config.log_filter);
    tracing::info!(
        listen = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        "callboard starting"
    );

    let store = Arc::new(
        JsonStore::open(&config.data_dir).context("failed to open data directory")?,
    );
    let hub = Arc::new(Hub::new());
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        store.clone(),
        hub.clone(),
        config.server_version.clone(),
    ));

    let broadcaster = Arc::new(FanOut {
        hub: hub.clone(),
        sessions: sessions.clone(),
    });
    let (state_loop, loop_handles) = StateLoop::new(
        store.clone(),
        broadcaster,
        GlobalState::new(config.initial_state.clone()),
    );

    let cancel = CancellationToken::new();
    let loop_task = tokio::spawn(state_loop.run(cancel.clone()));

    let app_state = AppState {
        registry: store.clone(),
        packages: store.clone(),
        rules: store,
        hub,
        sessions,
        loop_handles,
        engine_contract_versions: Arc::new(config.engine_contract_versions.clone()),
        server_version: config.server_version.clone(),
    };
    let assets_dir = config.assets_dir.exists().then(|| config.assets_dir.clone());
    let router = http::router(app_state, assets_dir);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!("listening on {}", config.listen_addr);

    let server_task = tokio::spawn(http::serve(listener, router, cancel.clone()));

    wait_for_shutdown().await;
    tracing::info!("shutting down");
    cancel.cancel();
    let _ = loop_task.await;
    let _ = server_task.await;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            tracing::info!("received SIGTERM");
        }
    }
}
