use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cueconf::StagehandConfig;
use stagehand::actions::{default_executors, Dispatcher, ERROR_QUEUE};
use stagehand::assets::Syncer;
use stagehand::client::Client;
use stagehand::engine::Engine;
use stagehand::playback::{Manager, MediaBackend, StubBackend};
use stagehand::runtime::{Runtime, OUTGOING_QUEUE};
use stagehand::store::Store;
use stagehand::web;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// The cue fleet deployable runtime.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// State server websocket URL (overrides config).
    #[arg(short, long)]
    server: Option<String>,

    /// Persistent data directory (overrides config).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Assets directory (overrides config).
    #[arg(long)]
    assets_dir: Option<PathBuf>,

    /// Playback backend: stub or vlc (overrides config).
    #[arg(long)]
    playback_backend: Option<String>,

    /// Run without a state server.
    #[arg(long)]
    offline: bool,

    /// Generate diagnostic show logic from the configured outputs.
    #[arg(long)]
    diagnostic_show_logic: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = StagehandConfig::load(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(assets_dir) = cli.assets_dir {
        config.assets_dir = assets_dir;
    }
    if let Some(backend) = cli.playback_backend {
        config.playback_backend = backend.to_lowercase();
    }
    config.offline |= cli.offline;
    config.diagnostic_show_logic |= cli.diagnostic_show_logic;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_filter.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    tracing::info!(
        server = %config.server_url,
        data_dir = %config.data_dir.display(),
        backend = %config.playback_backend,
        offline = config.offline,
        "stagehand starting"
    );

    let backend: Arc<dyn MediaBackend> = match config.playback_backend.as_str() {
        "vlc" => Arc::new(stagehand::playback::vlc::VlcBackend::new(config.vlc_path.clone())),
        _ => Arc::new(StubBackend::new()),
    };
    let player = Arc::new(Manager::new(&config.assets_dir, backend));

    let (engine, engine_actions) = Engine::new();
    let dispatcher = Dispatcher::new(default_executors(player.clone()));
    let supported_actions = dispatcher.supported_actions();

    let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
    let (error_tx, mut error_rx) = mpsc::channel(ERROR_QUEUE);

    let runtime = Arc::new(Runtime::new(
        Store::new(&config.data_dir, &config.assets_dir),
        Syncer {
            assets_dir: config.assets_dir.clone(),
            source_dir: config.assets_source_dir.clone(),
            source_url: config.assets_source_url.clone(),
        },
        engine,
        player,
        supported_actions,
        outgoing_tx,
        config.agent_version.clone(),
        config.assets_cleanup,
    ));
    runtime
        .boot(&config.video_outputs, &config.audio_outputs)
        .context("boot failed")?;
    if config.diagnostic_show_logic {
        runtime.apply_diagnostic_show_logic()?;
    }

    let cancel = CancellationToken::new();

    // Dispatcher consumes engine actions; failures flow back to the server.
    tokio::spawn(dispatcher.run(engine_actions, error_tx, cancel.clone()));
    {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            while let Some(failure) = error_rx.recv().await {
                runtime.handle_dispatch_error(failure);
            }
        });
    }

    // Local status endpoint.
    let web_router = web::router(runtime.clone());
    let web_addr = config.web_addr.clone();
    let web_cancel = cancel.clone();
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&web_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!("status endpoint bind failed on {}: {}", web_addr, err);
                return;
            }
        };
        tracing::info!("status endpoint on {}", web_addr);
        web::serve(listener, web_router, web_cancel).await;
    });

    let mut client_task = None;
    if config.offline {
        runtime.start_offline();
    } else {
        let (incoming_tx, incoming_rx) = mpsc::channel(32);
        let (connected_tx, mut connected_rx) = mpsc::channel(4);

        {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                while let Some(at) = connected_rx.recv().await {
                    runtime.set_connected(at);
                }
            });
        }
        tokio::spawn(runtime.clone().run_incoming(incoming_rx, cancel.clone()));

        let client = Client {
            server_url: config.server_url.clone(),
        };
        let hello_runtime = runtime.clone();
        let client_cancel = cancel.clone();
        client_task = Some(tokio::spawn(async move {
            client
                .run(
                    move || hello_runtime.hello(),
                    incoming_tx,
                    outgoing_rx,
                    connected_tx,
                    client_cancel,
                )
                .await;
        }));
    }

    wait_for_shutdown().await;
    tracing::info!("shutting down");
    cancel.cancel();
    if let Some(task) = client_task {
        let _ = task.await;
    }
    tracing::info!("shutdown complete");
    Ok(())
}

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
