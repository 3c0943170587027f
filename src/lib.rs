use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vidfetch_core::core::update_throttle::UpdateThrottle;
use vidfetch_core::models::Settings;

use crate::core::file_store::{FileStore, StoreConfig};
use crate::core::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::core::ytdlp::{self, YtDlp};

pub mod core;
pub mod server;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub store: FileStore,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let store = orchestrator.store().clone();
        Self {
            orchestrator,
            store,
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;

    let store = FileStore::open(StoreConfig::from_settings(&settings))
        .await
        .with_context(|| {
            format!(
                "cannot prepare download dir {}",
                settings.files.download_dir.display()
            )
        })?;

    let binary = match &settings.extractor.ytdlp_path {
        Some(path) => path.clone(),
        None => ytdlp::ensure_ytdlp()
            .await
            .context("yt-dlp is not available")?,
    };
    info!("Using yt-dlp at {}", binary.display());

    let extractor = Arc::new(YtDlp::new(
        binary,
        settings.extractor.update_command.clone(),
    ));
    let throttle = Arc::new(UpdateThrottle::new(settings.update_check_interval()));
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::from_settings(&settings),
        extractor,
        throttle,
        store.clone(),
    );

    let shutdown = CancellationToken::new();
    let sweeper = store.spawn_sweeper(settings.cleanup_interval(), shutdown.clone());

    let addr = settings.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {}", addr))?;

    // Jobs that arrive first find the window claimed and skip their own check.
    orchestrator.spawn_refresh();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutting down");
                    shutdown.cancel();
                }
                Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
            }
        }
    });

    let result = server::serve(listener, AppState::new(orchestrator), shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!("Sweeper task ended abnormally: {}", e);
    }
    result
}
