use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use rollcall_core::{FaceEncoder, OnnxFaceEncoder};
use rollcall_hw::Camera;
use rollcall_store::SqliteStore;

mod config;
mod context;
mod export;
mod http;
mod pipeline;
mod recognize;
mod service;

use config::Config;
use context::AppContext;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        source = %config.video_source,
        db = %config.db_path.display(),
        threshold = config.match_threshold,
        "rollcalld starting"
    );

    let store = SqliteStore::open(&config.db_path, config.store_config())
        .with_context(|| format!("opening store at {}", config.db_path.display()))?;
    let encoder = OnnxFaceEncoder::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;

    let cancel = CancellationToken::new();
    let ctx = Arc::new(AppContext::new(
        config,
        Arc::new(store),
        Arc::new(encoder) as Arc<dyn FaceEncoder>,
        cancel.clone(),
    ));
    if let Err(e) = ctx.seed_today() {
        tracing::warn!(error = %e, "could not seed today's attendance; starting empty");
    }

    let source = ctx.config.video_source.clone();
    let ingest = pipeline::spawn(Arc::clone(&ctx), move || Camera::open(&source))
        .context("spawning ingestion thread")?;

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match wait_for_shutdown().await {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(e) => tracing::error!(error = %e, "signal handler failed; shutting down"),
            }
            cancel.cancel();
        }
    });

    let served = http::serve(Arc::clone(&ctx)).await;
    cancel.cancel();

    let exit = tokio::task::spawn_blocking(move || ingest.join()).await?;
    match exit {
        Ok(exit) => tracing::info!(?exit, "ingestion stopped"),
        Err(_) => tracing::error!("ingestion thread panicked"),
    }

    tracing::info!("rollcalld stopped");
    served
}

async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
    Ok(())
}
