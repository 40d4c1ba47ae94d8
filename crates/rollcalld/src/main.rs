use anyhow::{Context, Result};
use rollcall_core::{IndexCache, Ledger, OnnxFaceEncoder};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod http;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = config::Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        bind = %config.bind,
        faces_dir = %config.faces_dir.display(),
        ledger = %config.ledger_path.display(),
        models = %config.model_dir.display(),
        threshold = config.match_threshold,
        policy = %config.index_policy,
        "configuration loaded"
    );

    std::fs::create_dir_all(&config.faces_dir).with_context(|| {
        format!("failed to create known-faces directory {}", config.faces_dir.display())
    })?;

    // Load models synchronously so a missing model fails startup.
    let encoder = OnnxFaceEncoder::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .context("failed to load face models")?;
    tracing::info!("face models loaded");

    let engine = engine::spawn_engine(
        encoder,
        IndexCache::new(&config.faces_dir, config.index_policy),
        config.face_matcher(),
    )?;

    let state = http::AppState {
        engine,
        ledger: Arc::new(Ledger::new(&config.ledger_path)),
        config: Arc::new(config.clone()),
    };

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "rollcalld ready");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("rollcalld shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
