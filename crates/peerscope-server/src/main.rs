use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peerscope_server::analysis::{FfmpegTranscoder, factory_for};
use peerscope_server::config::Config;
use peerscope_server::create_app;
use peerscope_server::engine::worker::WorkerEngine;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerscope_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Peerscope server...");

    // Load configuration; invalid configuration aborts startup
    let config = Config::load()?;
    let listen_addr = config.listen_addr;

    tokio::fs::create_dir_all(&config.analysis.sdp_dir).await?;

    let engine = Arc::new(WorkerEngine::new(config.engine.worker_bin.clone()));
    let transcoder = Arc::new(FfmpegTranscoder::new(config.analysis.ffmpeg.clone()));
    let analyzers = factory_for(&config.analysis);

    let (app, _sessions) = create_app(config, engine, transcoder, analyzers);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
