//! Blabber Server - HTTP front-end for streaming text-to-speech sessions

use blabber_core::SynthesisPool;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod player;
mod settings;
mod state;

use settings::Settings;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "blabber_server=debug,blabber_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Blabber server");

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Synthesis endpoint: {} ({} workers, credentials: {:?})",
        settings.pipeline.endpoint, settings.pipeline.workers, settings.pipeline.credentials
    );

    // The blocking HTTP client cannot be created on a runtime thread
    let pipeline = settings.pipeline.clone();
    let pool = tokio::task::spawn_blocking(move || SynthesisPool::new(&pipeline)).await??;
    let pool = Arc::new(pool);

    let state = AppState::new(
        pool.clone(),
        settings.pipeline,
        settings.server.clone(),
        settings.voice,
    );

    // Build router
    let app = api::create_router(state.clone());

    // Start server
    let addr = settings.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown().await;
    drop(state);
    // Teardown joins worker threads and may drop the HTTP client
    tokio::task::spawn_blocking(move || {
        pool.teardown();
        drop(pool);
    })
    .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
