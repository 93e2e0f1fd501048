//! MRIQC Gateway - run MRIQC on uploaded BIDS datasets
//!
//! This is the main entry point for the gateway service.
//! It serves the HTTP API and launches MRIQC through the container runtime.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::http::HeaderName;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use mriqc_server::api::create_router;
use mriqc_server::config::AppConfig;
use mriqc_server::container::{AnalysisRunner, DockerRunner};
use mriqc_server::logging::init_logging;
use mriqc_server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    init_logging(&config.log_level, config.log_dir.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting MRIQC gateway"
    );

    mriqc_server::metrics::init_metrics()?;
    info!("Prometheus metrics initialized");

    let runner = DockerRunner::new(&config.mriqc);
    match runner.version().await {
        Some(version) => info!(
            runtime = %runner.runtime_path(),
            version = %version,
            image = %config.mriqc.image,
            "Container runtime available"
        ),
        None => warn!(
            runtime = %runner.runtime_path(),
            "Container runtime not working; runs will fail until it is"
        ),
    }

    let scratch_root = config.scratch_root();
    tokio::fs::create_dir_all(&scratch_root).await?;
    info!(
        scratch = %scratch_root.display(),
        max_concurrent_runs = config.max_concurrent_runs,
        run_timeout_secs = config.mriqc.run_timeout_seconds,
        "Workspace settings"
    );

    // Create shared application state
    let state = Arc::new(AppState::new(config.clone(), Arc::new(runner)));

    // Build the router with all routes and middleware
    let x_request_id = HeaderName::from_static("x-request-id");
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Bind to address
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(%addr, "Listening on");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("MRIQC gateway stopped");
    Ok(())
}

/// Handle shutdown signals gracefully
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down...");
}
