//! API module for the MRIQC gateway
//!
//! Provides REST API endpoints for:
//! - Running MRIQC on an uploaded BIDS archive
//! - Health checks
//! - Prometheus metrics

mod error;
mod handlers;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower::ServiceBuilder;

use crate::AppState;

pub use error::ApiError;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    // Runs beyond the limit wait for a slot instead of being rejected
    let run_layers = ServiceBuilder::new()
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes()))
        .layer(GlobalConcurrencyLimitLayer::new(state.config.max_concurrent_runs));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(crate::metrics::metrics_handler))
        .route(
            "/run-mriqc",
            post(handlers::mriqc::run_mriqc).layer(run_layers),
        )
        .with_state(state)
}
