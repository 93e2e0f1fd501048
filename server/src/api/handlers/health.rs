//! Health check handler

use std::sync::Arc;

use axum::{extract::State, Json};

use crate::models::{HealthResponse, HealthStatus};
use crate::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let runtime_version = state.pipeline.runner().version().await;

    // Without a working runtime every run would fail
    let status = if runtime_version.is_some() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: state.started_at,
        uptime_seconds: state.uptime_seconds(),
        runtime_version,
        image: state.config.mriqc.image.clone(),
    })
}
