//! MRIQC gateway library
//!
//! Accepts BIDS datasets over HTTP, runs MRIQC on them in a container and
//! returns the derivatives as a zip archive.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

pub mod api;
pub mod archive;
pub mod config;
pub mod container;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod workspace;

/// Application state shared across all handlers
pub struct AppState {
    pub config: config::AppConfig,
    pub pipeline: pipeline::Pipeline,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl AppState {
    pub fn new(config: config::AppConfig, runner: Arc<dyn container::AnalysisRunner>) -> Self {
        let pipeline = pipeline::Pipeline::new(runner, config.run_timeout());
        Self {
            config,
            pipeline,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
