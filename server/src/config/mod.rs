//! Configuration module for the MRIQC gateway
//!
//! Supports configuration via:
//! - YAML/TOML/JSON config files
//! - Environment variables (with MRIQC_ prefix)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::ParticipantLabel;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for the JSON log file; no file logging when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Root under which per-request workspaces are created (system temp dir when unset)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Maximum accepted upload size in megabytes
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,

    /// Number of analyses allowed to run at the same time
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// MRIQC invocation settings
    #[serde(default)]
    pub mriqc: MriqcConfig,
}

/// How the analysis container is launched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MriqcConfig {
    /// Container runtime binary (name looked up in PATH, or absolute path)
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Pinned MRIQC image reference
    #[serde(default = "default_image")]
    pub image: String,

    /// Analysis level passed after the two positional paths
    #[serde(default = "default_analysis_level")]
    pub analysis_level: String,

    /// Modalities passed to `-m`
    #[serde(default = "default_modalities")]
    pub modalities: Vec<String>,

    /// Label used when the request does not carry one
    #[serde(default = "default_participant_label")]
    pub default_participant_label: String,

    /// Deadline for a single MRIQC run
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// Extra arguments appended after the modality list
    #[serde(default)]
    pub extra_args: Vec<String>,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_upload_mb() -> u64 {
    4096
}

fn default_max_concurrent_runs() -> usize {
    1
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "nipreps/mriqc:22.0.6".to_string()
}

fn default_analysis_level() -> String {
    "participant".to_string()
}

fn default_modalities() -> Vec<String> {
    vec!["T1w".to_string(), "T2w".to_string(), "bold".to_string()]
}

fn default_participant_label() -> String {
    "01".to_string()
}

fn default_run_timeout() -> u64 {
    14_400 // 4 hours
}

impl Default for MriqcConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            image: default_image(),
            analysis_level: default_analysis_level(),
            modalities: default_modalities(),
            default_participant_label: default_participant_label(),
            run_timeout_seconds: default_run_timeout(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_dir: None,
            scratch_dir: None,
            max_upload_mb: default_max_upload_mb(),
            max_concurrent_runs: default_max_concurrent_runs(),
            mriqc: MriqcConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config/mriqc").required(false))
            .add_source(config::File::with_name("/etc/mriqc/config").required(false))
            // Override with environment variables (MRIQC_ prefix)
            .add_source(
                config::Environment::with_prefix("MRIQC")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("mriqc.modalities")
                    .with_list_parse_key("mriqc.extra_args")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        if self.max_upload_mb == 0 {
            anyhow::bail!("Upload limit cannot be 0");
        }

        if self.max_concurrent_runs == 0 {
            anyhow::bail!("At least one concurrent run must be allowed");
        }

        if self.mriqc.run_timeout_seconds == 0 {
            anyhow::bail!("MRIQC run timeout cannot be 0");
        }

        if self.mriqc.image.trim().is_empty() {
            anyhow::bail!("MRIQC image cannot be empty");
        }

        if self.mriqc.modalities.is_empty() {
            anyhow::bail!("At least one modality must be configured");
        }

        ParticipantLabel::parse(&self.mriqc.default_participant_label)
            .context("Invalid default participant label")?;

        Ok(())
    }

    /// Upload limit in bytes
    pub fn max_upload_bytes(&self) -> usize {
        usize::try_from(self.max_upload_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    /// Deadline for a single MRIQC run
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.mriqc.run_timeout_seconds)
    }

    /// Root under which per-request workspaces live
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
