//! MRIQC invocation through a container runtime CLI

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MriqcConfig;
use crate::models::ParticipantLabel;

/// Mount point of the dataset inside the container
pub const CONTAINER_INPUT: &str = "/data";

/// Mount point of the output directory inside the container
pub const CONTAINER_OUTPUT: &str = "/out";

/// One MRIQC run over one dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MriqcInvocation {
    /// Name given to the container so it can be removed if the run is abandoned
    pub container_name: String,
    pub bids_root: PathBuf,
    pub output_dir: PathBuf,
    pub participant_label: ParticipantLabel,
}

impl MriqcInvocation {
    pub fn new(bids_root: PathBuf, output_dir: PathBuf, participant_label: ParticipantLabel) -> Self {
        Self {
            container_name: format!("mriqc-{}", Uuid::new_v4().simple()),
            bids_root,
            output_dir,
            participant_label,
        }
    }
}

/// What the runtime reported once the container exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stderr: String,
    pub duration: Duration,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Failures to drive the runtime itself (as opposed to MRIQC failing)
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to launch {runtime}: {source}")]
    Spawn { runtime: String, source: io::Error },

    #[error("failed waiting for {runtime}: {source}")]
    Wait { runtime: String, source: io::Error },

    #[error("failed to remove container {name}: {reason}")]
    Cleanup { name: String, reason: String },
}

/// Runs MRIQC somewhere and reports how it went
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnalysisRunner: Send + Sync {
    /// Run to completion. Dropping the future must stop the local client process.
    async fn run(&self, invocation: &MriqcInvocation) -> Result<RunOutcome, RunnerError>;

    /// Tear down whatever `run` left behind after it was abandoned
    async fn abort(&self, invocation: &MriqcInvocation) -> Result<(), RunnerError>;

    /// Runtime version string, `None` when the runtime is unusable
    async fn version(&self) -> Option<String>;
}

/// Runs MRIQC with `docker run` (or a CLI-compatible runtime such as podman)
pub struct DockerRunner {
    runtime_path: String,
    image: String,
    analysis_level: String,
    modalities: Vec<String>,
    extra_args: Vec<String>,
}

impl DockerRunner {
    pub fn new(config: &MriqcConfig) -> Self {
        // Find the runtime in PATH, fall back to the configured value as-is
        let runtime_path = which::which(&config.runtime)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| config.runtime.clone());

        Self {
            runtime_path,
            image: config.image.clone(),
            analysis_level: config.analysis_level.clone(),
            modalities: config.modalities.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    pub fn runtime_path(&self) -> &str {
        &self.runtime_path
    }

    /// Build the `run` argument list. Every value is its own argv element.
    pub fn build_args(&self, invocation: &MriqcInvocation) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            invocation.container_name.clone(),
            "-v".to_string(),
            format!("{}:{}:ro", invocation.bids_root.display(), CONTAINER_INPUT),
            "-v".to_string(),
            format!("{}:{}", invocation.output_dir.display(), CONTAINER_OUTPUT),
            self.image.clone(),
            CONTAINER_INPUT.to_string(),
            CONTAINER_OUTPUT.to_string(),
            self.analysis_level.clone(),
            "--participant_label".to_string(),
            invocation.participant_label.to_string(),
            "-m".to_string(),
        ];
        args.extend(self.modalities.iter().cloned());
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl AnalysisRunner for DockerRunner {
    async fn run(&self, invocation: &MriqcInvocation) -> Result<RunOutcome, RunnerError> {
        let args = self.build_args(invocation);
        debug!(runtime = %self.runtime_path, args = ?args, "Starting MRIQC container");

        let start = Instant::now();
        let child = Command::new(&self.runtime_path)
            .args(&args)
            .stdin(Stdio::null())
            // MRIQC's progress log can run to megabytes and is never reported
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                runtime: self.runtime_path.clone(),
                source,
            })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| RunnerError::Wait {
                runtime: self.runtime_path.clone(),
                source,
            })?;

        let outcome = RunOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        };

        info!(
            container = %invocation.container_name,
            exit_code = outcome.exit_code,
            duration_ms = outcome.duration.as_millis() as u64,
            stderr_bytes = outcome.stderr.len(),
            "MRIQC container exited"
        );

        Ok(outcome)
    }

    async fn abort(&self, invocation: &MriqcInvocation) -> Result<(), RunnerError> {
        let output = Command::new(&self.runtime_path)
            .args(["rm", "-f", &invocation.container_name])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                runtime: self.runtime_path.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(container = %invocation.container_name, stderr = %stderr.trim(), "Container removal failed");
            return Err(RunnerError::Cleanup {
                name: invocation.container_name.clone(),
                reason: stderr.trim().to_string(),
            });
        }

        info!(container = %invocation.container_name, "Container removed");
        Ok(())
    }

    async fn version(&self) -> Option<String> {
        let output = Command::new(&self.runtime_path)
            .args(["--version"])
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;

        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            None
        }
    }
}
