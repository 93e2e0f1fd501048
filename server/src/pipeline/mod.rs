//! Extract → run MRIQC → pack
//!
//! The pipeline works on a `RequestWorkspace` whose upload has already been
//! written to disk. Archive work runs on the blocking pool; the container run
//! is bounded by the configured deadline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::archive::{self, ArchiveStats};
use crate::container::{AnalysisRunner, MriqcInvocation, RunnerError};
use crate::metrics;
use crate::models::ParticipantLabel;
use crate::workspace::{find_bids_root, RequestWorkspace, RootError};

/// Pipeline failures, each terminal for the request
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid BIDS zip: {0}")]
    InvalidArchive(String),

    #[error(transparent)]
    Root(#[from] RootError),

    #[error("MRIQC failed")]
    AnalysisFailed { exit_code: i32, stderr: String },

    #[error("MRIQC timed out after {} seconds", .0.as_secs())]
    TimedOut(Duration),

    #[error("Failed to launch MRIQC: {0}")]
    Runner(#[from] RunnerError),

    #[error("Failed to package MRIQC results: {0}")]
    Package(String),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result archive produced by a successful run
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub result_path: PathBuf,
    pub result: ArchiveStats,
    pub run_duration: Duration,
}

/// Drives one dataset through MRIQC
#[derive(Clone)]
pub struct Pipeline {
    runner: Arc<dyn AnalysisRunner>,
    run_timeout: Duration,
}

impl Pipeline {
    pub fn new(runner: Arc<dyn AnalysisRunner>, run_timeout: Duration) -> Self {
        Self {
            runner,
            run_timeout,
        }
    }

    pub fn runner(&self) -> &Arc<dyn AnalysisRunner> {
        &self.runner
    }

    /// Process the archive stored at `workspace.upload_path()`
    pub async fn run(
        &self,
        workspace: &RequestWorkspace,
        label: ParticipantLabel,
    ) -> Result<PipelineOutput, PipelineError> {
        let upload = workspace.upload_path();
        let upload_dir = workspace.upload_dir().to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || archive::extract(&upload, &upload_dir))
            .await?
            .map_err(|e| PipelineError::InvalidArchive(e.to_string()))?;
        info!(entries = extracted.entries, bytes = extracted.bytes, "BIDS archive extracted");

        let bids_root = find_bids_root(workspace.upload_dir()).await?;
        let invocation =
            MriqcInvocation::new(bids_root, workspace.output_dir().to_path_buf(), label);

        info!(
            container = %invocation.container_name,
            participant_label = %invocation.participant_label,
            bids_root = %invocation.bids_root.display(),
            "Running MRIQC"
        );

        let start = Instant::now();
        let mut guard = AbortOnDrop::new(self.runner.clone(), invocation.clone());
        let result = timeout(self.run_timeout, self.runner.run(&invocation)).await;
        if result.is_ok() {
            guard.disarm();
        }

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(error = %e, "MRIQC could not be started");
                metrics::record_run("error", start.elapsed());
                return Err(e.into());
            }
            Err(_) => {
                warn!(
                    container = %invocation.container_name,
                    timeout_secs = self.run_timeout.as_secs(),
                    "MRIQC timed out"
                );
                if let Err(e) = self.runner.abort(&invocation).await {
                    warn!(error = %e, "Cleanup after timeout failed");
                }
                guard.disarm();
                metrics::record_run("timeout", start.elapsed());
                return Err(PipelineError::TimedOut(self.run_timeout));
            }
        };

        if !outcome.success() {
            warn!(exit_code = outcome.exit_code, "MRIQC exited with failure");
            metrics::record_run("failed", outcome.duration);
            return Err(PipelineError::AnalysisFailed {
                exit_code: outcome.exit_code,
                stderr: outcome.stderr,
            });
        }
        metrics::record_run("success", outcome.duration);

        let output_dir = workspace.output_dir().to_path_buf();
        let result_path = workspace.result_path();
        let dest = result_path.clone();
        let result = tokio::task::spawn_blocking(move || archive::pack(&output_dir, &dest))
            .await?
            .map_err(|e| PipelineError::Package(e.to_string()))?;

        info!(entries = result.entries, bytes = result.bytes, "MRIQC results packed");

        Ok(PipelineOutput {
            result_path,
            result,
            run_duration: outcome.duration,
        })
    }
}

/// Removes the container if the run future is dropped before it settles.
///
/// Killing the local runtime client does not stop the container, so a
/// request cancelled mid-run would otherwise leave MRIQC running on a
/// workspace that is about to be deleted.
struct AbortOnDrop {
    runner: Arc<dyn AnalysisRunner>,
    invocation: Option<MriqcInvocation>,
    started: Instant,
}

impl AbortOnDrop {
    fn new(runner: Arc<dyn AnalysisRunner>, invocation: MriqcInvocation) -> Self {
        Self {
            runner,
            invocation: Some(invocation),
            started: Instant::now(),
        }
    }

    fn disarm(&mut self) {
        self.invocation = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        let Some(invocation) = self.invocation.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container = %invocation.container_name, "No runtime to remove abandoned container");
            return;
        };

        warn!(container = %invocation.container_name, "MRIQC run abandoned, removing container");
        metrics::record_run("cancelled", self.started.elapsed());
        let runner = self.runner.clone();
        handle.spawn(async move {
            if let Err(e) = runner.abort(&invocation).await {
                warn!(error = %e, "Cleanup after cancellation failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{MockAnalysisRunner, RunOutcome};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use zip::write::FileOptions;

    fn outcome(exit_code: i32, stderr: &str) -> RunOutcome {
        RunOutcome {
            exit_code,
            stderr: stderr.to_string(),
            duration: Duration::from_millis(5),
        }
    }

    fn label(raw: &str) -> ParticipantLabel {
        ParticipantLabel::parse(raw).unwrap()
    }

    fn workspace_with_upload(root: &std::path::Path, files: &[&str]) -> RequestWorkspace {
        let workspace = RequestWorkspace::create(root).unwrap();
        let mut zip = zip::ZipWriter::new(std::fs::File::create(workspace.upload_path()).unwrap());
        for name in files {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(b"data").unwrap();
        }
        zip.finish().unwrap();
        workspace
    }

    #[tokio::test]
    async fn test_success_packs_runner_output() {
        let root = tempfile::tempdir().unwrap();
        let workspace = workspace_with_upload(root.path(), &["ds001/sub-01/anat/sub-01_T1w.nii.gz"]);

        let mut runner = MockAnalysisRunner::new();
        runner
            .expect_run()
            .withf(|inv| inv.participant_label.as_str() == "07" && inv.bids_root.ends_with("ds001"))
            .times(1)
            .returning(|inv| {
                std::fs::write(inv.output_dir.join("sub-07_T1w.json"), b"{\"cjv\": 0.4}").unwrap();
                Ok(outcome(0, ""))
            });
        runner.expect_abort().times(0);

        let pipeline = Pipeline::new(Arc::new(runner), Duration::from_secs(5));
        let output = pipeline.run(&workspace, label("07")).await.unwrap();

        assert_eq!(output.result.entries, 1);
        let mut zip = zip::ZipArchive::new(std::fs::File::open(&output.result_path).unwrap()).unwrap();
        let mut contents = String::new();
        zip.by_name("sub-07_T1w.json").unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "{\"cjv\": 0.4}");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_analysis_failure() {
        let root = tempfile::tempdir().unwrap();
        let workspace = workspace_with_upload(root.path(), &["ds001/dataset_description.json"]);

        let mut runner = MockAnalysisRunner::new();
        runner.expect_run().returning(|_| Ok(outcome(1, "boom")));

        let pipeline = Pipeline::new(Arc::new(runner), Duration::from_secs(5));
        let err = pipeline.run(&workspace, label("01")).await.unwrap_err();

        match err {
            PipelineError::AnalysisFailed { exit_code, stderr } => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!workspace.result_path().exists());
    }

    #[tokio::test]
    async fn test_flat_archive_never_reaches_runner() {
        let root = tempfile::tempdir().unwrap();
        let workspace = workspace_with_upload(root.path(), &["participants.tsv"]);

        let mut runner = MockAnalysisRunner::new();
        runner.expect_run().times(0);

        let pipeline = Pipeline::new(Arc::new(runner), Duration::from_secs(5));
        let err = pipeline.run(&workspace, label("01")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Root(RootError::NotFound)));
        assert_eq!(err.to_string(), "No BIDS directory found after unzipping.");
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let workspace = RequestWorkspace::create(root.path()).unwrap();
        std::fs::write(workspace.upload_path(), b"PK\x03\x04 truncated").unwrap();

        let mut runner = MockAnalysisRunner::new();
        runner.expect_run().times(0);

        let pipeline = Pipeline::new(Arc::new(runner), Duration::from_secs(5));
        let err = pipeline.run(&workspace, label("01")).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArchive(_)));
        assert!(err.to_string().starts_with("Invalid BIDS zip: "));
    }

    #[tokio::test]
    async fn test_runner_error_is_propagated() {
        let root = tempfile::tempdir().unwrap();
        let workspace = workspace_with_upload(root.path(), &["ds001/dataset_description.json"]);

        let mut runner = MockAnalysisRunner::new();
        runner.expect_run().returning(|_| {
            Err(RunnerError::Spawn {
                runtime: "docker".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            })
        });

        let pipeline = Pipeline::new(Arc::new(runner), Duration::from_secs(5));
        let err = pipeline.run(&workspace, label("01")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Runner(RunnerError::Spawn { .. })));
    }

    /// Runner that either never finishes or fails straight away
    #[derive(Default)]
    struct StubRunner {
        fails: bool,
        aborted: AtomicBool,
    }

    #[async_trait]
    impl AnalysisRunner for StubRunner {
        async fn run(&self, _invocation: &MriqcInvocation) -> Result<RunOutcome, RunnerError> {
            if self.fails {
                return Ok(outcome(2, "bad header"));
            }
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(outcome(0, ""))
        }

        async fn abort(&self, _invocation: &MriqcInvocation) -> Result<(), RunnerError> {
            self.aborted.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn version(&self) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn test_deadline_aborts_container() {
        let root = tempfile::tempdir().unwrap();
        let workspace = workspace_with_upload(root.path(), &["ds001/dataset_description.json"]);

        let runner = Arc::new(StubRunner::default());
        let pipeline = Pipeline::new(runner.clone(), Duration::from_millis(50));
        let err = pipeline.run(&workspace, label("01")).await.unwrap_err();

        assert!(matches!(err, PipelineError::TimedOut(_)));
        assert!(runner.aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_run_aborts_container() {
        let root = tempfile::tempdir().unwrap();
        let workspace = workspace_with_upload(root.path(), &["ds001/dataset_description.json"]);

        let runner = Arc::new(StubRunner::default());
        let pipeline = Pipeline::new(runner.clone(), Duration::from_secs(3600));

        // Dropping the future is what happens when the client goes away
        let cancelled =
            tokio::time::timeout(Duration::from_millis(200), pipeline.run(&workspace, label("01"))).await;
        assert!(cancelled.is_err());

        for _ in 0..50 {
            if runner.aborted.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(runner.aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_finished_run_is_not_aborted() {
        let root = tempfile::tempdir().unwrap();
        let workspace = workspace_with_upload(root.path(), &["ds001/dataset_description.json"]);

        let runner = Arc::new(StubRunner {
            fails: true,
            ..StubRunner::default()
        });
        let pipeline = Pipeline::new(runner.clone(), Duration::from_secs(5));
        let err = pipeline.run(&workspace, label("01")).await.unwrap_err();
        assert!(matches!(err, PipelineError::AnalysisFailed { exit_code: 2, .. }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!runner.aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_archive_named_like_the_upload_extracts_cleanly() {
        let root = tempfile::tempdir().unwrap();
        let workspace = RequestWorkspace::create(root.path()).unwrap();

        let filler: Vec<u8> = (0..200 * 1024u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        let mut zip = zip::ZipWriter::new(std::fs::File::create(workspace.upload_path()).unwrap());
        zip.start_file("ds001/dataset_description.json", options).unwrap();
        zip.write_all(b"{}").unwrap();
        zip.start_file(crate::workspace::UPLOAD_FILE_NAME, options).unwrap();
        zip.write_all(&filler).unwrap();
        zip.start_file("ds001/sub-01/anat/sub-01_T1w.nii", options).unwrap();
        zip.write_all(b"nifti").unwrap();
        zip.finish().unwrap();

        let mut runner = MockAnalysisRunner::new();
        runner
            .expect_run()
            .withf(|inv| inv.bids_root.join("sub-01/anat/sub-01_T1w.nii").is_file())
            .times(1)
            .returning(|inv| {
                std::fs::write(inv.output_dir.join("sub-01_T1w.json"), b"{}").unwrap();
                Ok(outcome(0, ""))
            });

        let pipeline = Pipeline::new(Arc::new(runner), Duration::from_secs(5));
        let output = pipeline.run(&workspace, label("01")).await.unwrap();
        assert_eq!(output.result.entries, 1);
    }
}
