//! Per-request scratch space
//!
//! Every request gets its own directory under the scratch root, holding the
//! uploaded archive, the extracted dataset, MRIQC's output and the result
//! archive. The directory is deleted when the `RequestWorkspace` is dropped.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

/// File name the uploaded archive is stored under
pub const UPLOAD_FILE_NAME: &str = "bids_data.zip";

/// File name of the archive returned to the caller
pub const RESULT_FILE_NAME: &str = "mriqc_results.zip";

/// Entries in the extracted tree that are never a dataset root
const IGNORED_ROOTS: &[&str] = &["__MACOSX"];

/// Scratch directories owned by a single request
#[derive(Debug)]
pub struct RequestWorkspace {
    dir: TempDir,
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl RequestWorkspace {
    /// Create a fresh workspace with empty `upload/` and `output/` directories
    pub fn create(scratch_root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(scratch_root)?;
        let dir = tempfile::Builder::new()
            .prefix("mriqc-")
            .tempdir_in(scratch_root)?;

        let upload_dir = dir.path().join("upload");
        let output_dir = dir.path().join("output");
        std::fs::create_dir(&upload_dir)?;
        std::fs::create_dir(&output_dir)?;

        // The container may write as a different uid than ours
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&output_dir, std::fs::Permissions::from_mode(0o777))?;
        }

        debug!(path = %dir.path().display(), "Workspace created");
        Ok(Self {
            dir,
            upload_dir,
            output_dir,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Directory the upload is extracted into
    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Directory mounted read-write as MRIQC's output
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Stored beside `upload/`, never inside it, so no archive entry can overwrite it
    pub fn upload_path(&self) -> PathBuf {
        self.dir.path().join(UPLOAD_FILE_NAME)
    }

    pub fn result_path(&self) -> PathBuf {
        self.dir.path().join(RESULT_FILE_NAME)
    }
}

/// Why no dataset root could be chosen
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RootError {
    #[error("No BIDS directory found after unzipping.")]
    NotFound,

    #[error("Multiple BIDS directories found after unzipping: {}", .0.join(", "))]
    Multiple(Vec<String>),

    #[error("Failed to scan extracted archive: {0}")]
    Io(String),
}

/// Find the single top-level directory of an extracted archive.
///
/// Hidden entries and archiver metadata (`__MACOSX`) are skipped.
pub async fn find_bids_root(dir: &Path) -> Result<PathBuf, RootError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| RootError::Io(e.to_string()))?;

    let mut candidates = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| RootError::Io(e.to_string()))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || IGNORED_ROOTS.contains(&name.as_str()) {
            continue;
        }

        let file_type = entry
            .file_type()
            .await
            .map_err(|e| RootError::Io(e.to_string()))?;
        if file_type.is_dir() {
            candidates.push((name, entry.path()));
        }
    }

    match candidates.len() {
        0 => Err(RootError::NotFound),
        1 => Ok(candidates.remove(0).1),
        _ => {
            let mut names: Vec<String> = candidates.into_iter().map(|(name, _)| name).collect();
            names.sort();
            Err(RootError::Multiple(names))
        }
    }
}
