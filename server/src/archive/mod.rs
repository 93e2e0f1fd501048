//! Zip extraction and packing
//!
//! Both operations are blocking and are meant to run on the blocking pool.
//! Packing is deterministic: entries are written in sorted order with a fixed
//! timestamp, so the same directory contents always produce the same bytes.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Archive codec errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("{0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("failed to walk {path}: {source}")]
    Walk { path: PathBuf, source: walkdir::Error },

    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Summary of a finished extraction or pack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    pub entries: usize,
    pub bytes: u64,
}

/// Extract `archive` into `dest`.
///
/// Entries whose names would land outside `dest` make the whole archive
/// invalid.
pub fn extract(archive: &Path, dest: &Path) -> Result<ArchiveStats, ArchiveError> {
    let file = File::open(archive).map_err(|source| ArchiveError::Open {
        path: archive.to_path_buf(),
        source,
    })?;
    let bytes = file.metadata()?.len();

    let mut zip = ZipArchive::new(BufReader::new(file))?;
    let entries = zip.len();
    zip.extract(dest)?;

    debug!(archive = %archive.display(), entries, bytes, "Archive extracted");
    Ok(ArchiveStats { entries, bytes })
}

/// Pack the contents of `src` (not `src` itself) into a zip at `dest`,
/// replacing any file already there.
pub fn pack(src: &Path, dest: &Path) -> Result<ArchiveStats, ArchiveError> {
    let file = File::create(dest).map_err(|source| ArchiveError::Open {
        path: dest.to_path_buf(),
        source,
    })?;
    let mut zip = ZipWriter::new(BufWriter::new(file));

    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);
    let dir_options = options.unix_permissions(0o755);

    let mut entries = 0;
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|source| ArchiveError::Walk {
            path: src.to_path_buf(),
            source,
        })?;

        let Some(name) = entry_name(src, entry.path()) else {
            continue;
        };

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{name}/"), dir_options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut input = File::open(entry.path())?;
            io::copy(&mut input, &mut zip)?;
        } else {
            // Symlinks and special files are not part of MRIQC output
            debug!(path = %entry.path().display(), "Skipping non-regular file");
            continue;
        }
        entries += 1;
    }

    let mut writer = zip.finish()?;
    io::Write::flush(&mut writer)?;
    drop(writer);

    let bytes = std::fs::metadata(dest)?.len();
    debug!(dest = %dest.display(), entries, bytes, "Archive packed");
    Ok(ArchiveStats { entries, bytes })
}

/// Archive entry name for `path`, relative to `root` with `/` separators
fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
