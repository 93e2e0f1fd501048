//! MRIQC run handler

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{multipart::MultipartError, multipart::MultipartRejection, Multipart, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, Instrument};

use crate::api::ApiError;
use crate::models::ParticipantLabel;
use crate::workspace::{RequestWorkspace, RESULT_FILE_NAME};
use crate::AppState;

/// Multipart field carrying the dataset archive
const ARCHIVE_FIELD: &str = "bids_zip";

/// Form field carrying the subject label
const LABEL_FIELD: &str = "participant_label";

const NO_UPLOAD: &str = "No BIDS zip provided";

/// What the multipart form contained
#[derive(Debug, Default)]
struct Upload {
    archive_bytes: u64,
    participant_label: Option<String>,
}

/// Run MRIQC on an uploaded BIDS archive and return the results as a zip
pub async fn run_mriqc(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let span = tracing::info_span!("run_mriqc", request_id = %request_id);

    handle(state, multipart).instrument(span).await
}

async fn handle(
    state: Arc<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    // A body that is not a multipart form cannot carry the archive
    let mut multipart = multipart.map_err(|_| ApiError::BadRequest(NO_UPLOAD.into()))?;

    let scratch_root = state.config.scratch_root();
    let workspace = tokio::task::spawn_blocking(move || RequestWorkspace::create(&scratch_root))
        .await
        .context("Workspace task failed")?
        .context("Failed to create request workspace")?;

    let upload = receive_upload(&mut multipart, &workspace).await?;
    if upload.archive_bytes == 0 {
        return Err(ApiError::BadRequest(NO_UPLOAD.into()));
    }
    crate::metrics::record_upload(upload.archive_bytes);

    let label = match upload.participant_label.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => ParticipantLabel::parse(raw),
        _ => ParticipantLabel::parse(&state.config.mriqc.default_participant_label),
    }
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    info!(
        participant_label = %label,
        upload_bytes = upload.archive_bytes,
        workspace = %workspace.path().display(),
        "BIDS archive received"
    );

    let output = state.pipeline.run(&workspace, label).await?;
    let digest = sha256_file(&output.result_path).await?;

    let file = tokio::fs::File::open(&output.result_path)
        .await
        .context("Failed to open result archive")?;
    crate::metrics::record_result(output.result.bytes);

    // The workspace rides along with the body and is deleted once the
    // download finishes or the client goes away
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _workspace = &workspace;
        chunk
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", RESULT_FILE_NAME),
        )
        .header(header::CONTENT_LENGTH, output.result.bytes)
        .header("x-content-sha256", digest)
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(format!("Failed to build response: {e}")))
}

/// Stream the form into the workspace. The archive goes straight to disk.
async fn receive_upload(
    multipart: &mut Multipart,
    workspace: &RequestWorkspace,
) -> Result<Upload, ApiError> {
    let mut upload = Upload::default();

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            ARCHIVE_FIELD => {
                let path = workspace.upload_path();
                let mut file = tokio::fs::File::create(&path)
                    .await
                    .context("Failed to store uploaded archive")?;

                let mut written = 0u64;
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    file.write_all(&chunk)
                        .await
                        .context("Failed to store uploaded archive")?;
                    written += chunk.len() as u64;
                }
                file.flush().await.context("Failed to store uploaded archive")?;
                upload.archive_bytes = written;
            }
            LABEL_FIELD => {
                upload.participant_label = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }

    Ok(upload)
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge
    } else {
        ApiError::BadRequest(err.body_text())
    }
}

/// Hex SHA-256 of a file, computed on the blocking pool
async fn sha256_file(path: &Path) -> Result<String, ApiError> {
    let path = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .context("Checksum task failed")?
    .context("Failed to checksum result archive")?;

    Ok(digest)
}
