//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;
use crate::pipeline::PipelineError;
use crate::workspace::RootError;

/// API error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("MRIQC failed")]
    AnalysisFailed { stderr: String },

    #[error("MRIQC timed out after {0} seconds")]
    Timeout(u64),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::AnalysisFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        crate::metrics::record_rejection(status);

        let body = match self {
            ApiError::AnalysisFailed { stderr } => {
                ErrorResponse::new("MRIQC failed").with_stderr(stderr)
            }
            other => ErrorResponse::new(other.to_string()),
        };

        (status, Json(body)).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidArchive(_)
            | PipelineError::Root(RootError::NotFound)
            | PipelineError::Root(RootError::Multiple(_)) => ApiError::BadRequest(err.to_string()),
            PipelineError::AnalysisFailed { stderr, .. } => ApiError::AnalysisFailed { stderr },
            PipelineError::TimedOut(limit) => ApiError::Timeout(limit.as_secs()),
            other => {
                tracing::error!(error = %other, "Pipeline error");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "Internal error");
        ApiError::Internal(format!("{err:#}"))
    }
}
