//! Data models for the MRIQC gateway
//!
//! Wire types shared by the handlers and the CLI, plus the validated
//! participant label that ends up on the container command line.

use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Participant label
// ============================================================================

/// BIDS subject label, optionally prefixed with `sub-`
static LABEL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(sub-)?[A-Za-z0-9]+$").expect("static regex"));

/// Rejected participant label
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid participant_label: {0}")]
pub struct InvalidLabel(pub String);

/// Participant label that is safe to hand to MRIQC as a single argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantLabel(String);

impl ParticipantLabel {
    pub fn parse(raw: &str) -> Result<Self, InvalidLabel> {
        let trimmed = raw.trim();
        if trimmed.len() > 64 || !LABEL_PATTERN.is_match(trimmed) {
            return Err(InvalidLabel(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            stderr: None,
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub runtime_version: Option<String>,
    pub image: String,
}

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_label_accepts_bids_subjects() {
        assert_eq!(ParticipantLabel::parse("01").unwrap().as_str(), "01");
        assert_eq!(ParticipantLabel::parse("sub-A12").unwrap().as_str(), "sub-A12");
        assert_eq!(ParticipantLabel::parse(" 02 ").unwrap().as_str(), "02");
    }

    #[test]
    fn test_label_rejects_shell_significant_input() {
        for raw in ["", "01 02", "01;ls", "$(id)", "../01", "sub-", "a-b", "01\t02"] {
            assert!(ParticipantLabel::parse(raw).is_err(), "accepted {raw:?}");
        }
        let too_long = "a".repeat(65);
        assert!(ParticipantLabel::parse(&too_long).is_err());
    }

    #[test]
    fn test_error_response_omits_missing_stderr() {
        let body = serde_json::to_value(ErrorResponse::new("No BIDS zip provided")).unwrap();
        assert_eq!(body, serde_json::json!({"error": "No BIDS zip provided"}));

        let body =
            serde_json::to_value(ErrorResponse::new("MRIQC failed").with_stderr("boom")).unwrap();
        assert_eq!(body, serde_json::json!({"error": "MRIQC failed", "stderr": "boom"}));
    }
}
