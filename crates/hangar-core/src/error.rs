//! Error types for the engine acquisition and supervision subsystem.
//!
//! Every terminal failure carries a stable classification plus enough context
//! (candidate URL, expected/actual hash, missing files) to drive a
//! user-facing remediation flow.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for hangar-core.
#[derive(Debug, Error)]
pub enum HangarError {
    // Catalog / registry lookups
    #[error("Engine not found: {id}")]
    EngineNotFound { id: String },

    #[error("Engine already installed: {id}")]
    AlreadyInstalled { id: String },

    #[error("Another install/repair/remove operation is already running for {id}")]
    AlreadyInProgress { id: String },

    #[error("Engine is not installed: {id}")]
    NotInstalled { id: String },

    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Not found at {url} (HTTP {status})")]
    SourceNotFound { url: String, status: u16 },

    #[error("Download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("All download candidates exhausted for {id}: {summary}")]
    AllCandidatesFailed { id: String, summary: String },

    #[error("Checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Insufficient disk space at {path}: need {needed} bytes, {available} available")]
    InsufficientDisk {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("Archive extraction failed: {message}")]
    ExtractFailed { message: String },

    #[error("Install incomplete for {id}: missing {missing:?}")]
    InstallIncomplete { id: String, missing: Vec<String> },

    // Manifest errors
    #[error("Invalid manifest: {message}")]
    InvalidManifest { message: String },

    #[error("Manifest entry not found: {id}")]
    ManifestEntryNotFound { id: String },

    // Database errors
    #[error("Registry error: {message}")]
    Registry {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Process lifecycle errors
    #[error("Failed to spawn {id}: {message}")]
    SpawnFailed { id: String, message: String },

    #[error("Engine {id} never passed its health check")]
    HealthCheckTimeout { id: String },

    #[error("Engine not running: {id}")]
    NotRunning { id: String },

    // Cancellation
    #[error("Operation cancelled")]
    Cancelled,

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias for hangar-core operations.
pub type Result<T> = std::result::Result<T, HangarError>;

impl From<std::io::Error> for HangarError {
    fn from(err: std::io::Error) -> Self {
        HangarError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for HangarError {
    fn from(err: serde_json::Error) -> Self {
        HangarError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for HangarError {
    fn from(err: rusqlite::Error) -> Self {
        HangarError::Registry {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for HangarError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HangarError::Timeout(std::time::Duration::from_secs(0))
        } else {
            HangarError::Network {
                cause: Some(err.to_string()),
                message: err.to_string(),
            }
        }
    }
}

impl HangarError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        HangarError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Check if this error should trigger a retry on the same candidate.
    ///
    /// Permanent conditions (404, checksum mismatch, disk failure,
    /// cancellation) must advance to the next candidate or abort instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HangarError::Network { .. }
                | HangarError::Timeout(_)
                | HangarError::DownloadFailed { .. }
        )
    }

    /// Suggested remediation for user-facing surfaces, when one exists.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            HangarError::Network { .. }
            | HangarError::Timeout(_)
            | HangarError::AllCandidatesFailed { .. } => {
                Some("Check your network connection, or supply a custom download URL or local file")
            }
            HangarError::ChecksumMismatch { .. } => {
                Some("The downloaded file is corrupt or the mirror is stale; retry or supply a custom URL")
            }
            HangarError::InsufficientDisk { .. } => Some("Free disk space and retry"),
            HangarError::Io { .. } => Some("Check filesystem permissions and free space"),
            HangarError::AlreadyInstalled { .. } => {
                Some("Remove the existing install before reinstalling")
            }
            HangarError::InstallIncomplete { .. } => Some("Run repair to re-fetch missing files"),
            _ => None,
        }
    }
}
