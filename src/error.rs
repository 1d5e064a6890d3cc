//! Error taxonomy for the archiver.
//!
//! Every failure the pipeline can observe is mapped into [`ArchiveError`] at
//! the boundary where it happens (HTTP status, SQLite error, I/O). Two
//! predicates drive propagation:
//!
//! - [`ArchiveError::is_fatal`]: the run must stop (bad credentials, a broken
//!   progress store, an unwritable working directory).
//! - [`ArchiveError::is_transient`]: the operation may succeed if repeated
//!   and is eligible for [`crate::retry::RetryPolicy`].
//!
//! Anything else is a per-URL failure that ends up as a `failed` record.

use crate::models::{RunSummary, UploadStatus};
use std::fmt;
use thiserror::Error;

/// Errors produced by discovery, upload, verification and the progress store.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Credentials were refused by the remote endpoint.
    #[error("authentication rejected by {endpoint} (HTTP {status})")]
    Auth { endpoint: String, status: u16 },

    /// Network error, timeout, 5xx or throttling response.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A request that could not be built or a response body that could not be decoded.
    #[error("request error: {0}")]
    Request(String),

    /// The object already exists with different content.
    #[error("object {key} already exists in {container} with different content")]
    Conflict { container: String, key: String },

    /// Any other non-success response from the remote store.
    #[error("request rejected with HTTP {status} ({code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    /// The article does not exist at the source (404, or a redirect to the error page).
    #[error("article not found at {url} (HTTP {status})")]
    NotFound { url: String, status: u16 },

    #[error("discovery failed for {date}: {reason}")]
    Discovery { date: String, reason: String },

    #[error("{key} in {container} not visible after {attempts} verification attempts")]
    VerificationTimeout {
        container: String,
        key: String,
        attempts: u32,
    },

    #[error("progress store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("invalid status transition for {url}: {from} -> {to}")]
    InvalidTransition {
        url: String,
        from: UploadStatus,
        to: UploadStatus,
    },

    #[error("health check failed: {0}")]
    HealthCheck(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid metadata header: {0}")]
    InvalidMetadata(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl ArchiveError {
    /// Errors that abort the whole run rather than a single URL.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ArchiveError::Auth { .. } | ArchiveError::Store(_) | ArchiveError::Io(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ArchiveError::Transient(_))
    }

    /// Whether a SQLite error is lock contention that is worth retrying.
    pub fn is_store_busy(&self) -> bool {
        match self {
            ArchiveError::Store(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ArchiveError {
    fn from(e: reqwest::Error) -> Self {
        // Statuses are decoded by the callers. Builder and decode errors repeat
        // identically on every attempt.
        if e.is_builder() || e.is_decode() {
            ArchiveError::Request(e.to_string())
        } else if e.is_timeout() {
            ArchiveError::Transient(format!("timed out: {e}"))
        } else {
            ArchiveError::Transient(e.to_string())
        }
    }
}

/// Stage of a single upload attempt, recorded in `error_detail` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetching,
    Uploading,
    Verifying,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Fetching => "fetching",
            Stage::Uploading => "uploading",
            Stage::Verifying => "verifying",
        };
        f.write_str(s)
    }
}

/// A run terminated by a fatal error, with whatever was achieved before it.
#[derive(Debug, Error)]
#[error("run aborted: {error}")]
pub struct Aborted {
    pub summary: RunSummary,
    #[source]
    pub error: ArchiveError,
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;
