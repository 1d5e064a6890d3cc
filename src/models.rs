//! Data models for archived articles and upload runs.
//!
//! - [`ArticleRecord`]: one row of the progress store
//! - [`UploadStatus`]: lifecycle state of a record
//! - [`ContainerId`]: monthly Internet Archive item identifier
//! - [`UploadTask`]: ephemeral unit of work handed to a worker
//! - [`RunSummary`]: aggregate counts reported at the end of every run

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Article pages live at `.../<YYYYMMDD>/<article-code>.htm`.
static ARTICLE_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(\d{8})/([A-Za-z0-9][A-Za-z0-9_.-]*\.htm)$").unwrap());

/// Lifecycle of an [`ArticleRecord`].
///
/// ```text
/// pending -> uploaded -> verified
///        \-> failed  -> (retried) uploaded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Verified,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Verified => "verified",
            UploadStatus::Failed => "failed",
        }
    }

    /// True once the object is known to be in the remote store.
    pub fn is_success(&self) -> bool {
        matches!(self, UploadStatus::Uploaded | UploadStatus::Verified)
    }

    /// Whether a record in this state may move to `next`.
    ///
    /// Successful states never regress, and `verified` is only reachable
    /// from `uploaded`. A `failed` record may be attempted again.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (Pending, Pending | Uploaded | Failed) => true,
            (Failed, Pending | Uploaded | Failed) => true,
            (Uploaded, Uploaded | Verified) => true,
            (Verified, Verified) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "uploaded" => Ok(UploadStatus::Uploaded),
            "verified" => Ok(UploadStatus::Verified),
            "failed" => Ok(UploadStatus::Failed),
            other => Err(format!("unknown upload status '{other}'")),
        }
    }
}

impl ToSql for UploadStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for UploadStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Identifier of a monthly container (an Internet Archive "item").
///
/// Derived from `(prefix, year, month)` only, so every article of a month
/// lands in the same item and keeps each item well under the per-item file
/// limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn for_month(prefix: &str, year: i32, month: u32) -> Self {
        ContainerId(format!("{prefix}-{year:04}-{month:02}"))
    }

    pub fn for_date(prefix: &str, date: NaiveDate) -> Self {
        Self::for_month(prefix, date.year(), date.month())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ContainerId {
    fn from(s: String) -> Self {
        ContainerId(s)
    }
}

/// One row of the progress store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticleRecord {
    pub url: String,
    pub date: NaiveDate,
    pub container_id: ContainerId,
    pub object_key: String,
    pub status: UploadStatus,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
}

/// A single article to fetch and upload. Owned by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub url: String,
    pub date: NaiveDate,
    pub container: ContainerId,
    /// `YYYYMMDD/<article-code>.htm`
    pub object_key: String,
}

impl UploadTask {
    /// Build a task from an article URL, deriving date, container and key
    /// from the `<YYYYMMDD>/<article-code>.htm` tail of its path.
    ///
    /// Returns `None` for URLs that do not follow the per-date layout.
    pub fn from_url(url: &str, prefix: &str) -> Option<Self> {
        let path = match url::Url::parse(url) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => return None,
        };
        let caps = ARTICLE_PATH_RE.captures(&path)?;
        let date_str = caps.get(1)?.as_str();
        let code = caps.get(2)?.as_str();
        let date = NaiveDate::parse_from_str(date_str, "%Y%m%d").ok()?;

        Some(UploadTask {
            url: url.to_string(),
            date,
            container: ContainerId::for_date(prefix, date),
            object_key: format!("{date_str}/{code}"),
        })
    }
}

/// Final outcome of one URL in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlOutcome {
    /// Uploaded, verification disabled.
    Uploaded,
    /// Uploaded and seen in the remote metadata.
    Verified,
    /// Uploaded, but not visible before the verification ceiling.
    Unverified,
    Failed,
}

/// Aggregate counts for a run, printed at the end even on partial failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub dates_processed: usize,
    pub discovery_failures: usize,
    pub discovered: usize,
    /// Already done according to the progress store.
    pub skipped: usize,
    /// Uploaded in this run (verified or not).
    pub succeeded: usize,
    pub verified: usize,
    pub unverified: usize,
    pub failed: usize,
    /// Dispatched but never started because the run was interrupted.
    pub not_attempted: usize,
    pub cancelled: bool,
    pub elapsed_ms: u128,
}

impl RunSummary {
    pub fn record(&mut self, outcome: UrlOutcome) {
        match outcome {
            UrlOutcome::Uploaded => self.succeeded += 1,
            UrlOutcome::Verified => {
                self.succeeded += 1;
                self.verified += 1;
            }
            UrlOutcome::Unverified => {
                self.succeeded += 1;
                self.unverified += 1;
            }
            UrlOutcome::Failed => self.failed += 1,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let range = match (self.start_date, self.end_date) {
            (Some(s), Some(e)) => format!("{s} .. {e}"),
            _ => "-".to_string(),
        };
        writeln!(f, "Archive run summary ({range})")?;
        writeln!(f, "  dates processed : {}", self.dates_processed)?;
        writeln!(f, "  discovered      : {}", self.discovered)?;
        writeln!(f, "  succeeded       : {}", self.succeeded)?;
        if self.verified + self.unverified > 0 {
            writeln!(
                f,
                "    verified      : {} (unverified: {})",
                self.verified, self.unverified
            )?;
        }
        writeln!(f, "  failed          : {}", self.failed)?;
        writeln!(f, "  skipped         : {}", self.skipped)?;
        if self.discovery_failures > 0 {
            writeln!(f, "  discovery errors: {}", self.discovery_failures)?;
        }
        if self.cancelled {
            writeln!(f, "  interrupted     : {} not attempted", self.not_attempted)?;
        }
        write!(f, "  elapsed         : {} ms", self.elapsed_ms)
    }
}
