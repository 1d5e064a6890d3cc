//! Run configuration.
//!
//! [`ArchiveConfig`] is assembled once at startup from the [`Cli`] and an
//! optional YAML file, validated, and then shared read-only (behind an `Arc`)
//! with every component. Precedence is CLI/env first, then the file, then
//! the defaults below.

use crate::cli::Cli;
use crate::error::{ArchiveError, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument};
use url::Url;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_PREFIX: &str = "mingpao-canada-news";
pub const DEFAULT_WORK_DIR: &str = "./data";
pub const DEFAULT_S3_ENDPOINT: &str = "https://s3.us.archive.org";
pub const DEFAULT_METADATA_ENDPOINT: &str = "https://archive.org/metadata";
/// Plain HTTP: the source serves an invalid HTTPS certificate.
pub const DEFAULT_SOURCE_BASE_URL: &str = "http://www.mingpaocanada.com/tor";
pub const DEFAULT_VERIFY_ATTEMPTS: u32 = 3;
pub const DEFAULT_FETCH_RETRIES: u32 = 3;

/// Keys accepted in the YAML file given with `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub workers: Option<usize>,
    pub verify: Option<bool>,
    pub verify_attempts: Option<u32>,
    pub container_prefix: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub work_dir: Option<String>,
    pub retry_failed: Option<bool>,
    pub s3_endpoint: Option<String>,
    pub metadata_endpoint: Option<String>,
    pub source_base_url: Option<String>,
    pub fetch_timeout_secs: Option<u64>,
    pub put_timeout_secs: Option<u64>,
    pub verify_timeout_secs: Option<u64>,
    pub fetch_retries: Option<u32>,
}

impl FileConfig {
    #[instrument(level = "info")]
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: FileConfig = serde_yaml::from_str(&raw)?;
        info!(path, "Loaded configuration file");
        Ok(parsed)
    }
}

/// IA S3 key pair. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    /// Value of the `Authorization` header understood by IA S3.
    pub fn authorization(&self) -> String {
        format!("LOW {}:{}", self.access_key, self.secret_key)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// What a `failed` record means for the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedPolicy {
    /// Failed URLs are attempted again.
    Retry,
    /// Failed URLs count as done until explicitly reset.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub fetch: Duration,
    pub put: Duration,
    pub verify: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fetch: Duration::from_secs(30),
            put: Duration::from_secs(120),
            verify: Duration::from_secs(15),
        }
    }
}

/// Immutable settings for one run.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub workers: usize,
    pub verify: bool,
    pub verify_attempts: u32,
    pub container_prefix: String,
    pub credentials: Credentials,
    pub work_dir: PathBuf,
    pub failed_policy: FailedPolicy,
    pub reset_failed: bool,
    pub reset_urls: Vec<String>,
    pub skip_health_check: bool,
    pub s3_endpoint: String,
    pub metadata_endpoint: String,
    pub source_base_url: String,
    pub timeouts: Timeouts,
    pub fetch_retries: u32,
}

impl ArchiveConfig {
    /// Build the configuration from CLI arguments, reading `--config` if given.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    /// Merge CLI values over file values over defaults, then validate.
    pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Self> {
        let start_raw = cli
            .start_date
            .clone()
            .or(file.start_date)
            .ok_or_else(|| ArchiveError::Config("a start date is required".into()))?;
        let start_date = parse_date(&start_raw)?;
        let end_date = match cli.end_date.clone().or(file.end_date) {
            Some(raw) => parse_date(&raw)?,
            None => start_date,
        };

        let access_key = cli.access_key.clone().or(file.access_key).unwrap_or_default();
        let secret_key = cli.secret_key.clone().or(file.secret_key).unwrap_or_default();

        let default_timeouts = Timeouts::default();
        let secs_or = |cli: Option<u64>, file: Option<u64>, default: Duration| {
            cli.or(file).map(Duration::from_secs).unwrap_or(default)
        };

        let retry_failed = if cli.no_retry_failed {
            false
        } else {
            file.retry_failed.unwrap_or(true)
        };

        let config = ArchiveConfig {
            start_date,
            end_date,
            workers: cli.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS),
            verify: cli.verify || file.verify.unwrap_or(false),
            verify_attempts: cli
                .verify_attempts
                .or(file.verify_attempts)
                .unwrap_or(DEFAULT_VERIFY_ATTEMPTS),
            container_prefix: cli
                .prefix
                .clone()
                .or(file.container_prefix)
                .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            credentials: Credentials {
                access_key,
                secret_key,
            },
            work_dir: PathBuf::from(
                cli.work_dir
                    .clone()
                    .or(file.work_dir)
                    .unwrap_or_else(|| DEFAULT_WORK_DIR.to_string()),
            ),
            failed_policy: if retry_failed {
                FailedPolicy::Retry
            } else {
                FailedPolicy::Skip
            },
            reset_failed: cli.reset_failed,
            reset_urls: cli.reset_urls.clone(),
            skip_health_check: cli.skip_health_check,
            s3_endpoint: trim_base(
                cli.s3_endpoint.clone().or(file.s3_endpoint),
                DEFAULT_S3_ENDPOINT,
            ),
            metadata_endpoint: trim_base(
                cli.metadata_endpoint.clone().or(file.metadata_endpoint),
                DEFAULT_METADATA_ENDPOINT,
            ),
            source_base_url: trim_base(
                cli.source_base_url.clone().or(file.source_base_url),
                DEFAULT_SOURCE_BASE_URL,
            ),
            timeouts: Timeouts {
                fetch: secs_or(cli.fetch_timeout_secs, file.fetch_timeout_secs, default_timeouts.fetch),
                put: secs_or(cli.put_timeout_secs, file.put_timeout_secs, default_timeouts.put),
                verify: secs_or(
                    cli.verify_timeout_secs,
                    file.verify_timeout_secs,
                    default_timeouts.verify,
                ),
            },
            fetch_retries: cli
                .fetch_retries
                .or(file.fetch_retries)
                .unwrap_or(DEFAULT_FETCH_RETRIES),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.start_date > self.end_date {
            return Err(ArchiveError::Config(format!(
                "start date {} is after end date {}",
                self.start_date, self.end_date
            )));
        }
        if self.workers == 0 {
            return Err(ArchiveError::Config("workers must be at least 1".into()));
        }
        if self.verify_attempts == 0 {
            return Err(ArchiveError::Config(
                "verify attempts must be at least 1".into(),
            ));
        }
        if self.credentials.access_key.is_empty() || self.credentials.secret_key.is_empty() {
            return Err(ArchiveError::Config(
                "IA credentials are required (--access-key/--secret-key or IA_ACCESS_KEY/IA_SECRET_KEY)"
                    .into(),
            ));
        }
        for (name, value) in [
            ("s3 endpoint", &self.s3_endpoint),
            ("metadata endpoint", &self.metadata_endpoint),
            ("source base URL", &self.source_base_url),
        ] {
            let parsed = Url::parse(value)
                .map_err(|e| ArchiveError::Config(format!("invalid {name} '{value}': {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ArchiveError::Config(format!(
                    "{name} '{value}' must use http or https"
                )));
            }
        }
        let prefix_ok = !self.container_prefix.is_empty()
            && self
                .container_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !prefix_ok {
            return Err(ArchiveError::Config(format!(
                "container prefix '{}' must be non-empty and use only [A-Za-z0-9._-]",
                self.container_prefix
            )));
        }
        Ok(())
    }

    /// Dates of the run, in order.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        crate::utils::dates_in_range(self.start_date, self.end_date)
    }

    pub fn db_path(&self) -> PathBuf {
        self.work_dir.join("archive_progress.db")
    }

    pub fn log_path(&self) -> PathBuf {
        self.work_dir.join("archiver.log")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.work_dir.join("reports")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.work_dir.join("index")
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

/// Accepts `YYYYMMDD` and `YYYY-MM-DD`.
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .map_err(|_| ArchiveError::Config(format!("invalid date '{raw}', expected YYYYMMDD")))
}

fn trim_base(value: Option<String>, default: &str) -> String {
    value
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_with_keys() -> Cli {
        Cli {
            start_date: Some("20250101".into()),
            access_key: Some("access".into()),
            secret_key: Some("secret".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_applied() {
        let config = ArchiveConfig::resolve(&cli_with_keys(), FileConfig::default()).unwrap();
        assert_eq!(config.start_date, config.end_date);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.container_prefix, DEFAULT_PREFIX);
        assert_eq!(config.failed_policy, FailedPolicy::Retry);
        assert!(!config.verify);
        assert_eq!(config.source_base_url, DEFAULT_SOURCE_BASE_URL);
        assert_eq!(config.db_path(), PathBuf::from("./data/archive_progress.db"));
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: FileConfig = serde_yaml::from_str(
            "start_date: '2024-12-01'\nend_date: '20241231'\nworkers: 2\ncontainer_prefix: from-file\nretry_failed: false\n",
        )
        .unwrap();
        let cli = Cli {
            start_date: None,
            workers: Some(6),
            ..cli_with_keys()
        };
        let config = ArchiveConfig::resolve(&cli, file).unwrap();
        assert_eq!(config.start_date, NaiveDate::from_ymd_opt(2024, 12, 1).unwrap());
        assert_eq!(config.end_date, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
        assert_eq!(config.workers, 6);
        assert_eq!(config.container_prefix, "from-file");
        assert_eq!(config.failed_policy, FailedPolicy::Skip);
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        let parsed: std::result::Result<FileConfig, _> = serde_yaml::from_str("wokers: 3\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_rejects_inverted_range() {
        let cli = Cli {
            start_date: Some("20250201".into()),
            end_date: Some("20250101".into()),
            ..cli_with_keys()
        };
        let err = ArchiveConfig::resolve(&cli, FileConfig::default()).unwrap_err();
        assert!(matches!(err, ArchiveError::Config(_)));
    }

    #[test]
    fn test_rejects_missing_credentials_and_zero_workers() {
        let cli = Cli {
            start_date: Some("20250101".into()),
            ..Default::default()
        };
        assert!(ArchiveConfig::resolve(&cli, FileConfig::default()).is_err());

        let cli = Cli {
            workers: Some(0),
            ..cli_with_keys()
        };
        assert!(ArchiveConfig::resolve(&cli, FileConfig::default()).is_err());
    }

    #[test]
    fn test_rejects_bad_prefix() {
        let cli = Cli {
            prefix: Some("bad prefix/".into()),
            ..cli_with_keys()
        };
        assert!(ArchiveConfig::resolve(&cli, FileConfig::default()).is_err());
    }

    #[test]
    fn test_rejects_malformed_endpoints() {
        for cli in [
            Cli {
                source_base_url: Some("not a url".into()),
                ..cli_with_keys()
            },
            Cli {
                s3_endpoint: Some("s3.us.archive.org".into()),
                ..cli_with_keys()
            },
            Cli {
                metadata_endpoint: Some("ftp://archive.org/metadata".into()),
                ..cli_with_keys()
            },
        ] {
            match ArchiveConfig::resolve(&cli, FileConfig::default()) {
                Err(ArchiveError::Config(msg)) => assert!(msg.contains("'")),
                other => panic!("expected a config error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert_eq!(parse_date("20250101").unwrap(), expected);
        assert_eq!(parse_date("2025-01-01").unwrap(), expected);
        assert!(parse_date("01/01/2025").is_err());
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = Credentials {
            access_key: "AK".into(),
            secret_key: "SK".into(),
        };
        assert_eq!(creds.authorization(), "LOW AK:SK");
        assert!(format!("{creds:?}").contains("<redacted>"));
    }
}
