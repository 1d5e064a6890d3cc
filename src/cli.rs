//! Command-line interface definitions for the archiver.
//!
//! All arguments can be provided via command-line flags or environment
//! variables. Options left unset fall back to the YAML file given with
//! `--config`, then to built-in defaults (see [`crate::config`]).

use clap::Parser;

/// Command-line arguments for the Internet Archive news archiver.
///
/// # Examples
///
/// ```sh
/// # Archive one month, verifying every upload
/// ia_news_archiver --start-date 20250101 --end-date 20250131 --verify
///
/// # Credentials from the environment, settings from a file
/// IA_ACCESS_KEY=... IA_SECRET_KEY=... ia_news_archiver -c archiver.yaml
/// ```
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to a YAML configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// First date to archive (YYYYMMDD or YYYY-MM-DD)
    #[arg(short, long, env = "ARCHIVE_START_DATE")]
    pub start_date: Option<String>,

    /// Last date to archive, inclusive (defaults to the start date)
    #[arg(short, long, env = "ARCHIVE_END_DATE")]
    pub end_date: Option<String>,

    /// Number of concurrent upload workers
    #[arg(short, long, env = "ARCHIVE_WORKERS")]
    pub workers: Option<usize>,

    /// Verify each upload against the public metadata endpoint
    #[arg(long, env = "ARCHIVE_VERIFY")]
    pub verify: bool,

    /// Verification attempts before giving up (delays 1s, 2s, 4s, ...)
    #[arg(long)]
    pub verify_attempts: Option<u32>,

    /// Prefix of the monthly item identifiers, e.g. `<prefix>-2025-01`
    #[arg(short, long, env = "ARCHIVE_PREFIX")]
    pub prefix: Option<String>,

    /// Internet Archive S3 access key
    #[arg(long, env = "IA_ACCESS_KEY", hide_env_values = true)]
    pub access_key: Option<String>,

    /// Internet Archive S3 secret key
    #[arg(long, env = "IA_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Directory holding the progress database, log file, reports and index pages
    #[arg(long, env = "ARCHIVE_WORK_DIR")]
    pub work_dir: Option<String>,

    /// Treat previously failed URLs as done instead of retrying them
    #[arg(long)]
    pub no_retry_failed: bool,

    /// Forget all failed records before starting
    #[arg(long)]
    pub reset_failed: bool,

    /// Forget the record of one URL before starting (repeatable)
    #[arg(long = "reset-url", value_name = "URL")]
    pub reset_urls: Vec<String>,

    /// Skip the pre-flight reachability checks
    #[arg(long)]
    pub skip_health_check: bool,

    /// S3-compatible upload endpoint
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Public metadata endpoint used for verification
    #[arg(long)]
    pub metadata_endpoint: Option<String>,

    /// Base URL of the source website
    #[arg(long)]
    pub source_base_url: Option<String>,

    /// Per-request timeout for article fetches, in seconds
    #[arg(long)]
    pub fetch_timeout_secs: Option<u64>,

    /// Per-request timeout for uploads, in seconds
    #[arg(long)]
    pub put_timeout_secs: Option<u64>,

    /// Per-request timeout for verification lookups, in seconds
    #[arg(long)]
    pub verify_timeout_secs: Option<u64>,

    /// Retries after the first attempt for transient fetch/upload failures
    #[arg(long)]
    pub fetch_retries: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from([
            "ia_news_archiver",
            "--start-date",
            "20250101",
            "--end-date",
            "20250131",
            "--workers",
            "8",
            "--verify",
        ]);

        assert_eq!(cli.start_date.as_deref(), Some("20250101"));
        assert_eq!(cli.end_date.as_deref(), Some("20250131"));
        assert_eq!(cli.workers, Some(8));
        assert!(cli.verify);
        assert!(!cli.no_retry_failed);
    }

    #[test]
    fn test_cli_short_flags() {
        let cli = Cli::parse_from([
            "ia_news_archiver",
            "-s",
            "2025-01-01",
            "-w",
            "2",
            "-p",
            "test-prefix",
            "-c",
            "/tmp/archiver.yaml",
        ]);

        assert_eq!(cli.start_date.as_deref(), Some("2025-01-01"));
        assert_eq!(cli.workers, Some(2));
        assert_eq!(cli.prefix.as_deref(), Some("test-prefix"));
        assert_eq!(cli.config.as_deref(), Some("/tmp/archiver.yaml"));
    }
}
