//! # IA News Archiver
//!
//! Archives dated news articles into monthly Internet Archive items through
//! the IAS3 (S3-compatible) API, uploading each article at most once across
//! repeated runs.
//!
//! ## Features
//!
//! - Discovers articles per date from the Ming Pao Canada daily index, with a
//!   brute-force fallback when the index is missing
//! - Records progress in a local SQLite database so re-runs resume where the
//!   previous run stopped
//! - Uploads with bounded concurrency and retries transient failures
//! - Optionally verifies uploads against the eventually-consistent metadata API
//! - Writes a JSON run report and static HTML index pages
//!
//! ## Usage
//!
//! ```sh
//! IA_ACCESS_KEY=... IA_SECRET_KEY=... \
//!     ia_news_archiver --start-date 20250101 --end-date 20250131 -w 4 --verify
//! ```
//!
//! ## Architecture
//!
//! 1. **Health check**: probe the IAS3 endpoint (with credentials) and the source site
//! 2. **Discovery**: enumerate article URLs for each date
//! 3. **Upload**: fetch, upload and optionally verify with `workers` tasks in flight
//! 4. **Output**: print the summary, write the report and index pages
//!
//! ## Exit codes
//!
//! `0` when the run completed (individual articles may still have failed),
//! `1` on configuration, health-check or fatal errors, `130` when interrupted.

use clap::Parser;
use std::fs::OpenOptions;
use std::future::Future;
use std::path::Path;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod error;
mod health;
mod ias3;
mod models;
mod orchestrator;
mod outputs;
mod retry;
mod scrapers;
mod store;
mod utils;

use cli::Cli;
use config::ArchiveConfig;
use error::Aborted;
use models::RunSummary;
use orchestrator::{ArchiveContext, Orchestrator};
use outputs::{indexes, json};
use utils::ensure_writable_dir;

const EXIT_FAILURE: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

/// Log to stderr, and to `log_path` as plain text when given.
fn init_tracing(log_path: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = tfmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tfmt::time::UtcTime::rfc_3339());

    let mut open_error = None;
    let file_layer = log_path.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tfmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true)
                    .with_timer(tfmt::time::UtcTime::rfc_3339()),
            ),
            Err(e) => {
                open_error = Some(e);
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    if let (Some(path), Some(e)) = (log_path, open_error) {
        warn!(path = %path.display(), error = %e, "Could not open log file; logging to stderr only");
    }
}

/// Cancel `token` on the first interrupt. Returns `true` on a second one,
/// when the caller should exit without waiting for in-flight uploads.
async fn watch_interrupts<F, Fut>(token: CancellationToken, mut next_signal: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = next_signal().await {
        warn!(error = %e, "Could not listen for interrupts");
        return false;
    }
    warn!("Interrupt received; finishing in-flight uploads (interrupt again to quit now)");
    token.cancel();

    if next_signal().await.is_err() {
        return false;
    }
    error!("Second interrupt; exiting without waiting for in-flight uploads");
    true
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ArchiveConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(None);
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    if let Err(e) = ensure_writable_dir(config.work_dir()).await {
        init_tracing(None);
        error!(
            path = %config.work_dir().display(),
            error = %e,
            "Working directory is not writable (fix perms or choose a different path)"
        );
        return ExitCode::from(EXIT_FAILURE);
    }

    init_tracing(Some(&config.log_path()));
    info!(
        version = env!("CARGO_PKG_VERSION"),
        start = %config.start_date,
        end = %config.end_date,
        workers = config.workers,
        verify = config.verify,
        prefix = %config.container_prefix,
        "ia_news_archiver starting up"
    );

    execute(Arc::new(config)).await
}

async fn execute(config: Arc<ArchiveConfig>) -> ExitCode {
    let ctx = match ArchiveContext::new(Arc::clone(&config)) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    if config.reset_failed {
        match ctx.store.reset_failed() {
            Ok(n) => info!(removed = n, "Failed records cleared"),
            Err(e) => {
                error!(error = %e, "Could not reset failed records");
                return ExitCode::from(EXIT_FAILURE);
            }
        }
    }

    for url in &config.reset_urls {
        match ctx.store.reset(url) {
            Ok(true) => info!(%url, "Record cleared"),
            Ok(false) => warn!(%url, "No record to clear"),
            Err(e) => {
                error!(%url, error = %e, "Could not reset record");
                return ExitCode::from(EXIT_FAILURE);
            }
        }
    }
    info!(policy = ?ctx.store.failed_policy(), "Progress store ready");

    let orchestrator = Orchestrator::new(&ctx);
    let cancel = orchestrator.cancel_handle();
    let watcher = tokio::spawn(async move {
        if watch_interrupts(cancel, tokio::signal::ctrl_c).await {
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
    });

    let outcome = orchestrator.archive().await;
    watcher.abort();

    let (summary, code) = match outcome {
        Ok(summary) if summary.cancelled => (summary, EXIT_INTERRUPTED),
        Ok(summary) => (summary, 0),
        Err(Aborted { summary, error }) => {
            error!(error = %error, "Run aborted");
            (summary, EXIT_FAILURE)
        }
    };

    match ctx.store.counts() {
        Ok(counts) => {
            for (status, n) in counts {
                info!(%status, count = n, "Progress store totals");
            }
        }
        Err(e) => warn!(error = %e, "Could not read progress store totals"),
    }

    println!("{summary}");
    write_outputs(&ctx, &summary).await;

    ExitCode::from(code)
}

/// Report and index pages; failures here never change the exit code.
async fn write_outputs(ctx: &ArchiveContext, summary: &RunSummary) {
    if let Err(e) = json::write_run_report(summary, &ctx.config.reports_dir()).await {
        error!(error = %e, "Failed to write run report");
    }
    match indexes::write_indexes(&ctx.store, &ctx.config.index_dir()).await {
        Ok(n) => info!(containers = n, "Index pages updated"),
        Err(e) => error!(error = %e, "Failed to write index pages"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_interrupt_requests_exit() {
        let token = CancellationToken::new();
        let forced = watch_interrupts(token.clone(), || async { Ok::<(), std::io::Error>(()) }).await;
        assert!(forced);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_single_interrupt_only_cancels() {
        let token = CancellationToken::new();
        let mut received = 0;
        let watcher = watch_interrupts(token.clone(), move || {
            received += 1;
            let first = received == 1;
            async move {
                if !first {
                    std::future::pending::<()>().await;
                }
                Ok::<(), std::io::Error>(())
            }
        });
        assert!(tokio::time::timeout(Duration::from_millis(100), watcher).await.is_err());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_unavailable_signal_handler_leaves_run_alone() {
        let token = CancellationToken::new();
        let forced = watch_interrupts(token.clone(), || async {
            Err::<(), _>(std::io::Error::other("no signal handler"))
        })
        .await;
        assert!(!forced);
        assert!(!token.is_cancelled());
    }
}
