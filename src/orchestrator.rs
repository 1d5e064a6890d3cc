//! Upload orchestration.
//!
//! The pipeline for one run:
//!
//! 1. **Discovery**: for each date in the range (sequentially), ask the
//!    scraper for candidate URLs. A date whose discovery fails is logged and
//!    skipped.
//! 2. **Filtering**: drop URLs the progress store already reports as done.
//!    This read happens once, before dispatch.
//! 3. **Dispatch**: the remaining URLs of the whole range are processed by
//!    at most `workers` concurrent tasks. Each task runs
//!    `FETCHING -> UPLOADING -> (VERIFYING) -> DONE | FAILED` and reports
//!    its status through the single [`StoreWriter`].
//!
//! A failure inside one URL never stops the batch; it becomes a `failed`
//! record whose detail names the stage. Fatal errors (rejected credentials,
//! a broken progress store) stop dispatch and surface as [`Aborted`], which
//! still carries the partial [`RunSummary`].

use crate::config::ArchiveConfig;
use crate::error::{Aborted, ArchiveError, Result, Stage};
use crate::health::run_health_checks;
use crate::ias3::{IaS3Client, ObjectMetadata};
use crate::models::{RunSummary, UploadStatus, UploadTask, UrlOutcome};
use crate::scrapers::mingpao::MingPao;
use crate::store::{ProgressStore, StoreWriter};
use chrono::Utc;
use futures::future;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Everything a run needs, built once at startup and passed by reference.
pub struct ArchiveContext {
    pub config: Arc<ArchiveConfig>,
    pub source: MingPao,
    pub ia: IaS3Client,
    pub store: Arc<ProgressStore>,
}

impl ArchiveContext {
    pub fn new(config: Arc<ArchiveConfig>) -> Result<Self> {
        let source = MingPao::new(&config)?;
        let ia = IaS3Client::new(&config)?;
        let store = Arc::new(ProgressStore::open(&config.db_path(), config.failed_policy)?);
        Ok(Self::from_parts(config, source, ia, store))
    }

    pub fn from_parts(
        config: Arc<ArchiveConfig>,
        source: MingPao,
        ia: IaS3Client,
        store: Arc<ProgressStore>,
    ) -> Self {
        Self {
            config,
            source,
            ia,
            store,
        }
    }
}

/// Bounded-concurrency upload pipeline over the configured date range.
pub struct Orchestrator<'a> {
    ctx: &'a ArchiveContext,
    cancel: CancellationToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(ctx: &'a ArchiveContext) -> Self {
        Self {
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling stops discovery and the dispatch of new URLs; in-flight
    /// uploads finish.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn empty_summary(&self) -> RunSummary {
        RunSummary {
            start_date: Some(self.ctx.config.start_date),
            end_date: Some(self.ctx.config.end_date),
            ..Default::default()
        }
    }

    /// Health-check gate followed by [`run`](Self::run).
    ///
    /// When a probe fails, nothing is fetched or uploaded and the returned
    /// [`Aborted`] carries an empty summary.
    pub async fn archive(&self) -> Result<RunSummary, Aborted> {
        if self.ctx.config.skip_health_check {
            warn!("Health checks skipped");
        } else if let Err(error) = run_health_checks(&self.ctx.ia, &self.ctx.source).await {
            return Err(Aborted {
                summary: self.empty_summary(),
                error,
            });
        }
        self.run().await
    }

    #[instrument(level = "info", skip_all, fields(start = %self.ctx.config.start_date, end = %self.ctx.config.end_date, workers = self.ctx.config.workers))]
    pub async fn run(&self) -> Result<RunSummary, Aborted> {
        let t0 = Instant::now();
        let mut summary = self.empty_summary();

        let tasks = match self.collect_tasks(&mut summary).await {
            Ok(tasks) => tasks,
            Err(error) => {
                summary.elapsed_ms = t0.elapsed().as_millis();
                return Err(Aborted { summary, error });
            }
        };
        info!(
            discovered = summary.discovered,
            skipped = summary.skipped,
            queued = tasks.len(),
            "Discovery complete"
        );

        let writer = StoreWriter::spawn(Arc::clone(&self.ctx.store), self.ctx.config.workers * 2);
        let dispatched = self.dispatch(tasks, &writer, &mut summary).await;
        writer.shutdown().await;

        if self.cancelled() {
            summary.cancelled = true;
        }
        summary.elapsed_ms = t0.elapsed().as_millis();
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            elapsed_ms = summary.elapsed_ms as u64,
            "Run complete"
        );

        match dispatched {
            Ok(()) => Ok(summary),
            Err(error) => Err(Aborted { summary, error }),
        }
    }

    /// Discover every date and keep the URLs that still need work.
    async fn collect_tasks(&self, summary: &mut RunSummary) -> Result<Vec<UploadTask>> {
        let config = &self.ctx.config;
        let mut seen = HashSet::new();
        let mut tasks = Vec::new();

        for date in config.dates() {
            if self.cancelled() {
                warn!(%date, "Interrupted during discovery");
                break;
            }
            summary.dates_processed += 1;

            let Some(discovered) = self
                .cancel
                .run_until_cancelled(self.ctx.source.discover(date))
                .await
            else {
                warn!(%date, "Interrupted during discovery");
                break;
            };
            let urls = match discovered {
                Ok(urls) => urls,
                Err(e) => {
                    warn!(%date, error = %e, "Skipping date");
                    summary.discovery_failures += 1;
                    continue;
                }
            };

            let mut candidates = Vec::with_capacity(urls.len());
            for url in urls {
                if !seen.insert(url.clone()) {
                    continue;
                }
                summary.discovered += 1;

                match UploadTask::from_url(&url, &config.container_prefix) {
                    Some(task) => candidates.push(task),
                    None => warn!(%url, "URL does not follow the per-date layout; ignoring"),
                }
            }

            let (pending, skipped) = filter_pending(Arc::clone(&self.ctx.store), candidates).await?;
            summary.skipped += skipped;
            tasks.extend(pending);
        }
        Ok(tasks)
    }

    /// Run the queued tasks with at most `workers` in flight.
    ///
    /// Returns the first fatal error; per-URL failures are only counted.
    async fn dispatch(
        &self,
        tasks: Vec<UploadTask>,
        writer: &StoreWriter,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let total = tasks.len();
        let cancel = self.cancel.clone();
        let mut results = stream::iter(tasks)
            .take_while(move |_| future::ready(!cancel.is_cancelled()))
            .map(|task| self.process(task, writer))
            .buffer_unordered(self.ctx.config.workers.max(1));

        let mut finished = 0usize;
        let mut fatal = None;
        while let Some(result) = results.next().await {
            finished += 1;
            match result {
                Ok(outcome) => summary.record(outcome),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal error; stopping dispatch");
                    summary.failed += 1;
                    fatal = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "URL could not be recorded");
                    summary.failed += 1;
                }
            }
        }
        drop(results);

        if self.cancelled() {
            summary.not_attempted = total - finished;
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One URL: fetch, upload, optionally verify, record.
    #[instrument(level = "info", skip_all, fields(url = %task.url, container = %task.container, key = %task.object_key))]
    async fn process(&self, task: UploadTask, writer: &StoreWriter) -> Result<UrlOutcome> {
        let body = match self.ctx.source.fetch_article(&task.url).await {
            Ok(body) => body,
            Err(e) => return self.fail(&task, Stage::Fetching, e, writer).await,
        };
        let fetched_at = Utc::now();

        if let Err(e) = self.upload(&task, &body, fetched_at).await {
            return self.fail(&task, Stage::Uploading, e, writer).await;
        }
        writer.mark(&task, UploadStatus::Uploaded, None).await?;

        if !self.ctx.config.verify {
            return Ok(UrlOutcome::Uploaded);
        }

        if self.ctx.ia.verify_object(&task.container, &task.object_key).await {
            writer.mark(&task, UploadStatus::Verified, None).await?;
            Ok(UrlOutcome::Verified)
        } else {
            let timeout = ArchiveError::VerificationTimeout {
                container: task.container.to_string(),
                key: task.object_key.clone(),
                attempts: self.ctx.ia.verify_attempts(),
            };
            warn!(error = %timeout, "Upload left unverified");
            writer
                .mark(
                    &task,
                    UploadStatus::Uploaded,
                    Some(format!("{}: {timeout}", Stage::Verifying)),
                )
                .await?;
            Ok(UrlOutcome::Unverified)
        }
    }

    async fn upload(
        &self,
        task: &UploadTask,
        body: &[u8],
        fetched_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.ctx.ia.ensure_container(&task.container).await?;
        let metadata = ObjectMetadata::for_task(task, fetched_at);
        self.ctx
            .ia
            .put_object(&task.container, &task.object_key, body, &metadata)
            .await
    }

    /// Record a failed stage. Fatal errors are recorded, then returned.
    async fn fail(
        &self,
        task: &UploadTask,
        stage: Stage,
        error: ArchiveError,
        writer: &StoreWriter,
    ) -> Result<UrlOutcome> {
        warn!(%stage, error = %error, "Article failed");
        writer
            .mark(task, UploadStatus::Failed, Some(format!("{stage}: {error}")))
            .await?;
        if error.is_fatal() {
            return Err(error);
        }
        Ok(UrlOutcome::Failed)
    }
}

/// Drop tasks the store reports as done and register the rest as `pending`.
///
/// Returns the remaining tasks and the number skipped. Runs on the blocking pool.
async fn filter_pending(
    store: Arc<ProgressStore>,
    candidates: Vec<UploadTask>,
) -> Result<(Vec<UploadTask>, usize)> {
    tokio::task::spawn_blocking(move || -> Result<(Vec<UploadTask>, usize)> {
        let mut pending = Vec::with_capacity(candidates.len());
        let mut skipped = 0;
        for task in candidates {
            if store.is_done(&task.url)? {
                debug!(url = %task.url, "Already archived");
                skipped += 1;
                continue;
            }
            store.record_discovered(&task)?;
            pending.push(task);
        }
        Ok((pending, skipped))
    })
    .await
    .map_err(|e| ArchiveError::Io(std::io::Error::other(format!("store filter task failed: {e}"))))?
}
