//! Progress store: the durable dedup ledger.
//!
//! Every discovered article has one row in a SQLite database keyed by its
//! URL. The store is the only authority for "already done": a URL whose
//! record is `uploaded` or `verified` is never fetched or uploaded again.
//!
//! # Concurrency
//!
//! Reads for the initial dedup filter go straight to [`ProgressStore`].
//! Writes during a run are funnelled through [`StoreWriter`], a single
//! blocking writer thread fed by a channel, so workers never contend on the
//! connection. Each write is acknowledged only after it is committed.

use crate::config::FailedPolicy;
use crate::error::{ArchiveError, Result};
use crate::models::{ArticleRecord, ContainerId, UploadStatus, UploadTask};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

const BUSY_RETRIES: u32 = 5;
const BUSY_BASE_DELAY: Duration = Duration::from_millis(50);

const RECORD_COLUMNS: &str =
    "url, date, container_id, object_key, status, attempted_at, completed_at, error_detail";

/// SQLite-backed progress store.
pub struct ProgressStore {
    conn: Mutex<Connection>,
    failed_policy: FailedPolicy,
}

impl ProgressStore {
    /// Open (creating if needed) the store at `path`.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path, failed_policy: FailedPolicy) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let store = Self {
            conn: Mutex::new(conn),
            failed_policy,
        };
        store.init_tables()?;
        info!(?failed_policy, "Opened progress store");
        Ok(store)
    }

    fn init_tables(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                url TEXT PRIMARY KEY,
                date TEXT NOT NULL,
                container_id TEXT NOT NULL,
                object_key TEXT NOT NULL,
                status TEXT NOT NULL,
                attempted_at TEXT,
                completed_at TEXT,
                error_detail TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_articles_container_status
                ON articles(container_id, status);
        "#,
        )?;
        Ok(())
    }

    /// The connection is still usable after a panic elsewhere; every write is
    /// its own transaction.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArticleRecord> {
        Ok(ArticleRecord {
            url: row.get(0)?,
            date: row.get::<_, NaiveDate>(1)?,
            container_id: ContainerId::from(row.get::<_, String>(2)?),
            object_key: row.get(3)?,
            status: row.get(4)?,
            attempted_at: row.get::<_, Option<DateTime<Utc>>>(5)?,
            completed_at: row.get::<_, Option<DateTime<Utc>>>(6)?,
            error_detail: row.get(7)?,
        })
    }

    pub fn failed_policy(&self) -> FailedPolicy {
        self.failed_policy
    }

    pub fn status(&self, url: &str) -> Result<Option<UploadStatus>> {
        let status = self
            .conn()
            .query_row(
                "SELECT status FROM articles WHERE url = ?1",
                params![url],
                |row| row.get::<_, UploadStatus>(0),
            )
            .optional()?;
        Ok(status)
    }

    /// True when `url` needs no further work.
    ///
    /// `uploaded` and `verified` are always done; `failed` is done only under
    /// [`FailedPolicy::Skip`].
    pub fn is_done(&self, url: &str) -> Result<bool> {
        Ok(match self.status(url)? {
            Some(UploadStatus::Uploaded | UploadStatus::Verified) => true,
            Some(UploadStatus::Failed) => self.failed_policy == FailedPolicy::Skip,
            Some(UploadStatus::Pending) | None => false,
        })
    }

    pub fn get(&self, url: &str) -> Result<Option<ArticleRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM articles WHERE url = ?1");
        let record = self
            .conn()
            .query_row(&sql, params![url], Self::row_to_record)
            .optional()?;
        Ok(record)
    }

    /// Create a `pending` record for a newly discovered URL.
    ///
    /// Returns `false` when the URL was already known; existing records are
    /// left untouched.
    pub fn record_discovered(&self, task: &UploadTask) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO articles (url, date, container_id, object_key, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task.url,
                task.date,
                task.container.as_str(),
                task.object_key,
                UploadStatus::Pending
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Upsert the status of `task.url`, enforcing the lifecycle.
    ///
    /// Runs in an immediate transaction so the read of the current state and
    /// the write cannot interleave with another writer.
    pub fn mark(&self, task: &UploadTask, status: UploadStatus, detail: Option<&str>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<UploadStatus> = tx
            .query_row(
                "SELECT status FROM articles WHERE url = ?1",
                params![task.url],
                |row| row.get(0),
            )
            .optional()?;
        let from = current.unwrap_or(UploadStatus::Pending);
        if !from.can_transition_to(status) {
            return Err(ArchiveError::InvalidTransition {
                url: task.url.clone(),
                from,
                to: status,
            });
        }

        let now = Utc::now();
        let attempted_at = matches!(status, UploadStatus::Uploaded | UploadStatus::Failed).then_some(now);
        let completed_at = status.is_success().then_some(now);

        tx.execute(
            "INSERT INTO articles (url, date, container_id, object_key, status, attempted_at, completed_at, error_detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(url) DO UPDATE SET
                container_id = excluded.container_id,
                object_key = excluded.object_key,
                status = excluded.status,
                attempted_at = COALESCE(excluded.attempted_at, articles.attempted_at),
                completed_at = COALESCE(excluded.completed_at, articles.completed_at),
                error_detail = excluded.error_detail",
            params![
                task.url,
                task.date,
                task.container.as_str(),
                task.object_key,
                status,
                attempted_at,
                completed_at,
                detail
            ],
        )?;
        tx.commit()?;

        debug!(url = %task.url, %from, to = %status, "Recorded status");
        Ok(())
    }

    /// [`ProgressStore::mark`], retrying lock contention with a short backoff.
    ///
    /// Blocks the calling thread while backing off.
    pub fn mark_with_retry(
        &self,
        task: &UploadTask,
        status: UploadStatus,
        detail: Option<&str>,
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.mark(task, status, detail) {
                Err(e) if e.is_store_busy() && attempt < BUSY_RETRIES => {
                    let delay = BUSY_BASE_DELAY * 2u32.pow(attempt);
                    warn!(url = %task.url, attempt, ?delay, error = %e, "Progress store busy; retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Records in `container` that reached `uploaded` or `verified`, ordered by key.
    pub fn all_succeeded_for(&self, container: &ContainerId) -> Result<Vec<ArticleRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM articles
             WHERE container_id = ?1 AND status IN ('uploaded', 'verified')
             ORDER BY object_key"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![container.as_str()], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Containers holding at least one successful upload.
    pub fn containers_with_successes(&self) -> Result<Vec<ContainerId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT container_id FROM articles
             WHERE status IN ('uploaded', 'verified')
             ORDER BY container_id",
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0).map(ContainerId::from))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Number of records per status.
    pub fn counts(&self) -> Result<Vec<(UploadStatus, usize)>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM articles GROUP BY status ORDER BY status")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, UploadStatus>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Forget a single URL.
    pub fn reset(&self, url: &str) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM articles WHERE url = ?1", params![url])?;
        Ok(removed > 0)
    }

    /// Forget every `failed` record so the next run attempts them again.
    #[instrument(level = "info", skip_all)]
    pub fn reset_failed(&self) -> Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM articles WHERE status = ?1",
            params![UploadStatus::Failed],
        )?;
        info!(removed, "Reset failed records");
        Ok(removed)
    }
}

struct WriteRequest {
    task: UploadTask,
    status: UploadStatus,
    detail: Option<String>,
    ack: oneshot::Sender<Result<()>>,
}

/// Single writer for a run: workers send status updates over a channel and
/// wait for the commit acknowledgement.
pub struct StoreWriter {
    tx: mpsc::Sender<WriteRequest>,
    handle: JoinHandle<()>,
}

impl StoreWriter {
    pub fn spawn(store: Arc<ProgressStore>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteRequest>(capacity.max(1));
        let handle = tokio::task::spawn_blocking(move || {
            let mut written = 0usize;
            while let Some(req) = rx.blocking_recv() {
                let result = store.mark_with_retry(&req.task, req.status, req.detail.as_deref());
                match &result {
                    Ok(()) => written += 1,
                    Err(e) => error!(url = %req.task.url, status = %req.status, error = %e, "Status update failed"),
                }
                let _ = req.ack.send(result);
            }
            debug!(written, "Store writer stopped");
        });
        Self { tx, handle }
    }

    /// Persist a status update; returns once it is committed.
    pub async fn mark(
        &self,
        task: &UploadTask,
        status: UploadStatus,
        detail: Option<String>,
    ) -> Result<()> {
        let (ack, done) = oneshot::channel();
        let request = WriteRequest {
            task: task.clone(),
            status,
            detail,
            ack,
        };
        self.tx.send(request).await.map_err(|_| writer_gone())?;
        done.await.map_err(|_| writer_gone())?
    }

    /// Stop accepting updates and wait for queued ones to be written.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Store writer panicked");
        }
    }
}

fn writer_gone() -> ArchiveError {
    ArchiveError::Io(std::io::Error::other("progress store writer stopped"))
}
