//! JSON run reports.
//!
//! One file per date range, overwritten when the same range is run again:
//! ```text
//! reports_dir/
//! └── 20250101_20250131.json
//! ```

use crate::models::RunSummary;
use chrono::NaiveDate;
use std::error::Error;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, instrument};

fn range_label(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format("%Y%m%d").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Serialize `summary` to `{reports_dir}/{start}_{end}.json`.
///
/// Returns the path written.
#[instrument(level = "info", skip_all, fields(reports_dir = %reports_dir.display()))]
pub async fn write_run_report(
    summary: &RunSummary,
    reports_dir: &Path,
) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
    let json = serde_json::to_string_pretty(summary)?;

    if let Err(e) = fs::create_dir_all(reports_dir).await {
        error!(error = %e, "Failed to create reports dir");
        return Err(e.into());
    }

    let path = reports_dir.join(format!(
        "{}_{}.json",
        range_label(summary.start_date),
        range_label(summary.end_date)
    ));
    fs::write(&path, json).await?;
    info!(path = %path.display(), "Wrote run report");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_report_named_after_range() {
        let dir = tempfile::tempdir().unwrap();
        let summary = RunSummary {
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1),
            end_date: NaiveDate::from_ymd_opt(2025, 1, 31),
            succeeded: 7,
            failed: 1,
            ..Default::default()
        };
        let path = write_run_report(&summary, &dir.path().join("reports"))
            .await
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "20250101_20250131.json");

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["succeeded"], 7);
        assert_eq!(written["failed"], 1);
        assert_eq!(written["start_date"], "2025-01-01");
    }

    #[tokio::test]
    async fn test_missing_range_still_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_run_report(&RunSummary::default(), dir.path())
            .await
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "unknown_unknown.json");
    }
}
