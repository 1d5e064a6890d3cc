//! Static HTML index pages.
//!
//! Rendered from the progress store after a run so readers can browse what
//! has been archived without querying the Internet Archive:
//!
//! - **Container page** (`<container>.html`): every successful upload of one
//!   monthly item, grouped by publication date, linking both the archived
//!   copy and the original article
//! - **index.html**: one line per container with its article count
//!
//! Pages are regenerated from scratch each time; nothing is appended.

use crate::models::{ArticleRecord, ContainerId, UploadStatus};
use crate::store::ProgressStore;
use html_escape::{encode_double_quoted_attribute, encode_text};
use itertools::Itertools;
use std::error::Error;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};

const DOWNLOAD_BASE: &str = "https://archive.org/download";

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html lang="zh-Hant">
<head>
<meta charset="utf-8">
"#;

/// Public download URL of an archived object.
pub fn download_url(container: &ContainerId, key: &str) -> String {
    format!("{DOWNLOAD_BASE}/{container}/{key}")
}

/// Render the listing for one container.
pub fn render_container_page(container: &ContainerId, records: &[ArticleRecord]) -> String {
    let title = encode_text(container.as_str());
    let mut html = String::from(PAGE_HEAD);
    html.push_str(&format!("<title>{title}</title>\n</head>\n<body>\n"));
    html.push_str(&format!(
        "<h1>{title}</h1>\n<p>{} articles. <a href=\"index.html\">All containers</a></p>\n",
        records.len()
    ));

    let by_date = records.iter().chunk_by(|r| r.date);
    for (date, group) in &by_date {
        html.push_str(&format!("<h2>{}</h2>\n<ul>\n", date.format("%Y-%m-%d")));
        for record in group {
            let mark = if record.status == UploadStatus::Verified {
                " &#10003;"
            } else {
                ""
            };
            html.push_str(&format!(
                "<li><a href=\"{}\">{}</a>{mark} (<a href=\"{}\">original</a>)</li>\n",
                encode_double_quoted_attribute(&download_url(container, &record.object_key)),
                encode_text(&record.object_key),
                encode_double_quoted_attribute(&record.url),
            ));
        }
        html.push_str("</ul>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}

/// Render the top-level listing of containers.
pub fn render_root_index(containers: &[(ContainerId, usize)]) -> String {
    let mut html = String::from(PAGE_HEAD);
    html.push_str("<title>Archived news</title>\n</head>\n<body>\n<h1>Archived news</h1>\n<ul>\n");
    for (container, count) in containers {
        html.push_str(&format!(
            "<li><a href=\"{}.html\">{}</a> ({count} articles)</li>\n",
            encode_double_quoted_attribute(container.as_str()),
            encode_text(container.as_str()),
        ));
    }
    html.push_str("</ul>\n</body>\n</html>\n");
    html
}

/// Regenerate every page under `index_dir`; returns the number of containers.
#[instrument(level = "info", skip_all, fields(index_dir = %index_dir.display()))]
pub async fn write_indexes(
    store: &ProgressStore,
    index_dir: &Path,
) -> Result<usize, Box<dyn Error + Send + Sync>> {
    fs::create_dir_all(index_dir).await?;

    let mut listed = Vec::new();
    for container in store.containers_with_successes()? {
        let records = store.all_succeeded_for(&container)?;
        // Keys start with YYYYMMDD, so key order is date order.
        let page = render_container_page(&container, &records);
        let path = index_dir.join(format!("{container}.html"));
        fs::write(&path, page).await?;
        info!(path = %path.display(), articles = records.len(), "Wrote container index");
        listed.push((container, records.len()));
    }

    fs::write(index_dir.join("index.html"), render_root_index(&listed)).await?;
    info!(containers = listed.len(), "Wrote root index");
    Ok(listed.len())
}
