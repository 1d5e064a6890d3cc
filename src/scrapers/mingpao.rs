//! Ming Pao Canada (Toronto edition) scraper.
//!
//! # URL Pattern
//!
//! Every article of a day lives under one directory:
//!
//! ```text
//! http://www.mingpaocanada.com/tor/htm/News/20250101/HK-gaa1_r.htm
//! http://www.mingpaocanada.com/tor/htm/News/20250101/HK-GAindex_r.htm   (daily index)
//! ```
//!
//! Discovery first scrapes the daily index for links into that directory.
//! When the index is missing or lists nothing, a fixed set of known article
//! codes (`HK-<prefix><1..8>_r.htm`) is probed with `HEAD` requests and only
//! the pages that exist are returned.
//!
//! The site's HTTPS certificate is broken, so every request is made over
//! plain HTTP. Missing articles are answered with a redirect to an error
//! page, so redirects are never followed and count as "not found".

use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Result};
use crate::retry::RetryPolicy;
use crate::utils::{plain_http, truncate_for_log};
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode, redirect};
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Article codes seen on the Hong Kong news pages.
pub const HK_GA_PREFIXES: &[&str] = &[
    "gaa", "gab", "gac", "gad", "gae", "gaf", "gba", "gbb", "gbc", "gbd", "gbe", "gbf", "gca",
    "gcb", "gcc", "gcd", "gce", "gcf", "gga", "ggb", "ggc", "ggd", "gge", "ggf", "ggh", "gha",
    "ghb", "ghc", "ghd", "ghe", "ghf", "gma", "gmb", "gmc", "gmd", "gme", "gmf", "gmg", "gza",
    "gzb", "gzc",
];
const ARTICLES_PER_PREFIX: u32 = 8;

static LINK_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static ARTICLE_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)/news/(\d{8})/(HK-[A-Za-z0-9_.-]+\.htm)$").unwrap());

/// HTTP access to the Ming Pao Canada site.
#[derive(Debug, Clone)]
pub struct MingPao {
    client: Client,
    base_url: String,
    fetch_timeout: Duration,
    retry: RetryPolicy,
    probe_concurrency: usize,
}

impl MingPao {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: plain_http(&config.source_base_url),
            fetch_timeout: config.timeouts.fetch,
            retry: RetryPolicy::transient(config.fetch_retries),
            probe_concurrency: config.workers.max(1),
        })
    }

    /// Replace the backoff used for article fetches.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn index_url(&self, date: NaiveDate) -> String {
        format!(
            "{}/htm/News/{}/HK-GAindex_r.htm",
            self.base_url,
            date.format("%Y%m%d")
        )
    }

    /// A known article page used by the health check.
    pub fn probe_url(&self) -> String {
        format!("{}/htm/News/20250101/HK-gaa1_r.htm", self.base_url)
    }

    /// Discover the article URLs published on `date`.
    ///
    /// Tries the daily index first and falls back to brute-force probing.
    /// Returns [`ArchiveError::Discovery`] only when neither strategy could
    /// reach the site; an empty day is `Ok(vec![])`.
    #[instrument(level = "info", skip_all, fields(date = %date))]
    pub async fn discover(&self, date: NaiveDate) -> Result<Vec<String>> {
        let index_error = match self.index_articles(date).await {
            Ok(urls) if !urls.is_empty() => {
                info!(count = urls.len(), "Discovered articles from index");
                return Ok(urls);
            }
            Ok(_) => {
                info!("Index listed no articles; falling back to brute force");
                None
            }
            Err(e) => {
                warn!(error = %e, "Index discovery failed; falling back to brute force");
                Some(e)
            }
        };

        match self.bruteforce_articles(date).await {
            Ok(urls) => {
                info!(count = urls.len(), "Discovered articles by probing");
                Ok(urls)
            }
            Err(e) => Err(ArchiveError::Discovery {
                date: date.format("%Y%m%d").to_string(),
                reason: match index_error {
                    Some(index_error) => format!("index: {index_error}; probing: {e}"),
                    None => format!("probing: {e}"),
                },
            }),
        }
    }

    /// Scrape the daily index page. A missing index (any non-200) is an empty list.
    pub async fn index_articles(&self, date: NaiveDate) -> Result<Vec<String>> {
        let index_url = self.index_url(date);
        let response = self
            .client
            .get(&index_url)
            .timeout(self.fetch_timeout)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            debug!(%index_url, status = response.status().as_u16(), "No index page");
            return Ok(Vec::new());
        }

        let html = response.text().await?;
        let base = Url::parse(&index_url)
            .map_err(|e| ArchiveError::Config(format!("invalid source URL {index_url}: {e}")))?;
        Ok(parse_index(&html, &base, date))
    }

    /// Probe every known article code for `date` and keep the ones that exist.
    ///
    /// Fails only when every probe failed at the network level.
    pub async fn bruteforce_articles(&self, date: NaiveDate) -> Result<Vec<String>> {
        let candidates = bruteforce_candidates(&self.base_url, date);
        let total = candidates.len();

        let probes: Vec<(String, Result<bool>)> = stream::iter(candidates)
            .map(|url| async move {
                let exists = self.exists(&url).await;
                (url, exists)
            })
            .buffer_unordered(self.probe_concurrency)
            .collect()
            .await;

        let mut errors = 0usize;
        let mut last_error = None;
        let mut found = Vec::new();
        for (url, result) in probes {
            match result {
                Ok(true) => found.push(url),
                Ok(false) => {}
                Err(e) => {
                    errors += 1;
                    last_error = Some(e);
                }
            }
        }

        if errors == total {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        if errors > 0 {
            warn!(errors, total, "Some probes failed");
        }
        found.sort();
        Ok(found)
    }

    /// Lightweight existence check: `HEAD` answered with 200.
    async fn exists(&self, url: &str) -> Result<bool> {
        let status = self.head_status(url).await?;
        Ok(status == StatusCode::OK)
    }

    pub async fn head_status(&self, url: &str) -> Result<StatusCode> {
        let response = self
            .client
            .head(plain_http(url))
            .timeout(self.fetch_timeout)
            .send()
            .await?;
        Ok(response.status())
    }

    /// Download an article page, retrying transient failures.
    #[instrument(level = "info", skip(self))]
    pub async fn fetch_article(&self, url: &str) -> Result<Vec<u8>> {
        self.retry
            .run("fetch_article", || self.fetch_once(url))
            .await
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>> {
        let http_url = plain_http(url);
        let response = self
            .client
            .get(&http_url)
            .timeout(self.fetch_timeout)
            .send()
            .await?;
        let status = response.status();

        if status == StatusCode::OK {
            let body = response.bytes().await?;
            info!(bytes = body.len(), "Fetched article");
            return Ok(body.to_vec());
        }
        if status == StatusCode::NOT_FOUND || status.is_redirection() {
            return Err(ArchiveError::NotFound {
                url: http_url,
                status: status.as_u16(),
            });
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ArchiveError::Transient(format!(
                "GET {http_url} returned HTTP {}",
                status.as_u16()
            )));
        }

        let body = response.text().await.unwrap_or_default();
        Err(ArchiveError::Rejected {
            status: status.as_u16(),
            code: "SourceError".to_string(),
            message: truncate_for_log(&body, 200),
        })
    }
}

/// Extract article links for `date` from a daily index page.
///
/// Links are resolved against the index URL, forced to plain HTTP, and
/// returned sorted and deduplicated. Links to other dates and to index
/// pages are ignored.
pub fn parse_index(html: &str, index_url: &Url, date: NaiveDate) -> Vec<String> {
    let document = Html::parse_document(html);
    let date_str = date.format("%Y%m%d").to_string();

    document
        .select(&LINK_SELECTOR)
        .filter_map(|element| element.value().attr("href"))
        .filter_map(|href| index_url.join(href.trim()).ok())
        .filter(|resolved| {
            let path = resolved.path();
            match ARTICLE_LINK_RE.captures(path) {
                Some(caps) => {
                    &caps[1] == date_str && !caps[2].to_lowercase().contains("index")
                }
                None => false,
            }
        })
        .map(|mut resolved| {
            resolved.set_fragment(None);
            resolved.set_query(None);
            plain_http(resolved.as_str())
        })
        .sorted()
        .dedup()
        .collect()
}

/// All brute-force candidate URLs for `date`.
pub fn bruteforce_candidates(base_url: &str, date: NaiveDate) -> Vec<String> {
    let date_str = date.format("%Y%m%d").to_string();
    let date_str = date_str.as_str();
    HK_GA_PREFIXES
        .iter()
        .flat_map(|prefix| {
            (1..=ARTICLES_PER_PREFIX)
                .map(move |n| format!("{base_url}/htm/News/{date_str}/HK-{prefix}{n}_r.htm"))
        })
        .collect()
}
