//! Internet Archive S3 (IAS3) client.
//!
//! Wraps the three remote operations the archiver needs:
//!
//! - [`IaS3Client::ensure_container`]: make sure the monthly item exists
//!   (creation itself is requested with `x-archive-auto-make-bucket` on the
//!   first object write)
//! - [`IaS3Client::put_object`]: upload one article with its metadata
//! - [`IaS3Client::verify_object`]: poll the public metadata endpoint until
//!   the object shows up
//!
//! Responses are decoded into [`ArchiveError`] variants here; nothing past
//! this module sees raw status codes or S3 XML bodies.
//!
//! Reference: <https://archive.org/developers/ias3.html>

use crate::config::{ArchiveConfig, Credentials};
use crate::error::{ArchiveError, Result};
use crate::models::{ContainerId, UploadTask};
use crate::retry::RetryPolicy;
use crate::utils::truncate_for_log;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const META_PREFIX: &str = "x-archive-meta-";
const AUTO_MAKE_BUCKET: &str = "x-archive-auto-make-bucket";

/// What [`IaS3Client::ensure_container`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// The item already exists remotely.
    Exists,
    /// The item is absent and will be created by the next upload.
    WillCreate,
    /// Already checked during this run.
    Known,
}

/// Metadata attached to every uploaded article.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMetadata {
    pub original_url: String,
    pub fetched_at: DateTime<Utc>,
    pub date: NaiveDate,
    pub language: String,
    pub container: ContainerId,
    pub title: String,
    pub subject: String,
    pub mediatype: String,
}

impl ObjectMetadata {
    pub fn for_task(task: &UploadTask, fetched_at: DateTime<Utc>) -> Self {
        Self {
            original_url: task.url.clone(),
            fetched_at,
            date: task.date,
            language: "chi".to_string(),
            container: task.container.clone(),
            title: format!("Ming Pao Canada News Archive {}", task.date.format("%Y-%m")),
            subject: "Ming Pao Canada;Archive;News;Hong Kong".to_string(),
            mediatype: "texts".to_string(),
        }
    }

    /// `x-archive-meta-*` header pairs, in a stable order.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        [
            ("mediatype", self.mediatype.clone()),
            ("originalurl", self.original_url.clone()),
            ("date", self.date.format("%Y-%m-%d").to_string()),
            ("fetchdate", self.fetched_at.to_rfc3339()),
            ("language", self.language.clone()),
            ("container", self.container.to_string()),
            ("title", self.title.clone()),
            ("subject", self.subject.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (format!("{META_PREFIX}{k}"), v))
        .collect()
    }
}

/// `<Error><Code>..</Code><Message>..</Message></Error>` as returned by IAS3.
#[derive(Debug, Default, Deserialize)]
struct S3ErrorBody {
    #[serde(rename = "Code", default)]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

/// The parts of `https://archive.org/metadata/<item>` we read.
#[derive(Debug, Default, Deserialize)]
struct ItemMetadata {
    #[serde(default)]
    files: Vec<ItemFile>,
}

#[derive(Debug, Deserialize)]
struct ItemFile {
    name: String,
}

/// Authenticated client for the IAS3 endpoint and the public metadata API.
pub struct IaS3Client {
    client: Client,
    endpoint: String,
    metadata_endpoint: String,
    credentials: Credentials,
    put_timeout: Duration,
    verify_timeout: Duration,
    retry: RetryPolicy,
    verify_policy: RetryPolicy,
    known_containers: Mutex<HashSet<ContainerId>>,
}

impl IaS3Client {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.s3_endpoint.clone(),
            metadata_endpoint: config.metadata_endpoint.clone(),
            credentials: config.credentials.clone(),
            put_timeout: config.timeouts.put,
            verify_timeout: config.timeouts.verify,
            retry: RetryPolicy::transient(config.fetch_retries),
            verify_policy: RetryPolicy::verification(config.verify_attempts),
            known_containers: Mutex::new(HashSet::new()),
        })
    }

    /// Replace the backoff used for transient upload failures.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the verification polling schedule.
    pub fn with_verify_policy(mut self, policy: RetryPolicy) -> Self {
        self.verify_policy = policy;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn object_url(&self, container: &ContainerId, key: &str) -> String {
        let encoded_key = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}/{}", self.endpoint, container, encoded_key)
    }

    fn auth_value(&self) -> Result<HeaderValue> {
        HeaderValue::from_str(&self.credentials.authorization())
            .map_err(|_| ArchiveError::Config("credentials contain invalid header characters".into()))
    }

    /// Make sure `container` exists or will be created by the next upload.
    ///
    /// Each container is checked at most once per client.
    #[instrument(level = "info", skip_all, fields(%container))]
    pub async fn ensure_container(&self, container: &ContainerId) -> Result<ContainerState> {
        if self.is_known(container) {
            return Ok(ContainerState::Known);
        }

        let state = self
            .retry
            .run("ensure_container", || self.head_container(container))
            .await?;
        self.known_containers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(container.clone());
        info!(?state, "Container checked");
        Ok(state)
    }

    fn is_known(&self, container: &ContainerId) -> bool {
        self.known_containers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(container)
    }

    async fn head_container(&self, container: &ContainerId) -> Result<ContainerState> {
        let url = format!("{}/{}", self.endpoint, container);
        let response = self
            .client
            .head(&url)
            .header(AUTHORIZATION, self.auth_value()?)
            .timeout(self.put_timeout)
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(ContainerState::Exists),
            StatusCode::NOT_FOUND => Ok(ContainerState::WillCreate),
            _ => Err(self.decode_failure(response, container, "").await),
        }
    }

    /// Upload `body` as `key` inside `container`, retrying transient failures.
    #[instrument(level = "info", skip_all, fields(%container, %key, bytes = body.len()))]
    pub async fn put_object(
        &self,
        container: &ContainerId,
        key: &str,
        body: &[u8],
        metadata: &ObjectMetadata,
    ) -> Result<()> {
        let headers = self.put_headers(metadata)?;
        self.retry
            .run("put_object", || self.put_once(container, key, body, headers.clone()))
            .await?;
        info!("Uploaded object");
        Ok(())
    }

    fn put_headers(&self, metadata: &ObjectMetadata) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.auth_value()?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.insert(AUTO_MAKE_BUCKET, HeaderValue::from_static("1"));
        for (name, value) in metadata.header_pairs() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ArchiveError::InvalidMetadata(name.clone()))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| ArchiveError::InvalidMetadata(format!("{name}: {value}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn put_once(
        &self,
        container: &ContainerId,
        key: &str,
        body: &[u8],
        headers: HeaderMap,
    ) -> Result<()> {
        let response = self
            .client
            .put(self.object_url(container, key))
            .headers(headers)
            .body(body.to_vec())
            .timeout(self.put_timeout)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(self.decode_failure(response, container, key).await)
    }

    /// Map a non-success response onto the error taxonomy.
    async fn decode_failure(&self, response: Response, container: &ContainerId, key: &str) -> ArchiveError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let parsed: S3ErrorBody = quick_xml::de::from_str(&body).unwrap_or_default();
        debug!(status = status.as_u16(), code = %parsed.code, body = %truncate_for_log(&body, 300), "IAS3 error response");
        classify_failure(&self.endpoint, status, parsed, container, key, &body)
    }

    /// Poll the metadata endpoint until `key` is listed in `container`.
    ///
    /// Returns `false` (not an error) once the verification attempts are
    /// exhausted; the caller decides what an unverified upload means.
    #[instrument(level = "info", skip_all, fields(%container, %key))]
    pub async fn verify_object(&self, container: &ContainerId, key: &str) -> bool {
        let seen = self
            .verify_policy
            .poll("verify_object", || self.object_listed(container, key))
            .await;
        if seen {
            info!("Upload verified");
        } else {
            warn!(attempts = self.verify_policy.max_attempts, "Upload not visible yet");
        }
        seen
    }

    pub fn verify_attempts(&self) -> u32 {
        self.verify_policy.max_attempts
    }

    async fn object_listed(&self, container: &ContainerId, key: &str) -> Result<bool> {
        let url = format!("{}/{}", self.metadata_endpoint, container);
        let response = self
            .client
            .get(&url)
            .timeout(self.verify_timeout)
            .send()
            .await?;
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ArchiveError::Transient(format!(
                "metadata lookup returned HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Ok(false);
        }
        // Unknown items come back as `{}`.
        let body = response.text().await?;
        let item: ItemMetadata = serde_json::from_str(&body).unwrap_or_default();
        Ok(item.files.iter().any(|f| f.name == key))
    }

    /// Lightweight authenticated request used by the health check.
    ///
    /// Succeeds on 2xx, fails with [`ArchiveError::Auth`] on 401/403 and
    /// with the decoded failure otherwise.
    pub async fn probe_auth(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/", self.endpoint))
            .header(AUTHORIZATION, self.auth_value()?)
            .timeout(self.verify_timeout)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let container = ContainerId::from(String::new());
        Err(self.decode_failure(response, &container, "").await)
    }
}

fn classify_failure(
    endpoint: &str,
    status: StatusCode,
    parsed: S3ErrorBody,
    container: &ContainerId,
    key: &str,
    raw_body: &str,
) -> ArchiveError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ArchiveError::Auth {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        },
        StatusCode::CONFLICT => ArchiveError::Conflict {
            container: container.to_string(),
            key: key.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => ArchiveError::Transient(format!(
            "throttled (HTTP 429{})",
            code_suffix(&parsed.code)
        )),
        s if s.is_server_error() => ArchiveError::Transient(format!(
            "HTTP {}{}",
            s.as_u16(),
            code_suffix(&parsed.code)
        )),
        s => ArchiveError::Rejected {
            status: s.as_u16(),
            code: if parsed.code.is_empty() {
                "Unknown".to_string()
            } else {
                parsed.code
            },
            message: if parsed.message.is_empty() {
                truncate_for_log(raw_body, 200)
            } else {
                parsed.message
            },
        },
    }
}

fn code_suffix(code: &str) -> String {
    if code.is_empty() {
        String::new()
    } else {
        format!(" {code}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use crate::config::FileConfig;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: false,
        }
    }

    fn client_for(server: &MockServer) -> IaS3Client {
        let cli = Cli {
            start_date: Some("20250101".into()),
            access_key: Some("AK".into()),
            secret_key: Some("SK".into()),
            s3_endpoint: Some(server.uri()),
            metadata_endpoint: Some(format!("{}/metadata", server.uri())),
            ..Default::default()
        };
        let config = ArchiveConfig::resolve(&cli, FileConfig::default()).unwrap();
        IaS3Client::new(&config)
            .unwrap()
            .with_retry(fast(3))
            .with_verify_policy(fast(3))
    }

    fn task() -> UploadTask {
        UploadTask::from_url("http://www.mingpaocanada.com/tor/news/20250101/HK-a1.htm", "prefix")
            .unwrap()
    }

    #[test]
    fn test_metadata_headers() {
        let t = task();
        let fetched = DateTime::parse_from_rfc3339("2025-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let pairs = ObjectMetadata::for_task(&t, fetched).header_pairs();
        assert!(pairs.iter().all(|(k, _)| k.starts_with(META_PREFIX)));
        assert!(pairs.contains(&("x-archive-meta-originalurl".to_string(), t.url.clone())));
        assert!(pairs.contains(&("x-archive-meta-date".to_string(), "2025-01-01".to_string())));
        assert!(pairs.contains(&("x-archive-meta-container".to_string(), "prefix-2025-01".to_string())));
        assert!(pairs.contains(&("x-archive-meta-language".to_string(), "chi".to_string())));
    }

    #[test]
    fn test_classify_decodes_s3_error_body() {
        let body = "<?xml version='1.0' encoding='UTF-8'?>\n<Error><Code>InvalidBucketName</Code><Message>The specified bucket is not valid.</Message><Resource>x</Resource></Error>";
        let parsed: S3ErrorBody = quick_xml::de::from_str(body).unwrap();
        let container = ContainerId::from("bad".to_string());
        let err = classify_failure("s3", StatusCode::BAD_REQUEST, parsed, &container, "k", body);
        match err {
            ArchiveError::Rejected { status, code, message } => {
                assert_eq!(status, 400);
                assert_eq!(code, "InvalidBucketName");
                assert_eq!(message, "The specified bucket is not valid.");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_statuses() {
        let c = ContainerId::from("c".to_string());
        let auth = classify_failure("s3", StatusCode::FORBIDDEN, S3ErrorBody::default(), &c, "k", "");
        assert!(auth.is_fatal());
        let slow = classify_failure("s3", StatusCode::SERVICE_UNAVAILABLE, S3ErrorBody::default(), &c, "k", "");
        assert!(slow.is_transient());
        let conflict = classify_failure("s3", StatusCode::CONFLICT, S3ErrorBody::default(), &c, "k", "");
        assert!(matches!(conflict, ArchiveError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_put_object_sends_auth_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/prefix-2025-01/20250101/HK-a1.htm"))
            .and(header("authorization", "LOW AK:SK"))
            .and(header("x-archive-auto-make-bucket", "1"))
            .and(header("x-archive-meta-mediatype", "texts"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let t = task();
        client
            .put_object(&t.container, &t.object_key, b"<html/>", &ObjectMetadata::for_task(&t, Utc::now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_object_retries_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503).set_body_string(
                "<Error><Code>SlowDown</Code><Message>Please reduce your request rate.</Message></Error>",
            ))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let t = task();
        client
            .put_object(&t.container, &t.object_key, b"x", &ObjectMetadata::for_task(&t, Utc::now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_object_auth_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let t = task();
        let err = client
            .put_object(&t.container, &t.object_key, b"x", &ObjectMetadata::for_task(&t, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Auth { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_ensure_container_checks_once() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/prefix-2025-01"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let container = task().container;
        assert_eq!(
            client.ensure_container(&container).await.unwrap(),
            ContainerState::WillCreate
        );
        assert_eq!(
            client.ensure_container(&container).await.unwrap(),
            ContainerState::Known
        );
    }

    #[tokio::test]
    async fn test_verify_object_eventually_visible() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/prefix-2025-01"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/metadata/prefix-2025-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [{"name": "20250101/HK-a1.htm", "size": "7"}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let t = task();
        assert!(client.verify_object(&t.container, &t.object_key).await);
    }

    #[tokio::test]
    async fn test_verify_object_gives_up_without_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/prefix-2025-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [{"name": "20250101/other.htm"}]
            })))
            .expect(3)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let t = task();
        assert!(!client.verify_object(&t.container, &t.object_key).await);
    }
}
