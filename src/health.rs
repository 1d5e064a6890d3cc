//! Pre-flight health checks.
//!
//! Two independent probes run concurrently before any article is touched:
//!
//! | Probe | Request | Passes when |
//! |-------|---------|-------------|
//! | Remote store | authenticated `GET /` on the IAS3 endpoint | 2xx |
//! | Source site | `HEAD` on a known article page, redirects not followed | any status below 500 |
//!
//! Either failure aborts the run before discovery starts.

use crate::error::{ArchiveError, Result};
use crate::ias3::IaS3Client;
use crate::scrapers::mingpao::MingPao;
use std::time::Instant;
use tracing::{error, info, instrument};

/// Result of a single probe.
#[derive(Debug)]
pub struct ProbeReport {
    pub name: &'static str,
    pub target: String,
    pub outcome: Result<String>,
    pub elapsed_ms: u64,
}

impl ProbeReport {
    pub fn passed(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Run both probes; `Ok` only when both pass.
///
/// An authentication failure is returned as-is so the caller can report it
/// distinctly; every other failure becomes [`ArchiveError::HealthCheck`]
/// with one line per failed probe.
#[instrument(level = "info", skip_all)]
pub async fn run_health_checks(ia: &IaS3Client, source: &MingPao) -> Result<Vec<ProbeReport>> {
    info!("Running health checks");
    let (remote, site) = tokio::join!(probe_remote(ia), probe_source(source));
    let reports = vec![remote, site];

    for report in &reports {
        match &report.outcome {
            Ok(detail) => info!(probe = report.name, target = %report.target, elapsed_ms = report.elapsed_ms, %detail, "Health check passed"),
            Err(e) => error!(probe = report.name, target = %report.target, elapsed_ms = report.elapsed_ms, error = %e, "Health check failed"),
        }
    }

    if reports.iter().all(ProbeReport::passed) {
        info!("All health checks passed");
        return Ok(reports);
    }

    let mut diagnostics = Vec::new();
    for report in reports {
        match report.outcome {
            Ok(_) => {}
            Err(e @ ArchiveError::Auth { .. }) => return Err(e),
            Err(e) => diagnostics.push(format!("{} ({}): {}", report.name, report.target, e)),
        }
    }
    Err(ArchiveError::HealthCheck(diagnostics.join("; ")))
}

async fn probe_remote(ia: &IaS3Client) -> ProbeReport {
    let t0 = Instant::now();
    let outcome = ia
        .probe_auth()
        .await
        .map(|()| "credentials accepted".to_string());
    ProbeReport {
        name: "internet-archive",
        target: ia.endpoint().to_string(),
        outcome,
        elapsed_ms: t0.elapsed().as_millis() as u64,
    }
}

async fn probe_source(source: &MingPao) -> ProbeReport {
    let t0 = Instant::now();
    let target = source.probe_url();
    let outcome = match source.head_status(&target).await {
        Ok(status) if status.as_u16() < 500 => Ok(format!("reachable (HTTP {})", status.as_u16())),
        Ok(status) => Err(ArchiveError::HealthCheck(format!(
            "source returned HTTP {}",
            status.as_u16()
        ))),
        Err(e) => Err(e),
    };
    ProbeReport {
        name: "source-website",
        target,
        outcome,
        elapsed_ms: t0.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use crate::config::{ArchiveConfig, FileConfig};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn clients(s3: &MockServer, site: &str) -> (IaS3Client, MingPao) {
        let cli = Cli {
            start_date: Some("20250101".into()),
            access_key: Some("AK".into()),
            secret_key: Some("SK".into()),
            s3_endpoint: Some(s3.uri()),
            source_base_url: Some(site.to_string()),
            verify_timeout_secs: Some(2),
            fetch_timeout_secs: Some(2),
            ..Default::default()
        };
        let config = ArchiveConfig::resolve(&cli, FileConfig::default()).unwrap();
        (IaS3Client::new(&config).unwrap(), MingPao::new(&config).unwrap())
    }

    #[tokio::test]
    async fn test_both_probes_pass() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        // Unmatched HEAD on the article page answers 404, which still counts as reachable.
        let (ia, mp) = clients(&server, &format!("{}/tor", server.uri()));
        let reports = run_health_checks(&ia, &mp).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(ProbeReport::passed));
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_auth_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let (ia, mp) = clients(&server, &format!("{}/tor", server.uri()));
        let err = run_health_checks(&ia, &mp).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Auth { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_source_5xx_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let (ia, mp) = clients(&server, &format!("{}/tor", server.uri()));
        let err = run_health_checks(&ia, &mp).await.unwrap_err();
        match err {
            ArchiveError::HealthCheck(msg) => assert!(msg.contains("source-website")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_source_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let (ia, mp) = clients(&server, "http://127.0.0.1:9/tor");
        assert!(run_health_checks(&ia, &mp).await.is_err());
    }
}
