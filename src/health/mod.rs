//! Post-start health verification.
//!
//! A stage only counts as successful once the management port reports ready
//! and healthy (and, optionally, answers a trivial query). "Process active"
//! is not enough: a 3.x server may spend minutes replaying the WAL before it
//! serves anything.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::core::UpgradeError;

/// Raw probe response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl ProbeResponse {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn summary(&self) -> String {
        let body = self.body.trim();
        let body: String = body.chars().take(200).collect();
        format!("{} {}", self.status, body)
    }
}

/// HTTP GET seam for probes.
pub trait HealthProbe: Send + Sync {
    /// Fetch `url`.
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ProbeResponse>>;
}

/// Probes over HTTP with reqwest.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Create a probe with a per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
        })
    }
}

impl HealthProbe for HttpProbe {
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ProbeResponse>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .with_context(|| format!("GET {url} failed"))?;
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Ok(ProbeResponse {
                status,
                body,
            })
        })
    }
}

/// Result of a successful health wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthStatus {
    /// Readiness probe passed.
    pub ready: bool,
    /// Liveness probe passed.
    pub healthy: bool,
    /// Attempts needed.
    pub attempts_used: u32,
}

/// Polls the readiness, liveness and query endpoints.
pub struct HealthVerifier {
    probe: Arc<dyn HealthProbe>,
    base_url: String,
    query_probe: bool,
}

impl HealthVerifier {
    /// Create a verifier for the server at `base_url` (`http://host:port`).
    pub fn new(probe: Arc<dyn HealthProbe>, base_url: impl Into<String>, query_probe: bool) -> Self {
        Self {
            probe,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            query_probe,
        }
    }

    /// Poll at a fixed interval until every probe passes or the attempt budget
    /// is exhausted.
    pub async fn wait_healthy(&self, config: &HealthConfig) -> Result<HealthStatus> {
        let max_attempts = config.max_attempts.max(1);
        let mut delays = FixedInterval::new(config.interval()).take(max_attempts as usize - 1);
        let mut last_responses = Vec::new();

        for attempt in 1..=max_attempts {
            last_responses.clear();
            match self.probe_once(&mut last_responses).await {
                Some(status) => {
                    info!(attempt, "Service healthy");
                    return Ok(HealthStatus {
                        attempts_used: attempt,
                        ..status
                    });
                }
                None => debug!(attempt, responses = ?last_responses, "Not healthy yet"),
            }
            if let Some(delay) = delays.next() {
                tokio::time::sleep(delay).await;
            }
        }

        Err(UpgradeError::HealthTimeout {
            attempts: max_attempts,
            last_responses,
        }
        .into())
    }

    async fn probe_once(&self, responses: &mut Vec<String>) -> Option<HealthStatus> {
        let ready = self.check("/-/ready", responses, |_| true).await;
        if !ready {
            return None;
        }
        let healthy = self.check("/-/healthy", responses, |_| true).await;
        if !healthy {
            return None;
        }
        if self.query_probe {
            let answered = self
                .check("/api/v1/query?query=up", responses, |r| r.body.contains("\"success\""))
                .await;
            if !answered {
                return None;
            }
        }
        Some(HealthStatus {
            ready,
            healthy,
            attempts_used: 0,
        })
    }

    async fn check(
        &self,
        path: &str,
        responses: &mut Vec<String>,
        accept: impl Fn(&ProbeResponse) -> bool,
    ) -> bool {
        let url = format!("{}{path}", self.base_url);
        match self.probe.get(&url).await {
            Ok(response) => {
                responses.push(format!("{path}: {}", response.summary()));
                response.is_success() && accept(&response)
            }
            Err(e) => {
                responses.push(format!("{path}: {e:#}"));
                false
            }
        }
    }
}
