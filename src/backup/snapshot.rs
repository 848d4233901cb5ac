//! Online TSDB snapshots through the admin API.

use anyhow::{Context, Result, bail};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Outcome of a snapshot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Snapshot written to `<data>/snapshots/<name>`.
    Created(String),
    /// The server does not offer the API (admin API disabled, too old).
    Unsupported(String),
}

/// Seam for the snapshot endpoint.
pub trait SnapshotApi: Send + Sync {
    /// Ask the running server for a snapshot of its TSDB.
    fn create(&self) -> BoxFuture<'_, Result<SnapshotOutcome>>;
}

#[derive(Debug, Deserialize)]
struct SnapshotEnvelope {
    status: String,
    #[serde(default)]
    data: Option<SnapshotData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotData {
    name: String,
}

/// `POST /api/v1/admin/tsdb/snapshot`.
pub struct HttpSnapshotApi {
    client: reqwest::Client,
    url: String,
}

impl HttpSnapshotApi {
    /// Client for the server at `base_url`. Pass
    /// [`UpgradeConfig::snapshot_timeout`](crate::config::UpgradeConfig::snapshot_timeout),
    /// not the probe timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: format!("{}/api/v1/admin/tsdb/snapshot", base_url.trim_end_matches('/')),
        })
    }
}

impl SnapshotApi for HttpSnapshotApi {
    fn create(&self) -> BoxFuture<'_, Result<SnapshotOutcome>> {
        Box::pin(async move {
            debug!(url = %self.url, "Requesting TSDB snapshot");
            let response = self
                .client
                .post(&self.url)
                .send()
                .await
                .with_context(|| format!("POST {} failed", self.url))?;

            let status = response.status();
            let body = response.text().await.context("Failed to read snapshot response")?;
            parse_snapshot_response(status.as_u16(), &body)
        })
    }
}

/// Interpret a snapshot endpoint response.
pub fn parse_snapshot_response(status: u16, body: &str) -> Result<SnapshotOutcome> {
    if status == 404 || status == 405 {
        return Ok(SnapshotOutcome::Unsupported(format!("endpoint returned {status}")));
    }

    let envelope: SnapshotEnvelope = serde_json::from_str(body)
        .with_context(|| format!("Unexpected snapshot response ({status}): {body}"))?;

    if envelope.status == "success" {
        if let Some(data) = envelope.data {
            return Ok(SnapshotOutcome::Created(data.name));
        }
        bail!("Snapshot response has no snapshot name");
    }

    let error = envelope.error.unwrap_or_else(|| "unknown error".to_string());
    if error.contains("admin APIs disabled") {
        return Ok(SnapshotOutcome::Unsupported(error));
    }
    bail!("Snapshot failed ({status}): {error}")
}
