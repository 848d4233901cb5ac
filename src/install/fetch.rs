//! Release artifact transport.
//!
//! `https://` mirrors are fetched with reqwest and streamed to disk with a
//! progress bar; `file://` mirrors are plain copies, which is what offline
//! installs and the test suite use. Plain `http://` is refused unless the
//! operator explicitly allows it.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::ReleaseConfig;
use crate::core::UpgradeError;
use crate::utils::progress;

/// Downloads one artifact to a local path.
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch `url` into `dest`, returning the number of bytes written.
    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<u64>>;
}

/// Pick a fetcher for the configured mirror.
pub fn fetcher_for(release: &ReleaseConfig) -> Result<Arc<dyn ArtifactFetcher>> {
    let base = release.base_url.as_str();
    if base.starts_with("file://") {
        return Ok(Arc::new(FileFetcher));
    }
    if base.starts_with("https://") || (base.starts_with("http://") && release.allow_insecure_http) {
        return Ok(Arc::new(HttpFetcher::new(release.download_timeout())?));
    }
    if base.starts_with("http://") {
        return Err(UpgradeError::ConfigError {
            message: format!(
                "refusing plain-http release mirror {base}; use https, a file:// mirror, or set allow_insecure_http"
            ),
        }
        .into());
    }
    Err(UpgradeError::ConfigError {
        message: format!("unsupported release mirror scheme: {base}"),
    }
    .into())
}

fn download_error(url: &str, reason: impl std::fmt::Display) -> UpgradeError {
    UpgradeError::Download {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

/// reqwest-backed fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with a whole-request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("promup/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self.client.get(url).send().await.map_err(|e| download_error(url, e))?;
        if !response.status().is_success() {
            return Err(download_error(url, format!("HTTP {}", response.status())).into());
        }

        let label = url.rsplit('/').next().unwrap_or(url);
        let bar = progress::download_bar(response.content_length(), label);
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| download_error(url, e))? {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write {}", dest.display()))?;
            written += chunk.len() as u64;
            bar.set_position(written);
        }
        file.flush().await?;
        bar.finish_and_clear();

        debug!(url, bytes = written, "Downloaded");
        Ok(written)
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<u64>> {
        Box::pin(self.download(url, dest))
    }
}

/// `file://` mirror.
pub struct FileFetcher;

impl ArtifactFetcher for FileFetcher {
    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let source = url
                .strip_prefix("file://")
                .ok_or_else(|| download_error(url, "not a file:// URL"))?;
            let bytes = tokio::fs::copy(source, dest).await.map_err(|e| download_error(url, e))?;
            debug!(url, bytes, "Copied from local mirror");
            Ok(bytes)
        })
    }
}
