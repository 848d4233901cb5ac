//! The managed service installation and its process supervisor.
//!
//! - [`InstalledService`] – where the binary, config, data and unit live.
//!   The installed version is never stored; it is read from the binary on
//!   every request so it cannot drift from what is actually on disk.
//! - [`supervisor`] – the process-supervisor seam (systemd in production).
//! - [`controller`] – stop/start with verification that the process really
//!   went away or came up.
//! - [`unit`] – version-keyed unit file generation.

pub mod controller;
pub mod supervisor;
pub mod unit;

pub use controller::ServiceController;
pub use supervisor::{Supervisor, SystemdSupervisor};
pub use unit::UnitSpec;

use anyhow::{Context, Result, bail};
use regex::Regex;
use semver::Version;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::ServiceConfig;
use crate::constants::{EXEC_BUSY_RETRIES, STARTING_BACKOFF_DELAY_MS, VALIDATOR_BINARY_NAME};
use crate::version::parse_version;

/// Paths of one managed server installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledService {
    /// Supervisor unit name.
    pub unit_name: String,
    /// Server executable.
    pub binary_path: PathBuf,
    /// Server configuration file.
    pub config_path: PathBuf,
    /// TSDB data directory.
    pub data_path: PathBuf,
    /// Supervisor unit file.
    pub unit_path: PathBuf,
    /// Management address (`host:port`).
    pub listen_address: String,
}

impl InstalledService {
    /// Build from the `[service]` configuration section.
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            unit_name: config.unit_name.clone(),
            binary_path: config.binary_path.clone(),
            config_path: config.config_path.clone(),
            data_path: config.data_path.clone(),
            unit_path: config.unit_path.clone(),
            listen_address: config.listen_address.clone(),
        }
    }

    /// Version of the installed binary, or `None` when nothing is installed.
    pub async fn current_version(&self) -> Result<Option<Version>> {
        if !self.binary_path.exists() {
            debug!("No binary at {}, treating as fresh install", self.binary_path.display());
            return Ok(None);
        }
        query_version(&self.binary_path).await.map(Some)
    }

    /// Directory holding the server binary (and the validator next to it).
    pub fn binary_dir(&self) -> &Path {
        self.binary_path.parent().unwrap_or_else(|| Path::new("/"))
    }

    /// Config validator shipped next to the server binary.
    pub fn validator_path(&self) -> PathBuf {
        self.binary_dir().join(VALIDATOR_BINARY_NAME)
    }

    /// Base URL of the management port.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.listen_address)
    }
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"version\s+v?(\S+)").unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

/// Extract the version from `--version` output such as
/// `prometheus, version 2.48.1 (branch: HEAD, revision: 63894216)`.
pub fn parse_version_output(output: &str) -> Result<Version> {
    let first_line = output.lines().next().unwrap_or_default();
    let captures = version_pattern()
        .captures(first_line)
        .with_context(|| format!("Unrecognised version output: '{first_line}'"))?;
    Ok(parse_version(&captures[1])?)
}

/// Run `<binary> --version` and parse the result.
///
/// Retries briefly when the kernel reports "text file busy", which happens
/// when the binary was written moments ago and a writer handle is still
/// being torn down.
pub async fn query_version(binary: &Path) -> Result<Version> {
    let mut attempt = 0;
    let output = loop {
        match Command::new(binary).arg("--version").output().await {
            Ok(output) => break output,
            Err(e) if e.raw_os_error() == Some(26) && attempt < EXEC_BUSY_RETRIES => {
                attempt += 1;
                let delay = STARTING_BACKOFF_DELAY_MS * (1 << attempt);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to execute {}", binary.display()));
            }
        }
    };

    if !output.status.success() {
        bail!(
            "{} --version exited with {}: {}",
            binary.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    // Older releases print version info on stderr.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = if stdout.trim().is_empty() {
        String::from_utf8_lossy(&output.stderr).into_owned()
    } else {
        stdout.into_owned()
    };
    parse_version_output(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UpgradeError;

    #[test]
    fn test_parse_version_output() {
        let v = parse_version_output(
            "prometheus, version 2.48.1 (branch: HEAD, revision: 63894216648f0d6be310c9d16fb48293c45c9310)\n  build user: root@71f108ff5632",
        )
        .unwrap();
        assert_eq!(v, Version::new(2, 48, 1));

        let v = parse_version_output("prometheus, version v3.8.1 (branch: HEAD)").unwrap();
        assert_eq!(v, Version::new(3, 8, 1));
    }

    #[test]
    fn test_parse_version_output_rejects_non_semver() {
        let err = parse_version_output("prometheus, version 3.x (branch: HEAD)").unwrap_err();
        assert!(matches!(err.downcast_ref::<UpgradeError>(), Some(UpgradeError::VersionParse { .. })));

        assert!(parse_version_output("no version here").is_err());
    }

    #[tokio::test]
    async fn test_current_version_missing_binary() {
        let temp = tempfile::TempDir::new().unwrap();
        let service = InstalledService::from_config(&ServiceConfig {
            binary_path: temp.path().join("prometheus"),
            ..ServiceConfig::default()
        });
        assert_eq!(service.current_version().await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_query_version_runs_binary() {
        let temp = tempfile::TempDir::new().unwrap();
        let binary = temp.path().join("prometheus");
        crate::test_utils::write_fake_server(&binary, &Version::new(2, 55, 1)).unwrap();

        assert_eq!(query_version(&binary).await.unwrap(), Version::new(2, 55, 1));
    }
}
