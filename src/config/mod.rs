//! Operator configuration for promup.
//!
//! Configuration is a TOML file, by default `/etc/promup/promup.toml`
//! (overridable with `--config` or `PROMUP_CONFIG`). Every key is optional;
//! a missing file yields the built-in defaults, which match a stock
//! Prometheus install under systemd.
//!
//! ```toml
//! state_dir = "/var/lib/promup"
//!
//! [service]
//! unit_name = "prometheus.service"
//! binary_path = "/usr/local/bin/prometheus"
//! config_path = "/etc/prometheus/prometheus.yml"
//! data_path = "/var/lib/prometheus"
//! unit_path = "/etc/systemd/system/prometheus.service"
//! listen_address = "127.0.0.1:9090"
//!
//! [release]
//! base_url = "https://github.com/prometheus/prometheus/releases/download"
//!
//! [backup]
//! root = "/var/backups/promup"
//! retention_days = 30
//!
//! [health]
//! max_attempts = 30
//! interval_secs = 2
//! ```
//!
//! Path values go through `shellexpand`, so `~` and `$VAR` are accepted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

use crate::constants::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use crate::core::UpgradeError;

/// Complete operator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// Directory holding the upgrade lock and the run journal.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// The managed service installation.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Where release artifacts come from.
    #[serde(default)]
    pub release: ReleaseConfig,

    /// Backup location, method and retention.
    #[serde(default)]
    pub backup: BackupConfig,

    /// Post-start health verification.
    #[serde(default)]
    pub health: HealthConfig,

    /// Bounds on service stop/start polling.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Paths and identity of the managed service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Supervisor unit name.
    #[serde(default = "default_unit_name")]
    pub unit_name: String,
    /// Installed server executable.
    #[serde(default = "default_binary_path")]
    pub binary_path: PathBuf,
    /// Server configuration file.
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    /// TSDB data directory.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    /// Supervisor unit file.
    #[serde(default = "default_unit_path")]
    pub unit_path: PathBuf,
    /// Management address (`host:port`) used for probes and snapshots.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Account the service runs as; written into generated units.
    #[serde(default = "default_service_user")]
    pub user: String,
    /// Group the service runs as.
    #[serde(default = "default_service_user")]
    pub group: String,
    /// Retention written into freshly generated units.
    #[serde(default = "default_retention_time")]
    pub retention_time: String,
    /// Owner applied to installed executables (numeric uid).
    #[serde(default)]
    pub owner_uid: Option<u32>,
    /// Group applied to installed executables (numeric gid).
    #[serde(default)]
    pub owner_gid: Option<u32>,
}

/// Release artifact source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Base URL; `https://` or `file://` (offline mirror).
    #[serde(default = "default_release_base_url")]
    pub base_url: String,
    /// Operating system tag used in archive names.
    #[serde(default = "default_os")]
    pub os: String,
    /// Architecture tag used in archive names.
    #[serde(default = "default_arch")]
    pub arch: String,
    /// Timeout for a single artifact download.
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Accept plain `http://` mirrors. Off by default: checksums downloaded
    /// over an unauthenticated channel prove nothing.
    #[serde(default)]
    pub allow_insecure_http: bool,
}

/// How backups are taken and kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory containing one sub-directory per backup.
    #[serde(default = "default_backup_root")]
    pub root: PathBuf,
    /// Backups older than this many days are pruned after a successful run.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Preferred method.
    #[serde(default)]
    pub method: BackupMethodPreference,
    /// Stop the service for offline copies. Turning this off produces
    /// backups recorded as inconsistent.
    #[serde(default = "default_true")]
    pub stop_for_copy: bool,
}

/// Operator preference for the backup method (`--method`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMethodPreference {
    /// Snapshot when the service is running and the API is enabled, else copy.
    #[default]
    Auto,
    /// Snapshot API only.
    Api,
    /// Offline file copy only.
    File,
}

impl std::str::FromStr for BackupMethodPreference {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "api" => Ok(Self::Api),
            "file" => Ok(Self::File),
            other => Err(UpgradeError::ConfigError {
                message: format!("unknown backup method '{other}' (expected api, file or auto)"),
            }),
        }
    }
}

/// Post-start health checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Poll attempts before giving up.
    #[serde(default = "default_health_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Also require a successful `up` query after liveness.
    #[serde(default = "default_true")]
    pub query_probe: bool,
    /// Timeout for a single probe request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Bounds for service state transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Graceful stop wait before escalating to SIGKILL.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Wait after SIGKILL before declaring the stop failed.
    #[serde(default = "default_kill_timeout_secs")]
    pub kill_timeout_secs: u64,
    /// Active-state polls after start.
    #[serde(default = "default_start_attempts")]
    pub start_attempts: u32,
    /// Delay between active-state polls.
    #[serde(default = "default_start_interval_secs")]
    pub start_interval_secs: u64,
    /// Wait for the upgrade lock.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Process-absence poll interval during stop.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl TimeoutConfig {
    /// Graceful stop bound.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Post-kill bound.
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    /// Delay between active-state polls.
    pub fn start_interval(&self) -> Duration {
        Duration::from_secs(self.start_interval_secs)
    }

    /// Stop poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Lock wait bound.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl ReleaseConfig {
    /// Timeout for a release download, also used for TSDB snapshot requests.
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl HealthConfig {
    /// Fixed delay between health attempts.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Timeout for a single probe request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            service: ServiceConfig::default(),
            release: ReleaseConfig::default(),
            backup: BackupConfig::default(),
            health: HealthConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            unit_name: default_unit_name(),
            binary_path: default_binary_path(),
            config_path: default_config_path(),
            data_path: default_data_path(),
            unit_path: default_unit_path(),
            listen_address: default_listen_address(),
            user: default_service_user(),
            group: default_service_user(),
            retention_time: default_retention_time(),
            owner_uid: None,
            owner_gid: None,
        }
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            base_url: default_release_base_url(),
            os: default_os(),
            arch: default_arch(),
            download_timeout_secs: default_download_timeout_secs(),
            allow_insecure_http: false,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: default_backup_root(),
            retention_days: default_retention_days(),
            method: BackupMethodPreference::Auto,
            stop_for_copy: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_health_attempts(),
            interval_secs: default_health_interval_secs(),
            query_probe: true,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout_secs(),
            kill_timeout_secs: default_kill_timeout_secs(),
            start_attempts: default_start_attempts(),
            start_interval_secs: default_start_interval_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/promup")
}

fn default_unit_name() -> String {
    "prometheus.service".to_string()
}

fn default_binary_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/prometheus")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/prometheus/prometheus.yml")
}

fn default_data_path() -> PathBuf {
    PathBuf::from("/var/lib/prometheus")
}

fn default_unit_path() -> PathBuf {
    PathBuf::from("/etc/systemd/system/prometheus.service")
}

fn default_listen_address() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_service_user() -> String {
    "prometheus".to_string()
}

fn default_retention_time() -> String {
    "15d".to_string()
}

fn default_release_base_url() -> String {
    "https://github.com/prometheus/prometheus/releases/download".to_string()
}

fn default_os() -> String {
    std::env::consts::OS.to_string()
}

/// Map the Rust architecture name onto the Go-style tag used by release
/// archive names.
fn default_arch() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "arm" => "armv7",
        "powerpc64" => "ppc64le",
        other => other,
    }
    .to_string()
}

fn default_download_timeout_secs() -> u64 {
    crate::constants::default_download_timeout().as_secs()
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("/var/backups/promup")
}

fn default_retention_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

fn default_health_attempts() -> u32 {
    30
}

fn default_health_interval_secs() -> u64 {
    2
}

fn default_request_timeout_secs() -> u64 {
    crate::constants::default_request_timeout().as_secs()
}

fn default_stop_timeout_secs() -> u64 {
    30
}

fn default_kill_timeout_secs() -> u64 {
    10
}

fn default_start_attempts() -> u32 {
    15
}

fn default_start_interval_secs() -> u64 {
    2
}

fn default_lock_timeout_secs() -> u64 {
    crate::constants::default_lock_timeout().as_secs()
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl UpgradeConfig {
    /// Timeout for a TSDB snapshot request. Snapshots of large TSDBs take
    /// about as long as a release download, far longer than a probe.
    pub fn snapshot_timeout(&self) -> Duration {
        self.release.download_timeout()
    }
}

impl UpgradeConfig {
    /// Load configuration from an optional explicit path.
    ///
    /// Resolution order: the explicit path, then `PROMUP_CONFIG`, then
    /// [`DEFAULT_CONFIG_PATH`]. An explicit path that does not exist is an
    /// error; a missing default file yields [`UpgradeConfig::default`].
    pub async fn load_with_optional(path: Option<PathBuf>) -> Result<Self> {
        let explicit = path.or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        match explicit {
            Some(path) => Self::load_from(&path).await,
            None => {
                let path = PathBuf::from(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::load_from(&path).await
                } else {
                    debug!("No config at {}, using defaults", path.display());
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a specific file.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.expand_paths()?;
        Ok(config)
    }

    /// Expand `~` and environment variables in every path value.
    fn expand_paths(&mut self) -> Result<()> {
        self.state_dir = expand(&self.state_dir)?;
        self.service.binary_path = expand(&self.service.binary_path)?;
        self.service.config_path = expand(&self.service.config_path)?;
        self.service.data_path = expand(&self.service.data_path)?;
        self.service.unit_path = expand(&self.service.unit_path)?;
        self.backup.root = expand(&self.backup.root)?;
        Ok(())
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw).map_err(|e| UpgradeError::ConfigError {
        message: format!("cannot expand path '{raw}': {e}"),
    })?;
    Ok(PathBuf::from(expanded.as_ref()))
}
