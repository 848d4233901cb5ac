//! Global constants used throughout the promup codebase.
//!
//! Timeouts, poll intervals and well-known names that more than one module
//! needs. Values that operators may want to tune live in
//! [`crate::config::UpgradeConfig`] instead and only default to these.

use std::time::Duration;

/// Default location of the operator configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/promup/promup.toml";

/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "PROMUP_CONFIG";

/// Name of the lock file inside the state directory.
pub const LOCK_FILE_NAME: &str = "promup.lock";

/// Name of the run journal inside the state directory.
pub const JOURNAL_FILE_NAME: &str = "last-run.json";

/// Name of the metadata file inside every backup directory.
pub const BACKUP_METADATA_FILE: &str = "backup.json";

/// Name of the checksum manifest published with every release.
pub const CHECKSUM_MANIFEST_NAME: &str = "sha256sums.txt";

/// Executable name of the managed server inside release archives.
pub const SERVER_BINARY_NAME: &str = "prometheus";

/// Executable name of the config validator shipped next to the server.
pub const VALIDATOR_BINARY_NAME: &str = "promtool";

/// Number of journal lines attached to a failed service start.
pub const SERVICE_LOG_TAIL_LINES: usize = 20;

/// Maximum backoff delay for exponential backoff (500ms).
pub const MAX_BACKOFF_DELAY_MS: u64 = 500;

/// Starting delay for exponential backoff (10ms).
pub const STARTING_BACKOFF_DELAY_MS: u64 = 10;

/// Attempts made when exec'ing a freshly written binary reports
/// "text file busy".
pub const EXEC_BUSY_RETRIES: u32 = 5;

/// Default timeout for acquiring the upgrade lock (5 seconds).
///
/// Short on purpose: a second invocation should report the running upgrade
/// instead of queueing behind it.
pub fn default_lock_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Timeout for a single management-port HTTP request (5 seconds).
pub fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Timeout for downloading one release artifact (5 minutes).
pub fn default_download_timeout() -> Duration {
    Duration::from_secs(300)
}
