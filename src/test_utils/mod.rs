//! Test utilities for promup
//!
//! Fixtures for a complete server installation living in a temporary
//! directory, plus in-memory doubles for the collaborators that talk to the
//! outside world (systemd, the HTTP health endpoints and the snapshot API).
//!
//! # Example
//!
//! ```rust,no_run
//! use promup_cli::test_utils::{FakeSupervisor, TestInstallation};
//!
//! let install = TestInstallation::new("2.55.1").unwrap();
//! install.publish_release("3.8.1").unwrap();
//! let supervisor = FakeSupervisor::running();
//! assert!(install.service().binary_path.exists());
//! ```

pub mod fakes;
pub mod fixtures;

pub use fakes::{FakeProbe, FakeSnapshots, FakeSupervisor};
pub use fixtures::{
    FIXTURE_BLOCK, INVALID_CONFIG_MARKER, TestInstallation, write_block, write_fake_server,
    write_fake_validator, write_release_archive,
};

use std::sync::Once;
use tracing::Level;
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests, once per process.
///
/// Uses `level` when given, otherwise `RUST_LOG`; with neither, logging stays
/// off.
///
/// ```bash
/// RUST_LOG=promup_cli=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .try_init();
    });
}
