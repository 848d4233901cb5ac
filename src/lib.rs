//! promup - staged upgrades for a systemd-managed Prometheus server
//!
//! Upgrading a long-running metrics server across major releases is not a
//! single binary swap: some releases change the on-disk TSDB format or remove
//! command-line flags, so an installation must pass through specific
//! intermediate versions, and a failed hop must leave it where it started.
//! promup computes that path, then walks it one stage at a time:
//!
//! 1. check the service unit, configuration and rule files for
//!    incompatibilities with the stage's version
//! 2. back up binaries, configuration, unit and TSDB data
//! 3. stop the service and rewrite deprecated flags and keys
//! 4. download, checksum-verify and install the release
//! 5. validate the configuration, restart and wait for health
//!
//! Any failure after step 2 restores that stage's backup and stops the run.
//!
//! # Modules
//!
//! - [`version`] - version parsing, boundary table and plan resolution
//! - [`migrate`] - incompatibility detection and unit/config rewriting
//! - [`backup`] - snapshot or offline-copy backups, verification, retention
//! - [`install`] - artifact download, checksum verification, binary swap
//! - [`service`] - systemd control and unit rendering
//! - [`health`] - readiness, liveness and query probes
//! - [`rollback`] - restoring backups
//! - [`upgrade`] - the orchestrator, its state machine, lock and run journal
//! - [`config`] - operator configuration (`promup.toml`)
//! - [`cli`] - the `promup` command line
//!
//! # Example
//!
//! ```bash
//! promup plan 3.8.1
//! promup upgrade 3.8.1 --dry-run
//! promup upgrade 3.8.1
//! ```

pub mod backup;
pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod health;
pub mod install;
pub mod migrate;
pub mod rollback;
pub mod service;
pub mod upgrade;
pub mod utils;
pub mod version;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
