//! Integration test suite for promup
//!
//! End-to-end scenarios against a complete installation in a temporary
//! directory: real release archives on a `file://` mirror, real fake server
//! and validator scripts, and in-memory systemd, health and snapshot doubles.
//!
//! # Running Integration Tests
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//!
//! - **upgrade_flow**: multi-stage upgrades, failures and rollbacks, no-ops
//! - **dry_run**: read-only previews
//! - **rollback**: manual restores and backup retention
//! - **cli**: the compiled `promup` binary

mod common;

mod cli;
mod dry_run;
mod rollback;
mod upgrade_flow;
