//! Staged upgrade orchestration.
//!
//! [`UpgradeOrchestrator`] composes version resolution, migration checks,
//! backups, installation, service control and health verification into one
//! run. A run is guarded by [`UpgradeLock`], walks the [`UpgradeState`]
//! machine for every stage and records each transition in the
//! [`RunJournal`].
//!
//! # Flow of one stage
//!
//! ```text
//! Checked ── backup ──> BackedUp ── stop, rewrite ──> Migrated ── install ──> Installed
//!                                                                               │
//!   Complete <── HealthVerified <── probes ── Restarted <── validate, start ───┘
//!
//! any failure after BackedUp ──> RollingBack ──> RolledBack | RollbackFailed
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use promup_cli::config::UpgradeConfig;
//! use promup_cli::upgrade::{Collaborators, UpgradeOptions, UpgradeOrchestrator};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = UpgradeConfig::load_with_optional(None).await?;
//! let orchestrator = UpgradeOrchestrator::new(config.clone(), Collaborators::system(&config)?)?;
//! let mut options = UpgradeOptions::new("3.8.1", &config);
//! options.dry_run = true;
//! let outcome = orchestrator.run(&options).await?;
//! # Ok(())
//! # }
//! ```

pub mod journal;
pub mod lock;
pub mod orchestrator;
pub mod state;

pub use journal::{JournalEntry, RunJournal, RunOutcome};
pub use lock::UpgradeLock;
pub use orchestrator::{
    Collaborators, DryRunReport, ManualRollback, MigrationSummary, RollbackRequest, StagePreview,
    StageReport, StageSelection, UpgradeOptions, UpgradeOrchestrator, UpgradeOutcome, UpgradeReport,
};
pub use state::{RunTracker, UpgradeState};
