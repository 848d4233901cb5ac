//! Upgrade state machine.
//!
//! A run moves through `Idle → PlanResolved` once, then every stage walks
//! `Checked → BackedUp → Migrated → Installed → Restarted → HealthVerified →
//! Complete`. `BackedUp` is skipped when the stage takes no backup (fresh
//! install, `--skip-backup`). Once a backup exists a failure branches into
//! `RollingBack`, which ends in `RolledBack` or the terminal `RollbackFailed`.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use super::journal::RunJournal;

/// One state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpgradeState {
    Idle,
    PlanResolved,
    Checked,
    BackedUp,
    Migrated,
    Installed,
    Restarted,
    HealthVerified,
    Complete,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl UpgradeState {
    /// Whether no further transition is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::RolledBack | Self::RollbackFailed)
    }

    /// States from which a rollback may start: a backup exists and the stage
    /// has not completed.
    fn can_roll_back(self) -> bool {
        matches!(
            self,
            Self::BackedUp | Self::Migrated | Self::Installed | Self::Restarted | Self::HealthVerified
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: Self) -> bool {
        use UpgradeState::*;
        match (self, next) {
            (Idle, PlanResolved)
            | (PlanResolved, Checked)
            | (Checked, BackedUp)
            | (Checked, Migrated)
            | (BackedUp, Migrated)
            | (Migrated, Installed)
            | (Installed, Restarted)
            | (Restarted, HealthVerified)
            | (HealthVerified, Complete)
            | (Complete, Checked)
            | (RollingBack, RolledBack)
            | (RollingBack, RollbackFailed) => true,
            (from, RollingBack) => from.can_roll_back(),
            _ => false,
        }
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::PlanResolved => "plan-resolved",
            Self::Checked => "checked",
            Self::BackedUp => "backed-up",
            Self::Migrated => "migrated",
            Self::Installed => "installed",
            Self::Restarted => "restarted",
            Self::HealthVerified => "health-verified",
            Self::Complete => "complete",
            Self::RollingBack => "rolling-back",
            Self::RolledBack => "rolled-back",
            Self::RollbackFailed => "rollback-failed",
        };
        f.write_str(name)
    }
}

/// Current state of a run plus its journal.
///
/// Every transition is validated, logged with the stage name and appended to
/// the journal.
#[derive(Debug)]
pub struct RunTracker {
    state: UpgradeState,
    journal: Option<RunJournal>,
}

impl RunTracker {
    /// Tracker that persists transitions to `journal`.
    pub fn new(journal: RunJournal) -> Self {
        Self {
            state: UpgradeState::Idle,
            journal: Some(journal),
        }
    }

    /// Tracker that only logs.
    pub fn detached() -> Self {
        Self {
            state: UpgradeState::Idle,
            journal: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> UpgradeState {
        self.state
    }

    /// Journal, when persisted.
    pub fn journal(&self) -> Option<&RunJournal> {
        self.journal.as_ref()
    }

    /// Move to `next`, refusing illegal transitions.
    pub fn advance(&mut self, stage: &str, next: UpgradeState, detail: Option<String>) -> Result<()> {
        if !self.state.can_advance_to(next) {
            bail!("Illegal state transition {} -> {next} in stage '{stage}'", self.state);
        }
        match &detail {
            Some(detail) => info!(stage, from = %self.state, to = %next, detail = %detail, "State transition"),
            None => info!(stage, from = %self.state, to = %next, "State transition"),
        }
        self.state = next;
        if let Some(journal) = &mut self.journal {
            journal.record(stage, next, detail);
        }
        Ok(())
    }

    /// Record a failure that leaves the state unchanged (no rollback possible).
    pub fn fail(&mut self, stage: &str, error: &anyhow::Error) {
        warn!(stage, state = %self.state, "Stage failed: {error:#}");
        if let Some(journal) = &mut self.journal {
            journal.finish_failed(stage, self.state, format!("{error:#}"));
        }
    }

    /// Mark the whole run finished.
    pub fn finish(&mut self) {
        if let Some(journal) = &mut self.journal {
            journal.finish_succeeded();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use UpgradeState::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            Idle,
            PlanResolved,
            Checked,
            BackedUp,
            Migrated,
            Installed,
            Restarted,
            HealthVerified,
            Complete,
            Checked,
            Migrated,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_rollback_only_after_backup() {
        assert!(!PlanResolved.can_advance_to(RollingBack));
        assert!(!Checked.can_advance_to(RollingBack));
        for state in [BackedUp, Migrated, Installed, Restarted, HealthVerified] {
            assert!(state.can_advance_to(RollingBack), "{state}");
        }
        assert!(!Complete.can_advance_to(RollingBack));
    }

    #[test]
    fn test_rollback_failed_is_terminal() {
        assert!(RollbackFailed.is_terminal());
        for next in [Idle, Checked, RollingBack, RolledBack, Complete] {
            assert!(!RollbackFailed.can_advance_to(next));
        }
    }

    #[test]
    fn test_tracker_rejects_skipping_states() {
        let mut tracker = RunTracker::detached();
        tracker.advance("plan", PlanResolved, None).unwrap();
        assert!(tracker.advance("upgrade-3.8.1", Installed, None).is_err());
        assert_eq!(tracker.state(), PlanResolved);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(HealthVerified.to_string(), "health-verified");
        assert_eq!(serde_json::to_string(&RollbackFailed).unwrap(), "\"rollback-failed\"");
    }
}
