//! Persistent record of the last mutating run.
//!
//! `<state_dir>/last-run.json` is rewritten atomically after every state
//! transition, so a crashed or killed run still shows how far it got. A
//! journal write failure is logged and otherwise ignored: the journal is an
//! audit aid and must never be the reason an upgrade aborts or skips its
//! rollback.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::state::UpgradeState;
use crate::constants::JOURNAL_FILE_NAME;
use crate::utils::atomic_write;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Still running, or the process died.
    Running,
    Succeeded,
    Failed,
}

/// One state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub stage: String,
    pub state: UpgradeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The journal file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJournal {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub from: Option<String>,
    pub target: String,
    /// Stage names in plan order.
    pub plan: Vec<String>,
    pub outcome: RunOutcome,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub entries: Vec<JournalEntry>,
    #[serde(skip)]
    path: PathBuf,
}

impl RunJournal {
    /// Start a journal for a run and write it immediately.
    pub fn start(state_dir: &Path, from: Option<String>, target: String, plan: Vec<String>) -> Self {
        let journal = Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            finished_at: None,
            from,
            target,
            plan,
            outcome: RunOutcome::Running,
            error: None,
            entries: Vec::new(),
            path: state_dir.join(JOURNAL_FILE_NAME),
        };
        journal.persist();
        journal
    }

    /// Append a transition.
    pub fn record(&mut self, stage: &str, state: UpgradeState, detail: Option<String>) {
        self.entries.push(JournalEntry {
            at: Utc::now(),
            stage: stage.to_string(),
            state,
            detail,
        });
        self.persist();
    }

    /// Mark the run succeeded.
    pub fn finish_succeeded(&mut self) {
        self.outcome = RunOutcome::Succeeded;
        self.finished_at = Some(Utc::now());
        self.persist();
    }

    /// Mark the run failed in `stage` while in `state`.
    pub fn finish_failed(&mut self, stage: &str, state: UpgradeState, error: String) {
        self.outcome = RunOutcome::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(format!("{stage} ({state}): {error}"));
        self.persist();
    }

    /// Last recorded state.
    pub fn last_state(&self) -> Option<UpgradeState> {
        self.entries.last().map(|entry| entry.state)
    }

    /// Load the journal from `state_dir`, if one was written.
    pub async fn load(state_dir: &Path) -> Result<Option<Self>> {
        let path = state_dir.join(JOURNAL_FILE_NAME);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        let mut journal: Self = serde_json::from_slice(&content)
            .with_context(|| format!("Invalid run journal {}", path.display()))?;
        journal.path = path;
        Ok(Some(journal))
    }

    fn persist(&self) {
        let result = serde_json::to_vec_pretty(self)
            .context("Failed to serialise run journal")
            .and_then(|bytes| atomic_write(&self.path, &bytes));
        if let Err(e) = result {
            warn!(path = %self.path.display(), "Failed to write run journal: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_journal_persists_every_transition() {
        let temp = TempDir::new().unwrap();
        let mut journal = RunJournal::start(
            temp.path(),
            Some("2.48.1".to_string()),
            "3.8.1".to_string(),
            vec!["intermediate-2.55.1".to_string(), "upgrade-3.8.1".to_string()],
        );
        journal.record("plan", UpgradeState::PlanResolved, None);
        journal.record("intermediate-2.55.1", UpgradeState::Checked, Some("2 issue(s)".to_string()));

        let loaded = RunJournal::load(temp.path()).await.unwrap().unwrap();
        assert_eq!(loaded.outcome, RunOutcome::Running);
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.last_state(), Some(UpgradeState::Checked));
        assert_eq!(loaded.entries[1].detail.as_deref(), Some("2 issue(s)"));

        journal.finish_failed("upgrade-3.8.1", UpgradeState::RolledBack, "checksum".to_string());
        let loaded = RunJournal::load(temp.path()).await.unwrap().unwrap();
        assert_eq!(loaded.outcome, RunOutcome::Failed);
        assert!(loaded.error.unwrap().contains("rolled-back"));
    }

    #[tokio::test]
    async fn test_missing_journal() {
        let temp = TempDir::new().unwrap();
        assert!(RunJournal::load(temp.path()).await.unwrap().is_none());
    }

    #[test]
    fn test_unwritable_state_dir_only_warns() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let mut journal = RunJournal::start(&blocker, None, "3.8.1".to_string(), Vec::new());
        journal.record("fresh-install-3.8.1", UpgradeState::Checked, None);
        assert_eq!(journal.entries.len(), 1);
    }
}
