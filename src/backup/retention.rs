use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use tracing::info;

use super::list_backups;

/// Deletes backups older than the retention window.
///
/// The newest backup is always kept, however old it is; it may be the only
/// way back from the last successful upgrade.
pub struct RetentionManager {
    root: PathBuf,
}

impl RetentionManager {
    /// Manage backups below `root`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
        }
    }

    /// Prune backups older than `retention_days`. Returns the removed ids.
    pub async fn prune(&self, retention_days: u32) -> Result<Vec<String>> {
        self.prune_at(retention_days, Utc::now()).await
    }

    /// Like [`prune`](Self::prune), relative to `now`.
    pub async fn prune_at(&self, retention_days: u32, now: DateTime<Utc>) -> Result<Vec<String>> {
        let backups = list_backups(&self.root).await?;
        let Some(newest) = backups.last() else {
            return Ok(Vec::new());
        };
        // A window reaching past chrono's range expires nothing.
        let Some(cutoff) =
            Duration::try_days(i64::from(retention_days)).and_then(|window| now.checked_sub_signed(window))
        else {
            info!(retention_days, "Retention window exceeds the representable range, nothing to prune");
            return Ok(Vec::new());
        };

        let mut pruned = Vec::new();
        for backup in backups.iter().filter(|b| b.id != newest.id && b.created_at < cutoff) {
            tokio::fs::remove_dir_all(&backup.dir)
                .await
                .with_context(|| format!("Failed to remove backup {}", backup.dir.display()))?;
            info!(backup = %backup.id, created_at = %backup.created_at, "Pruned backup");
            pruned.push(backup.id.clone());
        }
        Ok(pruned)
    }
}
