//! Restoring a backup after a failed stage, or on operator request.
//!
//! [`RollbackCoordinator::restore`] puts back binary, validator,
//! configuration and unit byte-for-byte and restarts the service. The data
//! directory is deliberately left alone: a new release may already have
//! rewritten it, and swapping TSDB directories underneath an operator is a
//! decision for a human. [`RollbackCoordinator::restore_data`] performs that
//! step when asked explicitly, moving the live directory aside instead of
//! deleting it.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::backup::Backup;
use crate::core::UpgradeError;
use crate::service::{InstalledService, ServiceController, Supervisor};
use crate::utils::fs::copy_dir_blocking;
use crate::utils::{DirStats, atomic_copy};

/// What a rollback restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    /// Backup used.
    pub backup_id: String,
    /// Files that were replaced.
    pub restored: Vec<PathBuf>,
    /// Data copy the operator may restore manually.
    pub data_backup: Option<PathBuf>,
}

/// What a data restore did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRestoreReport {
    /// Where the previous live data directory was moved.
    pub moved_aside: Option<PathBuf>,
    /// Restored files and bytes.
    pub restored: DirStats,
}

/// Restores backups onto the installation.
pub struct RollbackCoordinator {
    service: InstalledService,
    controller: Arc<ServiceController>,
    supervisor: Arc<dyn Supervisor>,
}

impl RollbackCoordinator {
    /// Create a coordinator.
    pub fn new(
        service: InstalledService,
        controller: Arc<ServiceController>,
        supervisor: Arc<dyn Supervisor>,
    ) -> Self {
        Self {
            service,
            controller,
            supervisor,
        }
    }

    /// Restore binary, validator, config and unit from `backup` and restart.
    pub async fn restore(&self, backup: &Backup) -> Result<RollbackReport> {
        info!(backup = %backup.id, stage = %backup.stage, "Rolling back");
        self.controller.stop().await.context("Failed to stop service before restoring")?;

        let artifacts = &backup.artifacts;
        let validator = self.service.validator_path();
        let pairs = [
            (&artifacts.binary, self.service.binary_path.as_path()),
            (&artifacts.validator, validator.as_path()),
            (&artifacts.config, self.service.config_path.as_path()),
            (&artifacts.unit, self.service.unit_path.as_path()),
        ];

        let mut restored = Vec::new();
        for (relative, target) in pairs {
            let Some(source) = backup.artifact_path(relative.as_ref()) else {
                continue;
            };
            atomic_copy(&source, target)
                .with_context(|| format!("Failed to restore {}", target.display()))?;
            info!(path = %target.display(), "Restored");
            restored.push(target.to_path_buf());
        }
        if restored.is_empty() {
            bail!("Backup {} contains nothing to restore", backup.id);
        }

        self.supervisor.daemon_reload().await.context("daemon-reload failed after restore")?;
        self.controller.start().await.context("Service did not start after restore")?;

        let data_backup = backup.data_dir();
        if let Some(data) = &data_backup {
            warn!(
                backup_data = %data.display(),
                live_data = %self.service.data_path.display(),
                "Data directory was not restored automatically; use 'promup rollback --restore-data' if needed"
            );
        }

        info!(backup = %backup.id, "Rollback complete");
        Ok(RollbackReport {
            backup_id: backup.id.clone(),
            restored,
            data_backup,
        })
    }

    /// Replace the live data directory with the backup's copy.
    ///
    /// Inconsistent backups (live copies) are refused unless
    /// `accept_inconsistent` is set.
    pub async fn restore_data(
        &self,
        backup: &Backup,
        accept_inconsistent: bool,
    ) -> Result<DataRestoreReport> {
        if !backup.consistent && !accept_inconsistent {
            bail!(UpgradeError::ConfigError {
                message: format!(
                    "backup {} holds an inconsistent data copy; pass --accept-inconsistent to restore it anyway",
                    backup.id
                ),
            });
        }
        let source = backup
            .data_dir()
            .filter(|dir| dir.is_dir())
            .with_context(|| format!("Backup {} has no data directory", backup.id))?;

        self.controller.stop().await.context("Failed to stop service before restoring data")?;

        let live = &self.service.data_path;
        let moved_aside = if live.exists() {
            let aside = aside_path(live);
            tokio::fs::rename(live, &aside)
                .await
                .with_context(|| format!("Failed to move {} aside", live.display()))?;
            info!(from = %live.display(), to = %aside.display(), "Moved live data aside");
            Some(aside)
        } else {
            None
        };

        let restored = copy_dir_blocking(source, live.clone()).await?;
        if let Some(aside) = &moved_aside {
            copy_owner(aside, live)?;
        }

        self.controller.start().await.context("Service did not start after data restore")?;
        info!(files = restored.files, "Data restored");
        Ok(DataRestoreReport {
            moved_aside,
            restored,
        })
    }
}

fn aside_path(live: &Path) -> PathBuf {
    let name = live.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    live.with_file_name(format!("{name}.pre-restore-{}", Utc::now().format("%Y%m%dT%H%M%SZ")))
}

/// Give every entry below `target` the owner of `reference`.
#[cfg(unix)]
fn copy_owner(reference: &Path, target: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let metadata = std::fs::metadata(reference)
        .with_context(|| format!("Failed to stat {}", reference.display()))?;
    let (uid, gid) = (metadata.uid(), metadata.gid());
    let current = std::fs::metadata(target)?;
    if current.uid() == uid && current.gid() == gid {
        return Ok(());
    }

    for entry in walkdir::WalkDir::new(target) {
        let entry = entry.with_context(|| format!("Failed to walk {}", target.display()))?;
        std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid))
            .with_context(|| format!("Failed to set owner of {}", entry.path().display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn copy_owner(_reference: &Path, _target: &Path) -> Result<()> {
    Ok(())
}
