use anyhow::Result;
use promup_cli::backup::{BackupOptions, RetentionManager};
use promup_cli::config::BackupMethodPreference;
use promup_cli::core::UpgradeError;
use promup_cli::test_utils::{FIXTURE_BLOCK, FakeSupervisor, TestInstallation};
use promup_cli::upgrade::{RollbackRequest, UpgradeOptions};
use semver::Version;
use serial_test::serial;
use std::sync::Arc;

use crate::common::orchestrator;

fn file_copy(stop_for_copy: bool) -> BackupOptions {
    BackupOptions {
        preference: BackupMethodPreference::File,
        stop_for_copy,
    }
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_manual_rollback_restores_latest_backup() -> Result<()> {
    let install = TestInstallation::new("2.55.1")?;
    install.publish_release("3.8.1")?;
    let before = install.snapshot_files();
    let orchestrator = orchestrator(&install, Arc::new(FakeSupervisor::running()))?;
    orchestrator.run(&UpgradeOptions::new("3.8.1", &install.config())).await?;
    assert_ne!(install.snapshot_files(), before);

    let restored = orchestrator.manual_rollback(&RollbackRequest::default()).await?;

    assert!(restored.data.is_none());
    assert!(restored.report.data_backup.is_some());
    assert_eq!(install.snapshot_files(), before);
    assert_eq!(orchestrator.service().current_version().await?, Some(Version::new(2, 55, 1)));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_data_restore_requires_accepting_inconsistent_copy() -> Result<()> {
    let install = TestInstallation::new("2.55.1")?;
    let orchestrator = orchestrator(&install, Arc::new(FakeSupervisor::running()))?;
    let backup = orchestrator.create_backup(file_copy(false)).await?;
    assert!(!backup.consistent);

    let data_path = install.service().data_path;
    std::fs::remove_dir_all(data_path.join(FIXTURE_BLOCK))?;

    let mut request = RollbackRequest {
        backup_id: Some(backup.id.clone()),
        restore_data: true,
        accept_inconsistent: false,
    };
    let err = orchestrator.manual_rollback(&request).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<UpgradeError>(), Some(UpgradeError::ConfigError { .. })));
    assert!(!data_path.join(FIXTURE_BLOCK).exists());

    request.accept_inconsistent = true;
    let restored = orchestrator.manual_rollback(&request).await?;
    let data = restored.data.expect("data restored");
    assert!(data.restored.files > 0);
    let aside = data.moved_aside.expect("live data moved aside");
    assert!(aside.to_string_lossy().contains(".pre-restore-"));
    assert!(data_path.join(FIXTURE_BLOCK).join("meta.json").is_file());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_unknown_backup_id_fails() -> Result<()> {
    let install = TestInstallation::new("2.55.1")?;
    let orchestrator = orchestrator(&install, Arc::new(FakeSupervisor::running()))?;

    let request = RollbackRequest {
        backup_id: Some("does-not-exist".to_string()),
        ..RollbackRequest::default()
    };
    assert!(orchestrator.manual_rollback(&request).await.is_err());
    assert!(orchestrator.manual_rollback(&RollbackRequest::default()).await.is_err());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_prune_keeps_newest_backup() -> Result<()> {
    let install = TestInstallation::new("2.55.1")?;
    let orchestrator = orchestrator(&install, Arc::new(FakeSupervisor::stopped()))?;
    let first = orchestrator.create_backup(file_copy(true)).await?;
    let second = orchestrator.create_backup(file_copy(true)).await?;
    assert_ne!(first.id, second.id);

    let pruned = RetentionManager::new(install.backup_root()).prune(0).await?;

    assert_eq!(pruned, vec![first.id]);
    let remaining = orchestrator.backups().list().await?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, second.id);

    // The newest backup survives any retention.
    assert!(RetentionManager::new(install.backup_root()).prune(0).await?.is_empty());
    Ok(())
}
