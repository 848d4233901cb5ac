use anyhow::Result;
use promup_cli::core::UpgradeError;
use promup_cli::migrate::IssueSource;
use promup_cli::test_utils::{FakeSupervisor, TestInstallation};
use promup_cli::upgrade::{RunJournal, StageSelection, UpgradeOptions, UpgradeOutcome};
use serial_test::serial;
use std::sync::Arc;

use crate::common::orchestrator;

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_dry_run_previews_every_stage_and_touches_nothing() -> Result<()> {
    let install = TestInstallation::new("2.48.1")?;
    let files = install.snapshot_files();
    let mtimes = install.mtimes();
    let supervisor = Arc::new(FakeSupervisor::running());
    let orchestrator = orchestrator(&install, supervisor.clone())?;

    let mut options = UpgradeOptions::new("3.8.1", &install.config());
    options.dry_run = true;
    let UpgradeOutcome::DryRun(report) = orchestrator.run(&options).await? else {
        panic!("expected a dry-run report");
    };

    assert_eq!(report.stages.len(), 2);
    assert_eq!(report.stages[0].stage.name, "intermediate-2.55.1");
    assert!(report.stages[0].artifact.archive_name.ends_with("2.55.1.linux-amd64.tar.gz"));

    // The 3.x stage sees the unit and config the earlier stage would leave.
    let last = &report.stages[1];
    assert!(last.migration.unit_rewritten);
    assert!(!last.migration.config_changes.is_empty());
    assert!(last.issues.iter().any(|i| i.source == IssueSource::Flags));
    assert!(last.issues.iter().any(|i| i.source == IssueSource::RuleFile));

    let estimate = report.stages[0].backup.as_ref().expect("backup estimated");
    assert!(estimate.data.files > 0);
    assert!(estimate.stops_service);

    // Nothing was written, stopped or recorded.
    assert_eq!(install.snapshot_files(), files);
    assert_eq!(install.mtimes(), mtimes);
    assert!(supervisor.calls().is_empty());
    assert!(orchestrator.backups().list().await?.is_empty());
    assert!(RunJournal::load(&install.config().state_dir).await?.is_none());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_dry_run_honours_stage_selection() -> Result<()> {
    let install = TestInstallation::new("2.48.1")?;
    let orchestrator = orchestrator(&install, Arc::new(FakeSupervisor::stopped()))?;

    let mut options = UpgradeOptions::new("3.8.1", &install.config());
    options.dry_run = true;
    options.stage = StageSelection::Through(1);
    let UpgradeOutcome::DryRun(report) = orchestrator.run(&options).await? else {
        panic!("expected a dry-run report");
    };
    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.remaining.len(), 1);

    options.stage = StageSelection::Through(3);
    let err = orchestrator.run(&options).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<UpgradeError>(),
        Some(UpgradeError::InvalidStage { requested: 3, available: 2 })
    ));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_dry_run_without_installation_plans_fresh_install() -> Result<()> {
    let install = TestInstallation::empty()?;
    let orchestrator = orchestrator(&install, Arc::new(FakeSupervisor::stopped()))?;

    let mut options = UpgradeOptions::new("3.8.1", &install.config());
    options.dry_run = true;
    let UpgradeOutcome::DryRun(report) = orchestrator.run(&options).await? else {
        panic!("expected a dry-run report");
    };
    assert_eq!(report.stages.len(), 1);
    let stage = &report.stages[0];
    assert_eq!(stage.stage.name, "fresh-install-3.8.1");
    assert!(stage.backup.is_none());
    assert!(stage.migration.unit_generated);
    assert!(stage.migration.config_created);
    assert!(!install.service().unit_path.exists());
    Ok(())
}
