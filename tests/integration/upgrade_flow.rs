use anyhow::Result;
use promup_cli::core::UpgradeError;
use promup_cli::test_utils::{FakeSupervisor, TestInstallation};
use promup_cli::upgrade::{
    RunJournal, RunOutcome, StageSelection, UpgradeOptions, UpgradeOutcome, UpgradeState,
};
use semver::Version;
use serial_test::serial;
use std::sync::Arc;

use crate::common::{orchestrator, root_cause};

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_two_stage_upgrade_passes_through_boundary() -> Result<()> {
    let install = TestInstallation::new("2.48.1")?;
    install.publish_release("2.55.1")?;
    install.publish_release("3.8.1")?;
    let supervisor = Arc::new(FakeSupervisor::running());
    let orchestrator = orchestrator(&install, supervisor.clone())?;

    let outcome = orchestrator.run(&UpgradeOptions::new("3.8.1", &install.config())).await?;
    let UpgradeOutcome::Completed(report) = outcome else {
        panic!("expected a completed run");
    };

    let names: Vec<_> = report.stages.iter().map(|s| s.stage.name.as_str()).collect();
    assert_eq!(names, ["intermediate-2.55.1", "upgrade-3.8.1"]);
    assert_eq!(report.stages[0].installed.version, Version::new(2, 55, 1));
    assert_eq!(report.stages[1].installed.version, Version::new(3, 8, 1));
    assert!(report.remaining.is_empty());
    assert_eq!(orchestrator.service().current_version().await?, Some(Version::new(3, 8, 1)));

    // Each stage backs up what the previous one left behind.
    let backups = orchestrator.backups().list().await?;
    assert_eq!(backups.len(), 2);
    assert_eq!(backups[0].source_version.as_deref(), Some("2.48.1"));
    assert_eq!(backups[1].source_version.as_deref(), Some("2.55.1"));

    // Flags and keys are only rewritten by the 3.x stage.
    assert!(!report.stages[0].migration.unit_rewritten);
    assert!(report.stages[1].migration.unit_rewritten);
    let service = install.service();
    let unit = std::fs::read_to_string(&service.unit_path)?;
    assert!(unit.contains("--storage.tsdb.retention.time=15d"));
    let config = std::fs::read_to_string(&service.config_path)?;
    assert!(config.contains("always_scrape_classic_histograms: true"));

    let journal = RunJournal::load(&install.config().state_dir).await?.expect("journal written");
    assert_eq!(journal.outcome, RunOutcome::Succeeded);
    assert_eq!(journal.last_state(), Some(UpgradeState::Complete));
    assert_eq!(journal.plan.len(), 2);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_checksum_failure_in_second_stage_rolls_back_that_stage_only() -> Result<()> {
    let install = TestInstallation::new("2.48.1")?;
    install.publish_release("2.55.1")?;
    install.publish_release("3.8.1")?;
    install.corrupt_checksum("3.8.1")?;
    let supervisor = Arc::new(FakeSupervisor::running());
    let orchestrator = orchestrator(&install, supervisor.clone())?;

    let err = orchestrator.run(&UpgradeOptions::new("3.8.1", &install.config())).await.unwrap_err();

    match err.downcast_ref::<UpgradeError>() {
        Some(UpgradeError::StageAborted { stage, .. }) => assert_eq!(stage, "upgrade-3.8.1"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(root_cause(&err), Some(UpgradeError::ChecksumMismatch { .. })));

    // Stage 1 stays applied; stage 2 is undone from its own backup.
    assert_eq!(orchestrator.service().current_version().await?, Some(Version::new(2, 55, 1)));
    let backups = orchestrator.backups().list().await?;
    assert_eq!(backups.len(), 2);
    let stage_two = &backups[1];
    assert_eq!(stage_two.stage, "upgrade-3.8.1");
    for (relative, live) in [
        (&stage_two.artifacts.binary, install.service().binary_path),
        (&stage_two.artifacts.config, install.service().config_path),
        (&stage_two.artifacts.unit, install.service().unit_path),
    ] {
        let saved = stage_two.artifact_path(relative.as_ref()).expect("artifact captured");
        assert_eq!(std::fs::read(saved)?, std::fs::read(&live)?, "{} differs", live.display());
    }
    assert_eq!(supervisor.calls().last().map(String::as_str), Some("start"));

    let journal = RunJournal::load(&install.config().state_dir).await?.expect("journal written");
    assert_eq!(journal.outcome, RunOutcome::Failed);
    assert_eq!(journal.last_state(), Some(UpgradeState::RolledBack));
    assert!(journal.error.unwrap_or_default().contains("upgrade-3.8.1"));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_stepwise_run_resumes_and_restores_post_stage_state() -> Result<()> {
    let install = TestInstallation::new("2.48.1")?;
    install.publish_release("2.55.1")?;
    install.publish_release("3.8.1")?;
    install.corrupt_checksum("3.8.1")?;
    let orchestrator = orchestrator(&install, Arc::new(FakeSupervisor::running()))?;

    let mut options = UpgradeOptions::new("3.8.1", &install.config());
    options.stage = StageSelection::Through(1);
    let UpgradeOutcome::Completed(report) = orchestrator.run(&options).await? else {
        panic!("expected a completed run");
    };
    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.remaining.len(), 1);
    assert_eq!(report.remaining[0].name, "upgrade-3.8.1");
    let after_stage_one = install.snapshot_files();

    // A fresh plan from 2.55.1 has a single stage, which fails.
    let err = orchestrator.run(&UpgradeOptions::new("3.8.1", &install.config())).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<UpgradeError>(), Some(UpgradeError::StageAborted { .. })));
    assert_eq!(install.snapshot_files(), after_stage_one);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_current_version_is_a_noop() -> Result<()> {
    let install = TestInstallation::new("3.8.1")?;
    let before = install.mtimes();
    let supervisor = Arc::new(FakeSupervisor::running());
    let orchestrator = orchestrator(&install, supervisor.clone())?;

    let outcome = orchestrator.run(&UpgradeOptions::new("v3.8.1", &install.config())).await?;
    assert!(matches!(outcome, UpgradeOutcome::UpToDate(ref v) if *v == Version::new(3, 8, 1)));
    assert_eq!(install.mtimes(), before);
    assert!(supervisor.calls().is_empty());
    assert!(orchestrator.backups().list().await?.is_empty());
    assert!(RunJournal::load(&install.config().state_dir).await?.is_none());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_second_run_after_success_changes_nothing() -> Result<()> {
    let install = TestInstallation::new("2.55.1")?;
    install.publish_release("3.8.1")?;
    let orchestrator = orchestrator(&install, Arc::new(FakeSupervisor::running()))?;
    let options = UpgradeOptions::new("3.8.1", &install.config());

    orchestrator.run(&options).await?;
    let files = install.snapshot_files();
    let backups = orchestrator.backups().list().await?.len();

    let outcome = orchestrator.run(&options).await?;
    assert!(matches!(outcome, UpgradeOutcome::UpToDate(_)));
    assert_eq!(install.snapshot_files(), files);
    assert_eq!(orchestrator.backups().list().await?.len(), backups);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_forced_reinstall_runs_one_stage() -> Result<()> {
    let install = TestInstallation::new("3.8.1")?;
    install.publish_release("3.8.1")?;
    let orchestrator = orchestrator(&install, Arc::new(FakeSupervisor::running()))?;

    let mut options = UpgradeOptions::new("3.8.1", &install.config());
    options.force = true;
    let UpgradeOutcome::Completed(report) = orchestrator.run(&options).await? else {
        panic!("expected a completed run");
    };
    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.stages[0].stage.name, "reinstall-3.8.1");
    assert!(report.stages[0].backup.is_some());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_concurrent_run_is_refused() -> Result<()> {
    let install = TestInstallation::new("2.55.1")?;
    install.publish_release("3.8.1")?;
    let before = install.snapshot_files();
    let orchestrator = orchestrator(&install, Arc::new(FakeSupervisor::running()))?;

    let _held = orchestrator.lock().await?;
    let err = orchestrator.run(&UpgradeOptions::new("3.8.1", &install.config())).await.unwrap_err();

    match err.downcast_ref::<UpgradeError>() {
        Some(UpgradeError::UpgradeInProgress { pid }) => assert_eq!(*pid, Some(std::process::id())),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(install.snapshot_files(), before);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_skip_backup_failure_is_not_rolled_back() -> Result<()> {
    let install = TestInstallation::new("2.55.1")?;
    install.publish_release("3.8.1")?;
    install.corrupt_checksum("3.8.1")?;
    let orchestrator = orchestrator(&install, Arc::new(FakeSupervisor::running()))?;

    let mut options = UpgradeOptions::new("3.8.1", &install.config());
    options.skip_backup = true;
    let err = orchestrator.run(&options).await.unwrap_err();

    assert!(matches!(err.downcast_ref::<UpgradeError>(), Some(UpgradeError::ChecksumMismatch { .. })));
    assert!(orchestrator.backups().list().await?.is_empty());
    let journal = RunJournal::load(&install.config().state_dir).await?.expect("journal written");
    assert_eq!(journal.outcome, RunOutcome::Failed);
    Ok(())
}
