use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use promup_cli::test_utils::TestInstallation;
use serial_test::serial;
use std::path::Path;

fn promup(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("promup").expect("promup binary is built");
    cmd.arg("--config").arg(config).env("NO_COLOR", "1").env("PROMUP_NO_PROGRESS", "1").env_remove("RUST_LOG");
    cmd
}

#[cfg(unix)]
#[test]
#[serial]
fn test_plan_lists_intermediate_stage() -> Result<()> {
    let install = TestInstallation::new("2.48.1")?;
    let config = install.write_config_file()?;

    promup(&config)
        .args(["plan", "3.8.1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1. intermediate-2.55.1"))
        .stdout(predicate::str::contains("2. upgrade-3.8.1"));
    Ok(())
}

#[cfg(unix)]
#[test]
#[serial]
fn test_check_reports_flags_keys_and_expressions() -> Result<()> {
    let install = TestInstallation::new("2.55.1")?;
    let config = install.write_config_file()?;

    promup(&config)
        .args(["check", "3.8.1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("storage.tsdb.retention"))
        .stdout(predicate::str::contains("scrape_classic_histograms"))
        .stdout(predicate::str::contains("holt_winters"));
    Ok(())
}

#[cfg(unix)]
#[test]
#[serial]
fn test_dry_run_prints_preview_and_changes_nothing() -> Result<()> {
    let install = TestInstallation::new("2.48.1")?;
    let config = install.write_config_file()?;
    let files = install.snapshot_files();

    promup(&config)
        .args(["upgrade", "3.8.1", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Dry run:"))
        .stdout(predicate::str::contains("would install"))
        .stdout(predicate::str::contains("upgrade-3.8.1"));

    assert_eq!(install.snapshot_files(), files);
    assert!(std::fs::read_dir(install.backup_root())?.next().is_none());
    Ok(())
}

#[cfg(unix)]
#[test]
#[serial]
fn test_status_and_empty_backup_list() -> Result<()> {
    let install = TestInstallation::new("2.55.1")?;
    let config = install.write_config_file()?;

    promup(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Installed: 2.55.1"))
        .stdout(predicate::str::contains("Last run:  none recorded"));

    promup(&config).args(["backup", "list"]).assert().success().stdout(predicate::str::contains("No backups"));
    Ok(())
}

#[test]
fn test_invalid_version_fails_with_message() -> Result<()> {
    let install = TestInstallation::empty()?;
    let config = install.write_config_file()?;

    promup(&config)
        .args(["plan", "latest"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("latest"));
    Ok(())
}

#[test]
fn test_rollback_without_backups_fails() -> Result<()> {
    let install = TestInstallation::empty()?;
    let config = install.write_config_file()?;

    promup(&config)
        .arg("rollback")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no backups found"));
    Ok(())
}

#[test]
fn test_missing_explicit_config_is_an_error() {
    promup(Path::new("/nonexistent/promup.toml"))
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("/nonexistent/promup.toml"));
}
