use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use super::CommandContext;
use super::render;
use crate::config::BackupMethodPreference;
use crate::upgrade::{StageSelection, UpgradeOptions, UpgradeOutcome};

/// Arguments of `promup upgrade`.
///
/// # Examples
///
/// ```bash
/// # Preview every stage without touching the installation
/// promup upgrade 3.8.1 --dry-run
///
/// # Run only the first stage of the plan, then stop
/// promup upgrade 3.8.1 --stage 1
///
/// # Snapshot through the admin API, fail if the backup looks broken
/// promup upgrade 3.8.1 --method api --verify
/// ```
#[derive(Parser, Debug)]
pub struct UpgradeCommand {
    /// Target version (`3.8.1` or `v3.8.1`).
    #[arg(value_name = "VERSION")]
    pub target: String,

    /// Reinstall even when the target is not newer than the installed version.
    #[arg(short, long)]
    pub force: bool,

    /// Run every read-only step and print what would happen.
    #[arg(long)]
    pub dry_run: bool,

    /// Run stages 1 through n of the plan, or `auto` for all of them.
    #[arg(long, value_name = "N|auto", default_value = "auto")]
    pub stage: StageSelection,

    /// Do not take backups. A failing stage can then not be rolled back.
    #[arg(long)]
    pub skip_backup: bool,

    /// Backup method: `api` (snapshot), `file` (offline copy) or `auto`.
    #[arg(long, value_name = "METHOD")]
    pub method: Option<BackupMethodPreference>,

    /// Prune backups older than this many days after a successful run.
    #[arg(long, value_name = "DAYS")]
    pub retention: Option<u32>,

    /// Abort a stage when its backup fails verification.
    #[arg(long)]
    pub verify: bool,

    /// Copy data without stopping the service (backup is marked inconsistent).
    #[arg(long)]
    pub no_stop: bool,
}

impl UpgradeCommand {
    pub(crate) async fn execute(self, context: &CommandContext) -> Result<()> {
        let config = context.load_config().await?;

        let mut options = UpgradeOptions::new(self.target, &config);
        options.force = self.force;
        options.dry_run = self.dry_run;
        options.stage = self.stage;
        options.skip_backup = self.skip_backup;
        options.retention_days = self.retention;
        options.strict_verify = self.verify;
        if let Some(method) = self.method {
            options.method = method;
        }
        if self.no_stop {
            options.stop_for_copy = false;
        }

        let orchestrator = context.orchestrator(config)?;
        match orchestrator.run(&options).await? {
            UpgradeOutcome::UpToDate(version) => {
                println!("{} {} is already installed", "✓".green(), version.to_string().bold());
            }
            UpgradeOutcome::DryRun(report) => render::dry_run(&report),
            UpgradeOutcome::Completed(report) => render::upgrade(&report),
        }
        Ok(())
    }
}
