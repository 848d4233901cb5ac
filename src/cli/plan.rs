use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use super::CommandContext;
use super::render;
use crate::upgrade::{UpgradeOptions, UpgradeOutcome};

/// Arguments of `promup plan`.
#[derive(Parser, Debug)]
pub struct PlanCommand {
    /// Target version.
    #[arg(value_name = "VERSION")]
    pub target: String,

    /// Plan a reinstall when the target is not newer.
    #[arg(short, long)]
    pub force: bool,
}

impl PlanCommand {
    pub(crate) async fn execute(self, context: &CommandContext) -> Result<()> {
        let config = context.load_config().await?;
        let orchestrator = context.orchestrator(config)?;
        let plan = orchestrator.resolve_plan(&self.target, self.force).await?;
        render::plan(&plan);
        Ok(())
    }
}

/// Arguments of `promup check`.
#[derive(Parser, Debug)]
pub struct CheckCommand {
    /// Target version.
    #[arg(value_name = "VERSION")]
    pub target: String,
}

impl CheckCommand {
    pub(crate) async fn execute(self, context: &CommandContext) -> Result<()> {
        let config = context.load_config().await?;
        let mut options = UpgradeOptions::new(self.target, &config);
        options.dry_run = true;
        options.skip_backup = true;

        let orchestrator = context.orchestrator(config)?;
        match orchestrator.run(&options).await? {
            UpgradeOutcome::DryRun(report) => {
                for preview in &report.stages {
                    println!("{}", preview.stage.name.bold());
                    render::issues(&preview.issues);
                }
            }
            UpgradeOutcome::UpToDate(version) => {
                println!("{} {} is already installed, nothing to check", "✓".green(), version);
            }
            UpgradeOutcome::Completed(_) => {}
        }
        Ok(())
    }
}
