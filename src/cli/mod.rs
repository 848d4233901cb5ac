//! Command-line interface for promup.
//!
//! Every subcommand loads the operator configuration, builds an
//! [`UpgradeOrchestrator`] over the real systemd and HTTP collaborators and
//! renders its result. Reports go to stdout; logs go to stderr.
//!
//! # Commands
//!
//! - `upgrade <target>` - run the staged upgrade (or preview it with `--dry-run`)
//! - `plan <target>` - print the resolved stage list
//! - `check <target>` - print configuration issues for every stage
//! - `status` - installed version, service state, last run and backups
//! - `backup create|list|verify|prune` - manage backups outside an upgrade
//! - `rollback` - restore the latest (or a given) backup
//!
//! # Examples
//!
//! ```bash
//! promup plan 3.8.1
//! promup upgrade 3.8.1 --dry-run
//! promup upgrade 3.8.1 --stage 1 --method api
//! promup backup list
//! promup rollback --backup 20250101T120000Z --restore-data
//! ```

mod backup;
mod plan;
mod render;
mod rollback;
mod status;
mod upgrade;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::config::UpgradeConfig;
use crate::upgrade::{Collaborators, UpgradeOrchestrator};

/// Top-level arguments.
#[derive(Parser, Debug)]
#[command(
    name = "promup",
    about = "Staged, resumable upgrades for a systemd-managed Prometheus server",
    version,
    long_about = "promup upgrades a Prometheus installation through every mandatory intermediate \
                  release, backing up binaries, configuration and TSDB data before each stage and \
                  rolling back automatically when a stage fails."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the promup configuration file.
    ///
    /// Defaults to `$PROMUP_CONFIG`, then `/etc/promup/promup.toml`; built-in
    /// defaults apply when neither exists.
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug-level logging.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Warnings and errors only; hides progress bars.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upgrade the server to a target version.
    Upgrade(upgrade::UpgradeCommand),

    /// Show the stages an upgrade would run.
    Plan(plan::PlanCommand),

    /// Report configuration incompatibilities for every stage.
    Check(plan::CheckCommand),

    /// Show installed version, service state, last run and backups.
    Status(status::StatusCommand),

    /// Manage backups.
    Backup(backup::BackupCommand),

    /// Restore a backup.
    Rollback(rollback::RollbackCommand),
}

impl Cli {
    /// Default log filter for the chosen verbosity; `RUST_LOG` overrides it.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "promup_cli=debug,info"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    /// Whether `--quiet` was given.
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Run the selected command. `cancel` is set by the Ctrl-C handler.
    pub async fn execute(self, cancel: Arc<AtomicBool>) -> Result<()> {
        let context = CommandContext {
            config_path: self.config,
            cancel,
        };

        match self.command {
            Commands::Upgrade(cmd) => cmd.execute(&context).await,
            Commands::Plan(cmd) => cmd.execute(&context).await,
            Commands::Check(cmd) => cmd.execute(&context).await,
            Commands::Status(cmd) => cmd.execute(&context).await,
            Commands::Backup(cmd) => cmd.execute(&context).await,
            Commands::Rollback(cmd) => cmd.execute(&context).await,
        }
    }
}

/// State shared by every subcommand.
pub(crate) struct CommandContext {
    config_path: Option<PathBuf>,
    cancel: Arc<AtomicBool>,
}

impl CommandContext {
    pub(crate) async fn load_config(&self) -> Result<UpgradeConfig> {
        UpgradeConfig::load_with_optional(self.config_path.clone()).await
    }

    /// Orchestrator over the real collaborators for `config`.
    pub(crate) fn orchestrator(&self, config: UpgradeConfig) -> Result<UpgradeOrchestrator> {
        let collaborators = Collaborators::system(&config)?;
        Ok(UpgradeOrchestrator::new(config, collaborators)?.with_cancellation(self.cancel.clone()))
    }
}
