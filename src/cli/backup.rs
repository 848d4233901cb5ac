use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use colored::Colorize;

use super::CommandContext;
use super::render;
use crate::backup::{BackupOptions, RetentionManager, verify_backup};
use crate::config::BackupMethodPreference;
use crate::utils::human_bytes;

/// Arguments of `promup backup`.
#[derive(Args, Debug)]
pub struct BackupCommand {
    #[command(subcommand)]
    command: BackupSubcommand,
}

#[derive(Subcommand, Debug)]
enum BackupSubcommand {
    /// Back up the current installation now.
    Create {
        /// Backup method: `api`, `file` or `auto`.
        #[arg(long, value_name = "METHOD")]
        method: Option<BackupMethodPreference>,

        /// Copy data without stopping the service (backup is marked inconsistent).
        #[arg(long)]
        no_stop: bool,
    },

    /// List backups, oldest first.
    List,

    /// Check that a backup holds everything a restore needs.
    Verify {
        /// Backup id as shown by `backup list`.
        id: String,
    },

    /// Delete backups older than the retention period.
    Prune {
        /// Retention in days; defaults to `backup.retention_days`.
        #[arg(long, value_name = "DAYS")]
        retention: Option<u32>,
    },
}

impl BackupCommand {
    pub(crate) async fn execute(self, context: &CommandContext) -> Result<()> {
        let config = context.load_config().await?;

        match self.command {
            BackupSubcommand::Create {
                method,
                no_stop,
            } => {
                let options = BackupOptions {
                    preference: method.unwrap_or(config.backup.method),
                    stop_for_copy: config.backup.stop_for_copy && !no_stop,
                };
                let orchestrator = context.orchestrator(config)?;
                let backup = orchestrator.create_backup(options).await?;
                println!(
                    "{} backup {} ({}, {} via {})",
                    "✓".green(),
                    backup.id.bold(),
                    human_bytes(backup.size_bytes),
                    backup.file_count,
                    backup.method
                );
                if !backup.consistent {
                    println!("  {} the data copy is not crash-consistent", "!".yellow());
                }
            }
            BackupSubcommand::List => {
                let orchestrator = context.orchestrator(config)?;
                render::backups(&orchestrator.backups().list().await?);
            }
            BackupSubcommand::Verify {
                id,
            } => {
                let orchestrator = context.orchestrator(config)?;
                let backup = orchestrator.backups().load(&id).await?;
                let verification = verify_backup(backup).await?;
                if !verification.is_valid() {
                    for problem in &verification.problems {
                        println!("  {} {problem}", "✗".red());
                    }
                    bail!("backup {id} failed verification");
                }
                println!(
                    "{} backup {} is complete ({} block(s), WAL {})",
                    "✓".green(),
                    id.bold(),
                    verification.blocks,
                    if verification.has_wal { "present" } else { "absent" }
                );
            }
            BackupSubcommand::Prune {
                retention,
            } => {
                let days = retention.unwrap_or(config.backup.retention_days);
                let root = config.backup.root.clone();
                let orchestrator = context.orchestrator(config)?;
                let _lock = orchestrator.lock().await?;
                let pruned = RetentionManager::new(root).prune(days).await?;
                if pruned.is_empty() {
                    println!("Nothing to prune");
                } else {
                    println!("Pruned {} backup(s): {}", pruned.len(), pruned.join(", "));
                }
            }
        }
        Ok(())
    }
}
