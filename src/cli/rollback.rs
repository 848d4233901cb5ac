use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use super::CommandContext;
use crate::upgrade::RollbackRequest;
use crate::utils::human_bytes;

/// Arguments of `promup rollback`.
///
/// Restores binary, validator, configuration and unit from a backup and
/// restarts the service. The data directory is only replaced with
/// `--restore-data`; the live directory is moved aside first, never deleted.
#[derive(Parser, Debug)]
pub struct RollbackCommand {
    /// Backup id; defaults to the newest backup.
    #[arg(long = "backup", value_name = "ID")]
    pub backup_id: Option<String>,

    /// Also replace the data directory with the backup's copy.
    #[arg(long)]
    pub restore_data: bool,

    /// Allow restoring data from a copy taken while the service was running.
    #[arg(long, requires = "restore_data")]
    pub accept_inconsistent: bool,
}

impl RollbackCommand {
    pub(crate) async fn execute(self, context: &CommandContext) -> Result<()> {
        let config = context.load_config().await?;
        let orchestrator = context.orchestrator(config)?;

        let request = RollbackRequest {
            backup_id: self.backup_id,
            restore_data: self.restore_data,
            accept_inconsistent: self.accept_inconsistent,
        };
        let outcome = orchestrator.manual_rollback(&request).await?;

        println!("{} restored backup {}", "✓".green(), outcome.report.backup_id.bold());
        for path in &outcome.report.restored {
            println!("  {}", path.display());
        }
        match &outcome.data {
            Some(data) => {
                println!(
                    "  data: {} file(s), {}",
                    data.restored.files,
                    human_bytes(data.restored.bytes)
                );
                if let Some(aside) = &data.moved_aside {
                    println!("  previous data kept at {}", aside.display());
                }
            }
            None => {
                if let Some(data) = &outcome.report.data_backup {
                    println!(
                        "  data left untouched; a copy is at {} (use --restore-data)",
                        data.display()
                    );
                }
            }
        }
        Ok(())
    }
}
