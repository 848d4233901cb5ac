use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tracing::debug;

use super::CommandContext;
use super::render;
use crate::constants::LOCK_FILE_NAME;
use crate::upgrade::RunJournal;
use crate::upgrade::lock::read_pid;

/// Arguments of `promup status`.
#[derive(Parser, Debug)]
pub struct StatusCommand {}

impl StatusCommand {
    pub(crate) async fn execute(self, context: &CommandContext) -> Result<()> {
        let config = context.load_config().await?;
        let state_dir = config.state_dir.clone();
        let orchestrator = context.orchestrator(config)?;
        let service = orchestrator.service();

        let version = match service.current_version().await? {
            Some(version) => version.to_string().bold(),
            None => "not installed".yellow(),
        };
        println!("Installed: {version} ({})", service.binary_path.display());

        let state = match orchestrator.controller().is_running().await {
            Ok(true) => "active".green(),
            Ok(false) => "inactive".yellow(),
            Err(e) => {
                debug!("Could not query service state: {e:#}");
                "unknown".dimmed()
            }
        };
        println!("Service:   {} is {state}", service.unit_name);

        if let Some(pid) = read_pid(&state_dir.join(LOCK_FILE_NAME)) {
            println!("Lock:      {} by pid {pid}", "recorded".yellow());
        }

        match RunJournal::load(&state_dir).await? {
            Some(journal) => render::journal(&journal),
            None => println!("Last run:  none recorded"),
        }

        let backups = orchestrator.backups().list().await?;
        println!("Backups:   {} in {}", backups.len(), orchestrator.backups().root().display());
        render::backups(&backups);
        Ok(())
    }
}
