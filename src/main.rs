//! promup CLI entry point
//!
//! Parses arguments, sets up logging on stderr, wires Ctrl-C to the
//! cancellation flag and turns errors into a readable message with exit
//! status 1.

use anyhow::Result;
use clap::Parser;
use promup_cli::cli::Cli;
use promup_cli::core::user_friendly_error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if cli.is_quiet() {
        promup_cli::utils::progress::disable();
    }

    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current step");
            flag.store(true, Ordering::SeqCst);
        }
    });

    match cli.execute(cancel).await {
        Ok(()) => Ok(()),
        Err(e) => {
            user_friendly_error(e).display();
            std::process::exit(1);
        }
    }
}
