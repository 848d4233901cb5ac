//! Process-supervisor abstraction.
//!
//! The upgrade flow never shells out to `systemctl` directly; it talks to a
//! [`Supervisor`] so tests can substitute an in-memory fake and other init
//! systems can be added without touching the orchestrator.

use anyhow::{Context, Result, bail};
use futures::future::BoxFuture;
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

/// Operations promup needs from the process supervisor.
///
/// Methods return boxed futures so the trait stays object-safe and can be
/// shared as `Arc<dyn Supervisor>`.
pub trait Supervisor: Send + Sync {
    /// Whether the unit is currently active.
    fn is_active<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Main PID of the unit, if it has one.
    fn main_pid<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<Option<u32>>>;

    /// Whether a process with `pid` still exists.
    fn process_alive(&self, pid: u32) -> bool;

    /// Ask the supervisor to start the unit. Returns once the request was
    /// accepted, not once the unit is active.
    fn start<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Ask the supervisor to stop the unit. Returns once the request was
    /// accepted, not once the process is gone.
    fn stop<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Send `signal` (e.g. `SIGKILL`) to every process of the unit.
    fn kill<'a>(&'a self, unit: &'a str, signal: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Reload unit definitions after a unit file changed.
    fn daemon_reload(&self) -> BoxFuture<'_, Result<()>>;

    /// Last `lines` lines of the unit's log.
    fn recent_logs<'a>(&'a self, unit: &'a str, lines: usize) -> BoxFuture<'a, Result<Vec<String>>>;
}

/// systemd via `systemctl` and `journalctl`.
#[derive(Debug, Default, Clone)]
pub struct SystemdSupervisor;

impl SystemdSupervisor {
    /// Create a supervisor client.
    pub fn new() -> Self {
        Self
    }

    async fn systemctl(args: &[&str]) -> Result<Output> {
        debug!(?args, "systemctl");
        Command::new("systemctl")
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run systemctl {}", args.join(" ")))
    }

    async fn systemctl_checked(args: &[&str]) -> Result<()> {
        let output = Self::systemctl(args).await?;
        if !output.status.success() {
            bail!(
                "systemctl {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl Supervisor for SystemdSupervisor {
    fn is_active<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let output = Self::systemctl(&["is-active", "--quiet", unit]).await?;
            Ok(output.status.success())
        })
    }

    fn main_pid<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<Option<u32>>> {
        Box::pin(async move {
            let output = Self::systemctl(&["show", "--property=MainPID", "--value", unit]).await?;
            let text = String::from_utf8_lossy(&output.stdout);
            let pid: u32 = text
                .trim()
                .parse()
                .with_context(|| format!("Unexpected MainPID value '{}'", text.trim()))?;
            Ok((pid != 0).then_some(pid))
        })
    }

    fn process_alive(&self, pid: u32) -> bool {
        std::path::Path::new("/proc").join(pid.to_string()).exists()
    }

    fn start<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { Self::systemctl_checked(&["start", "--no-block", unit]).await })
    }

    fn stop<'a>(&'a self, unit: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { Self::systemctl_checked(&["stop", "--no-block", unit]).await })
    }

    fn kill<'a>(&'a self, unit: &'a str, signal: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let signal_arg = format!("--signal={signal}");
            Self::systemctl_checked(&["kill", &signal_arg, unit]).await
        })
    }

    fn daemon_reload(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { Self::systemctl_checked(&["daemon-reload"]).await })
    }

    fn recent_logs<'a>(&'a self, unit: &'a str, lines: usize) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let output = Command::new("journalctl")
                .args(["--unit", unit, "--lines", &lines.to_string(), "--no-pager", "--output=cat"])
                .output()
                .await
                .context("Failed to run journalctl")?;
            Ok(String::from_utf8_lossy(&output.stdout).lines().map(str::to_string).collect())
        })
    }
}
