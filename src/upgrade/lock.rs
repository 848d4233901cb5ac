//! Cross-process exclusion for mutating runs.
//!
//! One `promup.lock` file in the state directory, held with an OS file lock
//! for the lifetime of an [`UpgradeLock`]. The holder writes its PID into the
//! file so a contender can say who is running.

use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::debug;

use crate::constants::{LOCK_FILE_NAME, MAX_BACKOFF_DELAY_MS, STARTING_BACKOFF_DELAY_MS};
use crate::core::UpgradeError;

/// Exclusive upgrade lock; released on drop.
#[derive(Debug)]
pub struct UpgradeLock {
    file: Arc<File>,
    lock_path: PathBuf,
}

impl Drop for UpgradeLock {
    fn drop(&mut self) {
        debug!(path = %self.lock_path.display(), "Upgrade lock released");
        // The file itself stays: unlinking it would let a waiter lock the
        // orphaned inode while a newcomer locks a fresh file.
        if let Err(e) = self.file.set_len(0) {
            debug!(error = %e, "Failed to clear lock file");
        }
    }
}

impl UpgradeLock {
    /// Acquire the lock in `state_dir`, waiting up to `timeout`.
    ///
    /// Fails with [`UpgradeError::UpgradeInProgress`] when another process
    /// still holds it after the timeout.
    pub async fn acquire(state_dir: &Path, timeout: Duration) -> Result<Self> {
        tokio::fs::create_dir_all(state_dir).await.with_context(|| {
            format!("Failed to create state directory: {}", state_dir.display())
        })?;
        let lock_path = state_dir.join(LOCK_FILE_NAME);

        let open_path = lock_path.clone();
        let file = tokio::task::spawn_blocking(move || {
            OpenOptions::new().create(true).read(true).write(true).truncate(false).open(&open_path)
        })
        .await
        .context("spawn_blocking panicked")?
        .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;
        let file = Arc::new(file);

        let start = std::time::Instant::now();
        let backoff = ExponentialBackoff::from_millis(STARTING_BACKOFF_DELAY_MS)
            .max_delay(Duration::from_millis(MAX_BACKOFF_DELAY_MS));

        for delay in backoff {
            let candidate = Arc::clone(&file);
            let locked = tokio::task::spawn_blocking(move || candidate.try_lock_exclusive())
                .await
                .context("spawn_blocking panicked")?;

            if let Ok(true) = locked {
                write_pid(&file).context("Failed to record PID in lock file")?;
                debug!(
                    path = %lock_path.display(),
                    wait_ms = start.elapsed().as_millis(),
                    "Upgrade lock acquired"
                );
                return Ok(Self {
                    file,
                    lock_path,
                });
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(delay.min(remaining)).await;
        }

        Err(UpgradeError::UpgradeInProgress {
            pid: read_pid(&lock_path),
        }
        .into())
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

fn write_pid(file: &File) -> std::io::Result<()> {
    let mut handle = file;
    handle.set_len(0)?;
    handle.rewind()?;
    writeln!(handle, "{}", std::process::id())?;
    handle.flush()
}

/// PID recorded by the current holder, if readable.
pub fn read_pid(lock_path: &Path) -> Option<u32> {
    std::fs::read_to_string(lock_path).ok()?.trim().parse().ok()
}
