//! Filesystem helpers shared by backup, install and rollback.
//!
//! Every write that replaces a file the service depends on goes through
//! [`atomic_write`] or [`atomic_copy`]: content lands in a sibling temp file,
//! is synced, and is renamed over the destination. Readers therefore see
//! either the old bytes or the new bytes, never a partial file.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File count and total size of a directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirStats {
    /// Regular files below the root.
    pub files: u64,
    /// Sum of their sizes in bytes.
    pub bytes: u64,
}

/// Create a directory and all parents.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Sibling temp path used for atomic replacement of `path`.
fn staging_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!(".{name}.promup-tmp"))
}

/// Write `content` to `path` atomically (temp file, fsync, rename).
///
/// Existing permissions of `path` are preserved on Unix.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let temp_path = staging_path(path);
    {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        file.write_all(content)
            .with_context(|| format!("Failed to write to temp file: {}", temp_path.display()))?;
        file.sync_all().with_context(|| "Failed to sync file to disk")?;
    }

    if let Ok(existing) = fs::metadata(path) {
        fs::set_permissions(&temp_path, existing.permissions()).with_context(|| {
            format!("Failed to carry permissions over to {}", temp_path.display())
        })?;
    }

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;
    Ok(())
}

/// Copy `src` over `dst` atomically, byte-for-byte, keeping `src`'s mode.
pub fn atomic_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }

    let temp_path = staging_path(dst);
    fs::copy(src, &temp_path).with_context(|| {
        format!("Failed to copy {} to {}", src.display(), temp_path.display())
    })?;
    fs::File::open(&temp_path)
        .and_then(|f| f.sync_all())
        .with_context(|| format!("Failed to sync {}", temp_path.display()))?;
    fs::rename(&temp_path, dst)
        .with_context(|| format!("Failed to rename temp file to: {}", dst.display()))?;
    Ok(())
}

/// Recursively copy `src` into `dst`, returning what was copied.
///
/// Only directories and regular files are copied; symlinks and special files
/// are skipped. Existing files in `dst` are overwritten.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<DirStats> {
    let mut stats = DirStats::default();
    ensure_dir(dst)?;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry =
            entry.with_context(|| format!("Failed to walk directory: {}", src.display()))?;
        let relative = entry.path().strip_prefix(src).with_context(|| {
            format!("{} is not below {}", entry.path().display(), src.display())
        })?;
        let target = dst.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            ensure_dir(&target)?;
        } else if file_type.is_file() {
            let bytes = fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy file from {} to {}", entry.path().display(), target.display())
            })?;
            stats.files += 1;
            stats.bytes += bytes;
        }
    }

    Ok(stats)
}

/// Count files and bytes below `path`. A missing directory counts as empty.
pub fn dir_stats(path: &Path) -> Result<DirStats> {
    let mut stats = DirStats::default();
    if !path.exists() {
        return Ok(stats);
    }

    for entry in WalkDir::new(path).min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", path.display()))?;
        if entry.file_type().is_file() {
            let metadata = entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
            stats.files += 1;
            stats.bytes += metadata.len();
        }
    }

    Ok(stats)
}

/// Async wrapper around [`copy_dir`] that runs on the blocking pool.
pub async fn copy_dir_blocking(src: PathBuf, dst: PathBuf) -> Result<DirStats> {
    tokio::task::spawn_blocking(move || copy_dir(&src, &dst))
        .await
        .context("copy task panicked")?
}

/// Async wrapper around [`dir_stats`] that runs on the blocking pool.
pub async fn dir_stats_blocking(path: PathBuf) -> Result<DirStats> {
    tokio::task::spawn_blocking(move || dir_stats(&path))
        .await
        .context("stat task panicked")?
}

/// Remove a directory tree; a missing directory is not an error.
pub fn remove_dir_all(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove directory: {}", path.display()))?;
    }
    Ok(())
}

/// Set the Unix mode of `path`.
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set mode {mode:o} on {}", path.display()))
}

/// Set the Unix mode of `path`.
#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Format a byte count for humans (`1.5 MiB`).
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
