use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Unpack a `.tar.gz` into `dest` on the blocking pool.
///
/// `tar` refuses entries that would escape `dest`.
pub async fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = File::open(&archive)
            .with_context(|| format!("Failed to open {}", archive.display()))?;
        let mut tar = tar::Archive::new(GzDecoder::new(file));
        tar.set_preserve_permissions(true);
        tar.unpack(&dest)
            .with_context(|| format!("Failed to unpack {}", archive.display()))
    })
    .await
    .context("extract task panicked")?
}

/// Shallowest regular file named `name` below `root`.
pub fn locate_executable(root: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == name)
        .min_by_key(|entry| entry.depth())
        .map(|entry| entry.into_path())
}
