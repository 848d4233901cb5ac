use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::UpgradeError;

/// SHA-256 verification of release archives against a `sha256sums.txt`
/// manifest.
///
/// Manifest entries are matched on the exact archive file name. A missing
/// entry is a failure: an archive that cannot be verified is not installed.
pub struct ChecksumVerifier;

impl ChecksumVerifier {
    /// Hex-encoded SHA-256 of a file, streamed on the blocking pool.
    pub async fn compute_sha256(file_path: &Path) -> Result<String> {
        debug!("Computing SHA256 checksum for: {}", file_path.display());
        let path: PathBuf = file_path.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<String> {
            let mut file = std::fs::File::open(&path)
                .with_context(|| format!("Failed to read file: {}", path.display()))?;
            let mut hasher = Sha256::new();
            std::io::copy(&mut file, &mut hasher)
                .with_context(|| format!("Failed to hash {}", path.display()))?;
            Ok(hex::encode(hasher.finalize()))
        })
        .await
        .context("hash task panicked")?
    }

    /// Find the digest for `archive_name` in manifest `content`.
    ///
    /// Lines look like `<hex>  <name>` (or `<hex> *<name>` for binary mode).
    pub fn parse_manifest(content: &str, archive_name: &str) -> Option<String> {
        content.lines().find_map(|line| {
            let mut parts = line.split_whitespace();
            let digest = parts.next()?;
            let name = parts.next()?;
            if parts.next().is_some() {
                return None;
            }
            (name.trim_start_matches('*') == archive_name).then(|| digest.to_lowercase())
        })
    }

    /// Check `file_path` against the manifest entry for `archive_name`.
    pub async fn verify_against_manifest(
        file_path: &Path,
        manifest: &str,
        archive_name: &str,
    ) -> Result<()> {
        let expected = Self::parse_manifest(manifest, archive_name).ok_or_else(|| {
            UpgradeError::ChecksumMismatch {
                artifact: archive_name.to_string(),
                expected: "(no manifest entry)".to_string(),
                actual: "(not computed)".to_string(),
            }
        })?;
        Self::verify_checksum(file_path, archive_name, &expected).await
    }

    /// Check `file_path` against an expected hex digest.
    pub async fn verify_checksum(file_path: &Path, archive_name: &str, expected: &str) -> Result<()> {
        info!("Verifying checksum for: {archive_name}");
        let actual = Self::compute_sha256(file_path).await?;

        if !actual.eq_ignore_ascii_case(expected) {
            return Err(UpgradeError::ChecksumMismatch {
                artifact: archive_name.to_string(),
                expected: expected.to_lowercase(),
                actual,
            }
            .into());
        }

        info!("Checksum verification successful");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HELLO_SHA256: &str = "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";

    #[tokio::test]
    async fn test_compute_sha256() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"Hello, World!").unwrap();

        let checksum = ChecksumVerifier::compute_sha256(temp_file.path()).await.unwrap();
        assert_eq!(checksum, HELLO_SHA256);
    }

    #[test]
    fn test_parse_manifest_exact_match() {
        let manifest = format!(
            "{}  prometheus-3.8.1.linux-amd64.tar.gz.sig\n{HELLO_SHA256}  prometheus-3.8.1.linux-amd64.tar.gz\naaaa *prometheus-3.8.1.linux-arm64.tar.gz\n",
            "f".repeat(64)
        );

        assert_eq!(
            ChecksumVerifier::parse_manifest(&manifest, "prometheus-3.8.1.linux-amd64.tar.gz"),
            Some(HELLO_SHA256.to_string())
        );
        assert_eq!(
            ChecksumVerifier::parse_manifest(&manifest, "prometheus-3.8.1.linux-arm64.tar.gz"),
            Some("aaaa".to_string())
        );
        assert_eq!(ChecksumVerifier::parse_manifest(&manifest, "prometheus-3.8.1.linux"), None);
    }

    #[tokio::test]
    async fn test_verify_mismatch_and_missing_entry() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"tampered").unwrap();

        let manifest = format!("{HELLO_SHA256}  archive.tar.gz\n");
        let err = ChecksumVerifier::verify_against_manifest(temp_file.path(), &manifest, "archive.tar.gz")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpgradeError>(),
            Some(UpgradeError::ChecksumMismatch { .. })
        ));

        let err = ChecksumVerifier::verify_against_manifest(temp_file.path(), &manifest, "other.tar.gz")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpgradeError>(),
            Some(UpgradeError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_case_insensitive() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"Hello, World!").unwrap();

        ChecksumVerifier::verify_checksum(temp_file.path(), "a", &HELLO_SHA256.to_uppercase())
            .await
            .unwrap();
    }
}
