//! Release download, verification and binary replacement.
//!
//! The installer never touches the live binary until the new one has been
//! downloaded, checksum-verified, unpacked and has reported the expected
//! version. The swap itself is an atomic rename. All intermediate files live
//! in a temporary directory that is removed on every exit path.

pub mod archive;
pub mod fetch;
pub mod verification;

pub use fetch::{ArtifactFetcher, FileFetcher, HttpFetcher, fetcher_for};
pub use verification::ChecksumVerifier;

use anyhow::{Context, Result};
use semver::Version;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{ReleaseConfig, ServiceConfig};
use crate::constants::{CHECKSUM_MANIFEST_NAME, SERVER_BINARY_NAME, VALIDATOR_BINARY_NAME};
use crate::core::UpgradeError;
use crate::service::{InstalledService, query_version};
use crate::utils::atomic_copy;
use crate::utils::fs::set_mode;

/// URLs and names of one release archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseArtifact {
    /// `prometheus-<ver>.<os>-<arch>.tar.gz`
    pub archive_name: String,
    /// Archive URL.
    pub archive_url: String,
    /// Checksum manifest URL.
    pub checksum_url: String,
}

impl ReleaseArtifact {
    /// Artifact for `version` on the configured mirror and platform.
    pub fn for_version(release: &ReleaseConfig, version: &Version) -> Self {
        let base = release.base_url.trim_end_matches('/');
        let archive_name =
            format!("{SERVER_BINARY_NAME}-{version}.{}-{}.tar.gz", release.os, release.arch);
        Self {
            archive_url: format!("{base}/v{version}/{archive_name}"),
            checksum_url: format!("{base}/v{version}/{CHECKSUM_MANIFEST_NAME}"),
            archive_name,
        }
    }
}

/// What an install put in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledBinary {
    /// Version the new binary reported.
    pub version: Version,
    /// Installed server binary.
    pub binary: PathBuf,
    /// Installed validator, when the archive shipped one.
    pub validator: Option<PathBuf>,
    /// Archive size.
    pub archive_bytes: u64,
}

/// Downloads and installs server releases.
pub struct BinaryInstaller {
    release: ReleaseConfig,
    service: InstalledService,
    fetcher: Arc<dyn ArtifactFetcher>,
    owner_uid: Option<u32>,
    owner_gid: Option<u32>,
}

impl BinaryInstaller {
    /// Create an installer.
    pub fn new(
        release: ReleaseConfig,
        service_config: &ServiceConfig,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        Self {
            release,
            service: InstalledService::from_config(service_config),
            fetcher,
            owner_uid: service_config.owner_uid,
            owner_gid: service_config.owner_gid,
        }
    }

    /// Artifact locations for `version`.
    pub fn artifact(&self, version: &Version) -> ReleaseArtifact {
        ReleaseArtifact::for_version(&self.release, version)
    }

    /// Download, verify and install `version`.
    pub async fn install(&self, version: &Version) -> Result<InstalledBinary> {
        let artifact = self.artifact(version);
        let workdir = tempfile::Builder::new()
            .prefix("promup-")
            .tempdir()
            .context("Failed to create download directory")?;
        debug!(dir = %workdir.path().display(), "Download directory");

        let manifest_path = workdir.path().join(CHECKSUM_MANIFEST_NAME);
        self.fetcher.fetch(&artifact.checksum_url, &manifest_path).await?;
        let manifest = tokio::fs::read_to_string(&manifest_path)
            .await
            .context("Failed to read checksum manifest")?;

        info!(archive = %artifact.archive_name, "Downloading release");
        let archive_path = workdir.path().join(&artifact.archive_name);
        let archive_bytes = self.fetcher.fetch(&artifact.archive_url, &archive_path).await?;

        ChecksumVerifier::verify_against_manifest(&archive_path, &manifest, &artifact.archive_name)
            .await?;

        let extract_dir = workdir.path().join("extract");
        tokio::fs::create_dir_all(&extract_dir).await?;
        archive::extract_tar_gz(&archive_path, &extract_dir).await.map_err(|e| {
            UpgradeError::Download {
                url: artifact.archive_url.clone(),
                reason: format!("{e:#}"),
            }
        })?;

        let server = archive::locate_executable(&extract_dir, SERVER_BINARY_NAME).ok_or_else(|| {
            UpgradeError::Download {
                url: artifact.archive_url.clone(),
                reason: format!("archive contains no {SERVER_BINARY_NAME} executable"),
            }
        })?;

        let reported = query_version(&server).await.context("New binary failed its self-check")?;
        if reported != *version {
            return Err(UpgradeError::Download {
                url: artifact.archive_url,
                reason: format!("archive binary reports version {reported}, expected {version}"),
            }
            .into());
        }

        self.place(&server, &self.service.binary_path)?;
        let validator = match archive::locate_executable(&extract_dir, VALIDATOR_BINARY_NAME) {
            Some(source) => {
                let target = self.service.validator_path();
                self.place(&source, &target)?;
                Some(target)
            }
            None => None,
        };

        info!(version = %version, binary = %self.service.binary_path.display(), "Installed release");
        Ok(InstalledBinary {
            version: reported,
            binary: self.service.binary_path.clone(),
            validator,
            archive_bytes,
        })
    }

    fn place(&self, source: &Path, target: &Path) -> Result<()> {
        atomic_copy(source, target)?;
        set_mode(target, 0o755)?;
        self.apply_owner(target)
    }

    #[cfg(unix)]
    fn apply_owner(&self, target: &Path) -> Result<()> {
        if self.owner_uid.is_none() && self.owner_gid.is_none() {
            return Ok(());
        }
        std::os::unix::fs::chown(target, self.owner_uid, self.owner_gid)
            .with_context(|| format!("Failed to set owner of {}", target.display()))
    }

    #[cfg(not(unix))]
    fn apply_owner(&self, _target: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_artifact_urls() {
        let release = ReleaseConfig {
            base_url: "https://github.com/prometheus/prometheus/releases/download/".to_string(),
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            ..ReleaseConfig::default()
        };
        let artifact = ReleaseArtifact::for_version(&release, &Version::new(3, 8, 1));

        assert_eq!(artifact.archive_name, "prometheus-3.8.1.linux-amd64.tar.gz");
        assert_eq!(
            artifact.archive_url,
            "https://github.com/prometheus/prometheus/releases/download/v3.8.1/prometheus-3.8.1.linux-amd64.tar.gz"
        );
        assert_eq!(
            artifact.checksum_url,
            "https://github.com/prometheus/prometheus/releases/download/v3.8.1/sha256sums.txt"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_from_mirror() {
        let install = crate::test_utils::TestInstallation::new("2.55.1").unwrap();
        install.publish_release("3.8.1").unwrap();
        let config = install.config();
        let installer =
            BinaryInstaller::new(config.release.clone(), &config.service, Arc::new(FileFetcher));

        let installed = installer.install(&Version::new(3, 8, 1)).await.unwrap();
        assert_eq!(installed.version, Version::new(3, 8, 1));
        assert!(installed.validator.is_some());
        assert_eq!(query_version(&installed.binary).await.unwrap(), Version::new(3, 8, 1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_checksum_mismatch_leaves_binary_untouched() {
        let install = crate::test_utils::TestInstallation::new("2.55.1").unwrap();
        install.publish_release("3.8.1").unwrap();
        install.corrupt_checksum("3.8.1").unwrap();
        let before = std::fs::read(install.service().binary_path).unwrap();

        let config = install.config();
        let installer =
            BinaryInstaller::new(config.release.clone(), &config.service, Arc::new(FileFetcher));
        let err = installer.install(&Version::new(3, 8, 1)).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<UpgradeError>(),
            Some(UpgradeError::ChecksumMismatch { .. })
        ));
        assert_eq!(std::fs::read(install.service().binary_path).unwrap(), before);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_release_is_download_error() {
        let install = crate::test_utils::TestInstallation::new("2.55.1").unwrap();
        let config = install.config();
        let installer =
            BinaryInstaller::new(config.release.clone(), &config.service, Arc::new(FileFetcher));

        let err = installer.install(&Version::new(9, 9, 9)).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<UpgradeError>(), Some(UpgradeError::Download { .. })));
    }
}
