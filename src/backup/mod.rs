//! Pre-stage backups of the server installation.
//!
//! Each backup is a directory `<root>/<id>/` holding copies of the binary,
//! validator, configuration and unit, the TSDB data (`data/`), and a
//! `backup.json` metadata file. The id is a UTC timestamp, so directory
//! listings sort chronologically.
//!
//! # Data capture
//!
//! - **Snapshot**: while the server runs, the admin API writes a consistent
//!   snapshot under `<data>/snapshots/<name>`, which is moved into the backup.
//! - **File copy**: otherwise the data directory is copied. The service is
//!   stopped for the copy (and restarted afterwards) unless the operator
//!   disabled that, in which case the backup is recorded as inconsistent.
//!
//! A backup that ends up with zero files, or whose metadata cannot be
//! written, is a failure: the partial directory is removed and
//! [`UpgradeError::BackupFailed`] is returned.

pub mod retention;
pub mod snapshot;

pub use retention::RetentionManager;
pub use snapshot::{HttpSnapshotApi, SnapshotApi, SnapshotOutcome};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::BackupMethodPreference;
use crate::constants::BACKUP_METADATA_FILE;
use crate::core::UpgradeError;
use crate::service::{InstalledService, ServiceController};
use crate::utils::fs::{copy_dir, copy_dir_blocking, dir_stats_blocking, remove_dir_all};
use crate::utils::{DirStats, atomic_write, ensure_dir, human_bytes, progress};

/// Data directory entries never copied: older snapshots and the TSDB lock.
const DATA_EXCLUDES: [&str; 2] = ["snapshots", "lock"];

/// Backups started within the same second get `-1`, `-2`, ... suffixes.
const MAX_ID_SUFFIX: u32 = 1000;

/// How the data directory was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMethod {
    /// Admin API snapshot.
    Snapshot,
    /// Plain file copy.
    File,
}

impl std::fmt::Display for BackupMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Snapshot => "snapshot",
            Self::File => "file",
        })
    }
}

/// Backup-relative paths of the captured artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifacts {
    /// Server binary.
    pub binary: Option<String>,
    /// Config validator.
    pub validator: Option<String>,
    /// Server configuration.
    pub config: Option<String>,
    /// Supervisor unit.
    pub unit: Option<String>,
    /// TSDB data directory.
    pub data: Option<String>,
}

/// Where each artifact lived when the backup was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreTargets {
    /// Server binary.
    pub binary: PathBuf,
    /// Config validator.
    pub validator: PathBuf,
    /// Server configuration.
    pub config: PathBuf,
    /// Supervisor unit.
    pub unit: PathBuf,
    /// TSDB data directory.
    pub data: PathBuf,
}

/// One backup, as recorded in `backup.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    /// Directory name below the backup root.
    pub id: String,
    /// Stage the backup was taken for.
    pub stage: String,
    /// Installed version at backup time.
    pub source_version: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// How data was captured.
    pub method: BackupMethod,
    /// Whether the data copy is crash-consistent.
    pub consistent: bool,
    /// Files in the backup, metadata excluded.
    pub file_count: u64,
    /// Bytes in the backup, metadata excluded.
    pub size_bytes: u64,
    /// Captured artifacts.
    pub artifacts: BackupArtifacts,
    /// Original locations.
    pub targets: RestoreTargets,
    /// Backup directory; not serialised.
    #[serde(skip)]
    pub dir: PathBuf,
}

impl Backup {
    /// Absolute path of a captured artifact.
    pub fn artifact_path(&self, relative: Option<&String>) -> Option<PathBuf> {
        relative.map(|r| self.dir.join(r))
    }

    /// Captured data directory, if any.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.artifact_path(self.artifacts.data.as_ref())
    }
}

/// Options for [`BackupManager::create`].
#[derive(Debug, Clone, Copy)]
pub struct BackupOptions {
    /// Method preference.
    pub preference: BackupMethodPreference,
    /// Stop the service for file copies.
    pub stop_for_copy: bool,
}

/// What a backup would do, computed without side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEstimate {
    /// Method that would be attempted first.
    pub method: BackupMethod,
    /// Whether a snapshot failure would fall back to a file copy.
    pub may_fall_back: bool,
    /// Whether the service would be stopped.
    pub stops_service: bool,
    /// Whether the data copy would be consistent.
    pub consistent: bool,
    /// Current size of the data directory.
    pub data: DirStats,
}

/// Result of a structural check of a backup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupVerification {
    /// TSDB blocks found.
    pub blocks: usize,
    /// Whether a WAL directory is present.
    pub has_wal: bool,
    /// Everything that is wrong.
    pub problems: Vec<String>,
}

impl BackupVerification {
    /// `true` when no problem was found.
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Creates and inspects backups under one root directory.
pub struct BackupManager {
    root: PathBuf,
    service: InstalledService,
    controller: Arc<ServiceController>,
    snapshots: Arc<dyn SnapshotApi>,
}

impl BackupManager {
    /// Create a manager.
    pub fn new(
        root: PathBuf,
        service: InstalledService,
        controller: Arc<ServiceController>,
        snapshots: Arc<dyn SnapshotApi>,
    ) -> Self {
        Self {
            root,
            service,
            controller,
            snapshots,
        }
    }

    /// Backup root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Take a backup for `stage`.
    pub async fn create(
        &self,
        stage: &str,
        source_version: Option<&Version>,
        options: BackupOptions,
    ) -> Result<Backup> {
        ensure_dir(&self.root).map_err(|e| UpgradeError::BackupFailed {
            reason: format!("{e:#}"),
        })?;
        let (id, dir) = self.allocate_dir().await?;
        info!(backup = %id, stage, "Creating backup");

        match self.populate(&id, &dir, stage, source_version, options).await {
            Ok(backup) => {
                info!(
                    backup = %backup.id,
                    method = %backup.method,
                    consistent = backup.consistent,
                    files = backup.file_count,
                    size = %human_bytes(backup.size_bytes),
                    "Backup created"
                );
                Ok(backup)
            }
            Err(e) => {
                if let Err(cleanup) = remove_dir_all(&dir) {
                    warn!("Failed to remove partial backup {}: {cleanup:#}", dir.display());
                }
                if matches!(e.downcast_ref::<UpgradeError>(), Some(UpgradeError::BackupFailed { .. })) {
                    Err(e)
                } else {
                    Err(UpgradeError::BackupFailed {
                        reason: format!("{e:#}"),
                    }
                    .into())
                }
            }
        }
    }

    async fn allocate_dir(&self) -> Result<(String, PathBuf)> {
        let base = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        for suffix in 0..MAX_ID_SUFFIX {
            let id = if suffix == 0 {
                base.clone()
            } else {
                format!("{base}-{suffix}")
            };
            let dir = self.root.join(&id);
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create backup directory {}", dir.display()));
                }
            }
        }
        bail!("No free backup id for {base} in {}", self.root.display())
    }

    async fn populate(
        &self,
        id: &str,
        dir: &Path,
        stage: &str,
        source_version: Option<&Version>,
        options: BackupOptions,
    ) -> Result<Backup> {
        let validator = self.service.validator_path();
        let mut artifacts = BackupArtifacts {
            binary: copy_artifact(&self.service.binary_path, dir, "binary").await?,
            validator: copy_artifact(&validator, dir, "binary").await?,
            config: copy_artifact(&self.service.config_path, dir, "config").await?,
            unit: copy_artifact(&self.service.unit_path, dir, "unit").await?,
            data: None,
        };

        let data_dest = dir.join("data");
        let (method, consistent) = self.capture_data(&data_dest, options).await?;
        if data_dest.is_dir() {
            artifacts.data = Some("data".to_string());
        }

        let stats = dir_stats_blocking(dir.to_path_buf()).await?;
        if stats.files == 0 {
            bail!(UpgradeError::BackupFailed {
                reason: "backup contains no files".to_string(),
            });
        }

        let backup = Backup {
            id: id.to_string(),
            stage: stage.to_string(),
            source_version: source_version.map(ToString::to_string),
            created_at: Utc::now(),
            method,
            consistent,
            file_count: stats.files,
            size_bytes: stats.bytes,
            artifacts,
            targets: RestoreTargets {
                binary: self.service.binary_path.clone(),
                validator,
                config: self.service.config_path.clone(),
                unit: self.service.unit_path.clone(),
                data: self.service.data_path.clone(),
            },
            dir: dir.to_path_buf(),
        };

        let metadata = serde_json::to_vec_pretty(&backup).context("Failed to serialise backup metadata")?;
        atomic_write(&dir.join(BACKUP_METADATA_FILE), &metadata).map_err(|e| {
            UpgradeError::BackupFailed {
                reason: format!("cannot write metadata: {e:#}"),
            }
        })?;

        Ok(backup)
    }

    async fn capture_data(&self, dest: &Path, options: BackupOptions) -> Result<(BackupMethod, bool)> {
        if !self.service.data_path.is_dir() {
            warn!(path = %self.service.data_path.display(), "No data directory to back up");
            return Ok((BackupMethod::File, true));
        }

        let running = self.service_state().await?;
        match options.preference {
            BackupMethodPreference::Api => {
                if !running {
                    bail!(UpgradeError::BackupFailed {
                        reason: "the snapshot method requires a running service".to_string(),
                    });
                }
                match self.snapshot_into(dest).await? {
                    SnapshotOutcome::Created(_) => Ok((BackupMethod::Snapshot, true)),
                    SnapshotOutcome::Unsupported(reason) => bail!(UpgradeError::BackupFailed {
                        reason: format!("snapshot API unavailable: {reason}"),
                    }),
                }
            }
            BackupMethodPreference::Auto if running => match self.snapshot_into(dest).await {
                Ok(SnapshotOutcome::Created(_)) => Ok((BackupMethod::Snapshot, true)),
                Ok(SnapshotOutcome::Unsupported(reason)) => {
                    info!("Snapshot API unavailable ({reason}), falling back to file copy");
                    self.copy_data(dest, options).await
                }
                Err(e) => {
                    warn!("Snapshot failed, falling back to file copy: {e:#}");
                    self.copy_data(dest, options).await
                }
            },
            BackupMethodPreference::Auto | BackupMethodPreference::File => {
                self.copy_data(dest, options).await
            }
        }
    }

    async fn snapshot_into(&self, dest: &Path) -> Result<SnapshotOutcome> {
        let snapshots_dir = self.service.data_path.join("snapshots");
        let existing = list_names(&snapshots_dir).await;
        let outcome = match self.snapshots.create().await {
            Ok(outcome) => outcome,
            Err(e) => {
                // The server may still finish a snapshot the request gave up on.
                remove_new_snapshots(&snapshots_dir, &existing).await;
                return Err(e);
            }
        };
        if let SnapshotOutcome::Created(name) = &outcome {
            let source = snapshots_dir.join(name);
            debug!(snapshot = %source.display(), "Moving snapshot into backup");
            move_dir(&source, dest).await?;
        }
        Ok(outcome)
    }

    async fn copy_data(&self, dest: &Path, options: BackupOptions) -> Result<(BackupMethod, bool)> {
        let running = self.service_state().await?;
        let stopped = running && options.stop_for_copy;
        if stopped {
            self.controller.stop().await?;
        } else if running {
            warn!("Copying live data without stopping the service; the backup is marked inconsistent");
        }

        let spinner = progress::spinner("Copying data directory");
        let copied = copy_data_dir(self.service.data_path.clone(), dest.to_path_buf()).await;
        spinner.finish_and_clear();

        if stopped {
            if let Err(e) = self.controller.start().await {
                if copied.is_ok() {
                    return Err(e.context("Failed to restart service after data copy"));
                }
                warn!("Failed to restart service after failed data copy: {e:#}");
            }
        }

        let stats = copied?;
        debug!(files = stats.files, bytes = stats.bytes, "Data copied");
        Ok((BackupMethod::File, !running || stopped))
    }

    /// Whether the service runs. An unknown state fails the backup, since
    /// consistency cannot be claimed for it.
    async fn service_state(&self) -> Result<bool> {
        self.controller.is_running().await.map_err(|e| {
            UpgradeError::BackupFailed {
                reason: format!("cannot determine whether the service is running: {e:#}"),
            }
            .into()
        })
    }

    async fn is_running(&self) -> bool {
        self.controller.is_running().await.unwrap_or_else(|e| {
            warn!("Could not query service state, assuming stopped: {e:#}");
            false
        })
    }

    /// Describe what [`create`](Self::create) would do. No side effects.
    pub async fn estimate(&self, options: BackupOptions) -> Result<BackupEstimate> {
        let running = self.is_running().await;
        let data = dir_stats_blocking(self.service.data_path.clone()).await?;

        let (method, may_fall_back) = match options.preference {
            BackupMethodPreference::Api => (BackupMethod::Snapshot, false),
            BackupMethodPreference::Auto if running => (BackupMethod::Snapshot, true),
            BackupMethodPreference::Auto | BackupMethodPreference::File => (BackupMethod::File, false),
        };
        let copies = method == BackupMethod::File || may_fall_back;
        let stops_service = copies && running && options.stop_for_copy;
        let consistent = method == BackupMethod::Snapshot || !running || options.stop_for_copy;

        Ok(BackupEstimate {
            method,
            may_fall_back,
            stops_service,
            consistent,
            data,
        })
    }

    /// Structural check; logs every problem and returns whether the backup
    /// is usable.
    pub async fn verify(&self, backup: &Backup) -> Result<bool> {
        let verification = verify_backup(backup.clone()).await?;
        for problem in &verification.problems {
            warn!(backup = %backup.id, "{problem}");
        }
        Ok(verification.is_valid())
    }

    /// All readable backups, oldest first.
    pub async fn list(&self) -> Result<Vec<Backup>> {
        list_backups(&self.root).await
    }

    /// Backup with the given id.
    pub async fn load(&self, id: &str) -> Result<Backup> {
        load_backup(&self.root.join(id)).await
    }

    /// Most recent backup, if any.
    pub async fn latest(&self) -> Result<Option<Backup>> {
        Ok(self.list().await?.pop())
    }
}

async fn copy_artifact(source: &Path, dir: &Path, category: &str) -> Result<Option<String>> {
    if !source.is_file() {
        debug!(path = %source.display(), "Artifact absent, not backed up");
        return Ok(None);
    }
    let name = source
        .file_name()
        .with_context(|| format!("{} has no file name", source.display()))?
        .to_string_lossy()
        .into_owned();
    let target_dir = dir.join(category);
    ensure_dir(&target_dir)?;
    tokio::fs::copy(source, target_dir.join(&name))
        .await
        .with_context(|| format!("Failed to back up {}", source.display()))?;
    Ok(Some(format!("{category}/{name}")))
}

/// Move a directory, copying across filesystems when rename is not possible.
async fn list_names(dir: &Path) -> Vec<std::ffi::OsString> {
    let mut names = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name());
        }
    }
    names
}

async fn remove_new_snapshots(dir: &Path, existing: &[std::ffi::OsString]) {
    for name in list_names(dir).await {
        if existing.contains(&name) {
            continue;
        }
        let path = dir.join(&name);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => info!(snapshot = %path.display(), "Removed snapshot left by failed request"),
            Err(e) => warn!("Failed to remove stray snapshot {}: {e}", path.display()),
        }
    }
}

async fn move_dir(source: &Path, dest: &Path) -> Result<()> {
    if tokio::fs::rename(source, dest).await.is_ok() {
        return Ok(());
    }
    copy_dir_blocking(source.to_path_buf(), dest.to_path_buf()).await?;
    tokio::fs::remove_dir_all(source)
        .await
        .with_context(|| format!("Failed to remove {}", source.display()))
}

async fn copy_data_dir(source: PathBuf, dest: PathBuf) -> Result<DirStats> {
    tokio::task::spawn_blocking(move || -> Result<DirStats> {
        let mut total = DirStats::default();
        ensure_dir(&dest)?;
        let entries = std::fs::read_dir(&source)
            .with_context(|| format!("Failed to read {}", source.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to read {}", source.display()))?;
            let name = entry.file_name();
            if DATA_EXCLUDES.iter().any(|excluded| name == *excluded) {
                continue;
            }
            let file_type = entry.file_type()?;
            let target = dest.join(&name);
            if file_type.is_dir() {
                let stats = copy_dir(&entry.path(), &target)?;
                total.files += stats.files;
                total.bytes += stats.bytes;
            } else if file_type.is_file() {
                total.bytes += std::fs::copy(entry.path(), &target)
                    .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
                total.files += 1;
            }
        }
        Ok(total)
    })
    .await
    .context("data copy task panicked")?
}

/// Read one backup's metadata.
pub async fn load_backup(dir: &Path) -> Result<Backup> {
    let path = dir.join(BACKUP_METADATA_FILE);
    let content = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut backup: Backup = serde_json::from_slice(&content)
        .with_context(|| format!("Invalid backup metadata in {}", path.display()))?;
    backup.dir = dir.to_path_buf();
    Ok(backup)
}

/// All readable backups below `root`, oldest first. Directories without
/// readable metadata are skipped with a warning.
pub async fn list_backups(root: &Path) -> Result<Vec<Backup>> {
    let mut backups = Vec::new();
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", root.display())),
    };

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        match load_backup(&entry.path()).await {
            Ok(backup) => backups.push(backup),
            Err(e) => warn!("Skipping {}: {e:#}", entry.path().display()),
        }
    }

    backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(backups)
}

/// Check that a backup holds what a restore needs.
pub async fn verify_backup(backup: Backup) -> Result<BackupVerification> {
    tokio::task::spawn_blocking(move || verify_backup_blocking(&backup))
        .await
        .context("verification task panicked")
}

fn verify_backup_blocking(backup: &Backup) -> BackupVerification {
    let mut result = BackupVerification::default();

    if !backup.dir.join(BACKUP_METADATA_FILE).is_file() {
        result.problems.push("metadata file is missing".to_string());
    }
    if backup.file_count == 0 {
        result.problems.push("backup records zero files".to_string());
    }

    let artifacts = &backup.artifacts;
    for relative in [&artifacts.binary, &artifacts.validator, &artifacts.config, &artifacts.unit]
        .into_iter()
        .flatten()
    {
        if !backup.dir.join(relative).is_file() {
            result.problems.push(format!("{relative} is missing"));
        }
    }

    let Some(data) = backup.data_dir() else {
        result.problems.push("no data directory was captured".to_string());
        return result;
    };
    let entries = match std::fs::read_dir(&data) {
        Ok(entries) => entries,
        Err(e) => {
            result.problems.push(format!("cannot read {}: {e}", data.display()));
            return result;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if entry.file_name() == "wal" {
            result.has_wal = true;
            continue;
        }
        let meta = path.join("meta.json");
        if !meta.is_file() {
            continue;
        }
        result.blocks += 1;
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta_ok = std::fs::read(&meta)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
            .is_some();
        if !meta_ok {
            result.problems.push(format!("block {name}: meta.json is unreadable"));
        }
        if !path.join("index").is_file() {
            result.problems.push(format!("block {name}: index is missing"));
        }
        if !path.join("chunks").is_dir() {
            result.problems.push(format!("block {name}: chunks directory is missing"));
        }
    }

    if result.blocks == 0 && !result.has_wal {
        result.problems.push("data contains neither TSDB blocks nor a WAL".to_string());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;
    use crate::test_utils::{FakeSnapshots, FakeSupervisor, TestInstallation};

    fn manager(
        install: &TestInstallation,
        supervisor: Arc<FakeSupervisor>,
        snapshots: Arc<FakeSnapshots>,
    ) -> BackupManager {
        let service = install.service();
        let controller = Arc::new(ServiceController::new(
            supervisor,
            service.unit_name.clone(),
            TimeoutConfig {
                poll_interval_ms: 1,
                start_interval_secs: 0,
                ..TimeoutConfig::default()
            },
        ));
        BackupManager::new(install.backup_root(), service, controller, snapshots)
    }

    fn options(preference: BackupMethodPreference) -> BackupOptions {
        BackupOptions {
            preference,
            stop_for_copy: true,
        }
    }

    #[tokio::test]
    async fn test_file_backup_of_stopped_service() {
        let install = TestInstallation::new("2.48.1").unwrap();
        let supervisor = Arc::new(FakeSupervisor::stopped());
        let backups = manager(&install, supervisor.clone(), Arc::new(FakeSnapshots::unsupported()));

        let backup = backups
            .create("intermediate-2.55.1", Some(&Version::new(2, 48, 1)), options(BackupMethodPreference::Auto))
            .await
            .unwrap();

        assert_eq!(backup.method, BackupMethod::File);
        assert!(backup.consistent);
        assert!(backup.file_count > 0);
        assert_eq!(backup.source_version.as_deref(), Some("2.48.1"));
        assert!(backup.dir.join("binary/prometheus").is_file());
        assert!(backup.dir.join("unit/prometheus.service").is_file());
        assert!(!backup.dir.join("data/lock").exists());
        assert!(supervisor.calls().is_empty());
        assert!(backups.verify(&backup).await.unwrap());

        let listed = backups.list().await.unwrap();
        assert_eq!(listed, vec![backup]);
    }

    #[tokio::test]
    async fn test_snapshot_backup_of_running_service() {
        let install = TestInstallation::new("2.55.1").unwrap();
        let supervisor = Arc::new(FakeSupervisor::running());
        let snapshots = Arc::new(FakeSnapshots::writing_into(install.service().data_path));
        let backups = manager(&install, supervisor.clone(), snapshots);

        let backup = backups
            .create("upgrade-3.8.1", None, options(BackupMethodPreference::Auto))
            .await
            .unwrap();

        assert_eq!(backup.method, BackupMethod::Snapshot);
        assert!(backup.consistent);
        assert!(supervisor.calls().is_empty(), "snapshot must not stop the service");
        assert!(backups.verify(&backup).await.unwrap());
        assert!(!install.service().data_path.join("snapshots").join("snap-1").exists());
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_stopped_copy() {
        let install = TestInstallation::new("2.55.1").unwrap();
        let supervisor = Arc::new(FakeSupervisor::running());
        let backups = manager(&install, supervisor.clone(), Arc::new(FakeSnapshots::unsupported()));

        let backup = backups
            .create("upgrade-3.8.1", None, options(BackupMethodPreference::Auto))
            .await
            .unwrap();

        assert_eq!(backup.method, BackupMethod::File);
        assert!(backup.consistent);
        assert_eq!(supervisor.calls(), vec!["stop", "start"]);
    }

    #[tokio::test]
    async fn test_timed_out_snapshot_is_removed_before_fallback() {
        let install = TestInstallation::new("2.55.1").unwrap();
        let data_path = install.service().data_path;
        std::fs::create_dir_all(data_path.join("snapshots/operator-kept")).unwrap();
        let supervisor = Arc::new(FakeSupervisor::running());
        let snapshots = Arc::new(FakeSnapshots::timing_out(&data_path));
        let backups = manager(&install, supervisor.clone(), snapshots);

        let backup = backups
            .create("upgrade-3.8.1", None, options(BackupMethodPreference::Auto))
            .await
            .unwrap();

        assert_eq!(backup.method, BackupMethod::File);
        assert_eq!(supervisor.calls(), vec!["stop", "start"]);
        assert!(!data_path.join("snapshots/snap-1").exists());
        assert!(data_path.join("snapshots/operator-kept").is_dir());
    }

    #[tokio::test]
    async fn test_timed_out_snapshot_fails_api_method() {
        let install = TestInstallation::new("2.55.1").unwrap();
        let data_path = install.service().data_path;
        let backups = manager(
            &install,
            Arc::new(FakeSupervisor::running()),
            Arc::new(FakeSnapshots::timing_out(&data_path)),
        );

        let err = backups
            .create("upgrade-3.8.1", None, options(BackupMethodPreference::Api))
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<UpgradeError>(), Some(UpgradeError::BackupFailed { .. })));
        assert!(!data_path.join("snapshots/snap-1").exists());
    }

    #[tokio::test]
    async fn test_unknown_service_state_fails_backup() {
        let install = TestInstallation::new("2.55.1").unwrap();
        let supervisor = Arc::new(FakeSupervisor::running().failing_status());
        let backups = manager(&install, supervisor.clone(), Arc::new(FakeSnapshots::unsupported()));

        for preference in [BackupMethodPreference::File, BackupMethodPreference::Auto] {
            let err = backups.create("upgrade-3.8.1", None, options(preference)).await.unwrap_err();
            assert!(err.to_string().contains("cannot determine"), "{err:#}");
        }
        assert!(supervisor.calls().is_empty());
        assert!(backups.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_copy_is_inconsistent() {
        let install = TestInstallation::new("2.55.1").unwrap();
        let supervisor = Arc::new(FakeSupervisor::running());
        let backups = manager(&install, supervisor, Arc::new(FakeSnapshots::unsupported()));

        let backup = backups
            .create(
                "upgrade-3.8.1",
                None,
                BackupOptions {
                    preference: BackupMethodPreference::File,
                    stop_for_copy: false,
                },
            )
            .await
            .unwrap();
        assert!(!backup.consistent);
    }

    #[tokio::test]
    async fn test_api_method_requires_running_service() {
        let install = TestInstallation::new("2.55.1").unwrap();
        let backups = manager(
            &install,
            Arc::new(FakeSupervisor::stopped()),
            Arc::new(FakeSnapshots::unsupported()),
        );

        let err = backups
            .create("upgrade-3.8.1", None, options(BackupMethodPreference::Api))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpgradeError>(),
            Some(UpgradeError::BackupFailed { .. })
        ));
        assert!(backups.list().await.unwrap().is_empty(), "partial backup must be removed");
    }

    #[tokio::test]
    async fn test_empty_installation_fails_backup() {
        let temp = tempfile::TempDir::new().unwrap();
        let service = InstalledService::from_config(&crate::config::ServiceConfig {
            binary_path: temp.path().join("bin/prometheus"),
            config_path: temp.path().join("etc/prometheus.yml"),
            data_path: temp.path().join("data"),
            unit_path: temp.path().join("prometheus.service"),
            ..Default::default()
        });
        let controller = Arc::new(ServiceController::new(
            Arc::new(FakeSupervisor::stopped()),
            "prometheus.service",
            TimeoutConfig::default(),
        ));
        let backups = BackupManager::new(
            temp.path().join("backups"),
            service,
            controller,
            Arc::new(FakeSnapshots::unsupported()),
        );

        let err = backups
            .create("upgrade-3.8.1", None, options(BackupMethodPreference::File))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no files"));
    }

    #[tokio::test]
    async fn test_verify_detects_broken_block() {
        let install = TestInstallation::new("2.48.1").unwrap();
        let backups = manager(
            &install,
            Arc::new(FakeSupervisor::stopped()),
            Arc::new(FakeSnapshots::unsupported()),
        );
        let backup = backups
            .create("upgrade-2.55.1", None, options(BackupMethodPreference::File))
            .await
            .unwrap();

        let data = backup.data_dir().unwrap();
        let block = std::fs::read_dir(&data)
            .unwrap()
            .flatten()
            .find(|e| e.path().join("meta.json").exists())
            .unwrap();
        std::fs::remove_file(block.path().join("index")).unwrap();

        let verification = verify_backup(backup.clone()).await.unwrap();
        assert_eq!(verification.blocks, 1);
        assert!(verification.has_wal);
        assert!(!verification.is_valid());
        assert!(!backups.verify(&backup).await.unwrap());
    }

    #[tokio::test]
    async fn test_estimate_has_no_side_effects() {
        let install = TestInstallation::new("2.55.1").unwrap();
        let supervisor = Arc::new(FakeSupervisor::running());
        let backups = manager(&install, supervisor.clone(), Arc::new(FakeSnapshots::unsupported()));

        let estimate = backups.estimate(options(BackupMethodPreference::Auto)).await.unwrap();
        assert_eq!(estimate.method, BackupMethod::Snapshot);
        assert!(estimate.may_fall_back);
        assert!(estimate.stops_service);
        assert!(estimate.data.files > 0);
        assert!(supervisor.calls().is_empty());
        assert!(backups.list().await.unwrap().is_empty());
    }
}
