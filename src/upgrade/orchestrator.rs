//! Top-level driver: resolves the plan and runs its stages in order.
//!
//! Each stage is checked, backed up, migrated, installed, restarted and
//! health-verified before the next one starts. Any failure after the stage's
//! backup exists triggers exactly one rollback to that backup; the run then
//! stops and later stages never begin.

use anyhow::{Context, Result, bail};
use semver::Version;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::journal::RunJournal;
use super::lock::UpgradeLock;
use super::state::{RunTracker, UpgradeState};
use crate::backup::{
    Backup, BackupEstimate, BackupManager, BackupOptions, HttpSnapshotApi, RetentionManager,
    SnapshotApi,
};
use crate::config::{BackupMethodPreference, UpgradeConfig};
use crate::core::UpgradeError;
use crate::health::{HealthProbe, HealthStatus, HealthVerifier, HttpProbe};
use crate::install::{ArtifactFetcher, BinaryInstaller, InstalledBinary, ReleaseArtifact, fetcher_for};
use crate::migrate::{ConfigIssue, ConfigMigrator, IssueKind, RuleSet, read_optional};
use crate::rollback::{DataRestoreReport, RollbackCoordinator, RollbackReport};
use crate::service::{InstalledService, ServiceController, Supervisor, SystemdSupervisor, UnitSpec};
use crate::utils::atomic_write;
use crate::version::{BoundaryTable, Stage, UpgradePlan, VersionResolver, parse_version};

/// External systems the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Process supervisor (systemd).
    pub supervisor: Arc<dyn Supervisor>,
    /// Release artifact transport.
    pub fetcher: Arc<dyn ArtifactFetcher>,
    /// Health endpoint client.
    pub probe: Arc<dyn HealthProbe>,
    /// TSDB snapshot endpoint client.
    pub snapshots: Arc<dyn SnapshotApi>,
}

impl Collaborators {
    /// The real systemd / HTTP implementations for `config`.
    pub fn system(config: &UpgradeConfig) -> Result<Self> {
        let service = InstalledService::from_config(&config.service);
        Ok(Self {
            supervisor: Arc::new(SystemdSupervisor::new()),
            fetcher: fetcher_for(&config.release)?,
            probe: Arc::new(HttpProbe::new(config.health.request_timeout())?),
            snapshots: Arc::new(HttpSnapshotApi::new(&service.base_url(), config.snapshot_timeout())?),
        })
    }
}

/// Which part of the plan to run (`--stage`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageSelection {
    /// Every stage.
    #[default]
    Auto,
    /// Stages 1 through n (1-based), then stop.
    Through(usize),
}

impl FromStr for StageSelection {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        match s.parse::<usize>() {
            Ok(n) if n > 0 => Ok(Self::Through(n)),
            _ => Err(UpgradeError::ConfigError {
                message: format!("invalid stage '{s}' (expected a stage number from 1, or 'auto')"),
            }),
        }
    }
}

/// Options for one run.
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Target version as given by the operator.
    pub target: String,
    /// Reinstall even when the target is not newer.
    pub force: bool,
    /// Run read-only steps only.
    pub dry_run: bool,
    /// Stages to run.
    pub stage: StageSelection,
    /// Do not take backups (no rollback possible).
    pub skip_backup: bool,
    /// Backup method preference.
    pub method: BackupMethodPreference,
    /// Retention override for the post-run prune.
    pub retention_days: Option<u32>,
    /// Abort the stage when backup verification finds problems.
    pub strict_verify: bool,
    /// Stop the service for offline data copies.
    pub stop_for_copy: bool,
}

impl UpgradeOptions {
    /// Options with defaults taken from `config`.
    pub fn new(target: impl Into<String>, config: &UpgradeConfig) -> Self {
        Self {
            target: target.into(),
            force: false,
            dry_run: false,
            stage: StageSelection::Auto,
            skip_backup: false,
            method: config.backup.method,
            retention_days: None,
            strict_verify: false,
            stop_for_copy: config.backup.stop_for_copy,
        }
    }

    fn backup_options(&self) -> BackupOptions {
        BackupOptions {
            preference: self.method,
            stop_for_copy: self.stop_for_copy,
        }
    }
}

/// What happened to the unit and configuration files in one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    /// A unit was generated from the template because none existed.
    pub unit_generated: bool,
    /// Existing unit flags were rewritten.
    pub unit_rewritten: bool,
    /// A minimal configuration was written because none existed.
    pub config_created: bool,
    /// Configuration key rewrites.
    pub config_changes: Vec<String>,
}

impl MigrationSummary {
    /// Whether any file changes.
    pub fn is_changed(&self) -> bool {
        self.unit_generated || self.unit_rewritten || self.config_created || !self.config_changes.is_empty()
    }
}

/// A completed stage.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub issues: Vec<ConfigIssue>,
    pub backup: Option<Backup>,
    pub migration: MigrationSummary,
    pub installed: InstalledBinary,
    pub health: HealthStatus,
}

/// A successful mutating run.
#[derive(Debug, Clone)]
pub struct UpgradeReport {
    pub from: Option<Version>,
    pub target: Version,
    pub stages: Vec<StageReport>,
    /// Plan stages not run because of `--stage`.
    pub remaining: Vec<Stage>,
    /// Backups removed by retention.
    pub pruned: Vec<String>,
}

/// What a stage would do.
#[derive(Debug, Clone)]
pub struct StagePreview {
    pub stage: Stage,
    pub issues: Vec<ConfigIssue>,
    pub migration: MigrationSummary,
    /// `None` when the stage takes no backup.
    pub backup: Option<BackupEstimate>,
    pub artifact: ReleaseArtifact,
}

/// Result of `--dry-run`.
#[derive(Debug, Clone)]
pub struct DryRunReport {
    pub from: Option<Version>,
    pub target: Version,
    pub stages: Vec<StagePreview>,
    pub remaining: Vec<Stage>,
    pub retention_days: u32,
}

/// Outcome of [`UpgradeOrchestrator::run`].
#[derive(Debug, Clone)]
pub enum UpgradeOutcome {
    /// Nothing to do; the installed version is current.
    UpToDate(Version),
    DryRun(DryRunReport),
    Completed(UpgradeReport),
}

/// Operator-requested restore.
#[derive(Debug, Clone, Default)]
pub struct RollbackRequest {
    /// Backup id; the newest backup when `None`.
    pub backup_id: Option<String>,
    /// Also replace the data directory.
    pub restore_data: bool,
    /// Allow restoring data from an inconsistent backup.
    pub accept_inconsistent: bool,
}

/// Result of a manual rollback.
#[derive(Debug, Clone)]
pub struct ManualRollback {
    pub report: RollbackReport,
    pub data: Option<DataRestoreReport>,
}

/// Texts a stage would leave behind.
struct MigratedTexts {
    unit: String,
    config: String,
    summary: MigrationSummary,
}

const MINIMAL_CONFIG: &str = "global:
  scrape_interval: 15s
  evaluation_interval: 15s

scrape_configs:
  - job_name: prometheus
    static_configs:
      - targets: ['{listen}']
";

/// Drives staged upgrades of one installation.
pub struct UpgradeOrchestrator {
    config: UpgradeConfig,
    service: InstalledService,
    boundaries: BoundaryTable,
    rules: RuleSet,
    collaborators: Collaborators,
    controller: Arc<ServiceController>,
    backups: BackupManager,
    installer: BinaryInstaller,
    rollback: RollbackCoordinator,
    cancel: Arc<AtomicBool>,
}

impl UpgradeOrchestrator {
    /// Build an orchestrator with the built-in boundary and rule tables.
    pub fn new(config: UpgradeConfig, collaborators: Collaborators) -> Result<Self> {
        let rules = RuleSet::builtin()?;
        let service = InstalledService::from_config(&config.service);
        let controller = Arc::new(ServiceController::new(
            collaborators.supervisor.clone(),
            service.unit_name.clone(),
            config.timeouts.clone(),
        ));
        let backups = BackupManager::new(
            config.backup.root.clone(),
            service.clone(),
            controller.clone(),
            collaborators.snapshots.clone(),
        );
        let installer =
            BinaryInstaller::new(config.release.clone(), &config.service, collaborators.fetcher.clone());
        let rollback = RollbackCoordinator::new(
            service.clone(),
            controller.clone(),
            collaborators.supervisor.clone(),
        );

        Ok(Self {
            config,
            service,
            boundaries: BoundaryTable::builtin(),
            rules,
            collaborators,
            controller,
            backups,
            installer,
            rollback,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replace the boundary table.
    pub fn with_boundaries(mut self, boundaries: BoundaryTable) -> Self {
        self.boundaries = boundaries;
        self
    }

    /// Share a cancellation flag (set by the Ctrl-C handler).
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// The managed installation.
    pub fn service(&self) -> &InstalledService {
        &self.service
    }

    /// Service controller.
    pub fn controller(&self) -> &ServiceController {
        &self.controller
    }

    /// Backup manager.
    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Operator configuration.
    pub fn config(&self) -> &UpgradeConfig {
        &self.config
    }

    /// Take the upgrade lock.
    pub async fn lock(&self) -> Result<UpgradeLock> {
        UpgradeLock::acquire(&self.config.state_dir, self.config.timeouts.lock_timeout()).await
    }

    /// Resolve the plan from the installed version to `target`.
    pub async fn resolve_plan(&self, target: &str, force: bool) -> Result<UpgradePlan> {
        let target = parse_version(target)?;
        self.resolve(target, force).await
    }

    async fn resolve(&self, target: Version, force: bool) -> Result<UpgradePlan> {
        let current = self.service.current_version().await?;
        let plan = VersionResolver::new(&self.boundaries).resolve_versions(current, target, force);
        info!(
            from = %plan.from().map_or_else(|| "(none)".to_string(), ToString::to_string),
            target = %plan.target(),
            stages = plan.stages().len(),
            "Resolved upgrade plan"
        );
        Ok(plan)
    }

    /// Run an upgrade according to `options`.
    pub async fn run(&self, options: &UpgradeOptions) -> Result<UpgradeOutcome> {
        let target = parse_version(&options.target)?;

        let lock = if options.dry_run {
            None
        } else {
            Some(self.lock().await?)
        };

        let plan = self.resolve(target, options.force).await?;
        if plan.is_empty() {
            let current = plan.from().cloned().unwrap_or_else(|| plan.target().clone());
            info!(version = %current, "Already up to date");
            return Ok(UpgradeOutcome::UpToDate(current));
        }

        let (selected, remaining) = select_stages(&plan, options.stage)?;
        if options.dry_run {
            return Ok(UpgradeOutcome::DryRun(self.preview(&plan, selected, remaining, options).await?));
        }

        let journal = RunJournal::start(
            &self.config.state_dir,
            plan.from().map(ToString::to_string),
            plan.target().to_string(),
            plan.stages().iter().map(|stage| stage.name.clone()).collect(),
        );
        let mut tracker = RunTracker::new(journal);
        tracker.advance(
            "plan",
            UpgradeState::PlanResolved,
            Some(format!("{} stage(s)", plan.stages().len())),
        )?;

        let mut stages = Vec::with_capacity(selected.len());
        for (index, stage) in selected.iter().enumerate() {
            let span = info_span!("stage", stage = %stage.name, target = %stage.target);
            let previous = plan.version_before(index);
            let result = self.run_stage(stage, previous, options, &mut tracker).instrument(span).await;
            match result {
                Ok(report) => stages.push(report),
                Err(e) => {
                    tracker.fail(&stage.name, &e);
                    return Err(e);
                }
            }
        }

        let retention = options.retention_days.unwrap_or(self.config.backup.retention_days);
        let pruned = match RetentionManager::new(self.config.backup.root.clone()).prune(retention).await {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!("Backup pruning failed: {e:#}");
                Vec::new()
            }
        };

        tracker.finish();
        drop(lock);
        info!(target = %plan.target(), stages = stages.len(), "Upgrade finished");
        Ok(UpgradeOutcome::Completed(UpgradeReport {
            from: plan.from().cloned(),
            target: plan.target().clone(),
            stages,
            remaining: remaining.to_vec(),
            pruned,
        }))
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        previous: Option<&Version>,
        options: &UpgradeOptions,
        tracker: &mut RunTracker,
    ) -> Result<StageReport> {
        info!("Starting stage");
        let migrator = ConfigMigrator::new(&self.rules, &stage.target);
        let issues = migrator.check(&self.service).await.context("Pre-flight check failed")?;
        log_issues(&issues);
        tracker.advance(&stage.name, UpgradeState::Checked, Some(format!("{} issue(s)", issues.len())))?;
        self.ensure_not_cancelled(stage)?;

        let backup = self.backup_for(stage, previous, options).await?;
        if let Some(backup) = &backup {
            tracker.advance(&stage.name, UpgradeState::BackedUp, Some(backup.id.clone()))?;
        }

        match self.apply_stage(stage, &migrator, tracker).await {
            Ok((migration, installed, health)) => {
                tracker.advance(&stage.name, UpgradeState::Complete, None)?;
                info!("Stage complete");
                Ok(StageReport {
                    stage: stage.clone(),
                    issues,
                    backup,
                    migration,
                    installed,
                    health,
                })
            }
            Err(cause) => match backup {
                Some(backup) => Err(self.roll_back(stage, &backup, cause, tracker).await),
                None => Err(cause),
            },
        }
    }

    async fn backup_for(
        &self,
        stage: &Stage,
        previous: Option<&Version>,
        options: &UpgradeOptions,
    ) -> Result<Option<Backup>> {
        if !stage.has_previous_install() {
            debug!("Fresh install, nothing to back up");
            return Ok(None);
        }
        if options.skip_backup {
            warn!("Backups disabled by operator; a failure in this stage cannot be rolled back");
            return Ok(None);
        }

        let backup = self.backups.create(&stage.name, previous, options.backup_options()).await?;
        if !self.backups.verify(&backup).await? {
            if options.strict_verify {
                bail!(UpgradeError::BackupFailed {
                    reason: format!("backup {} failed verification", backup.id),
                });
            }
            warn!(backup = %backup.id, "Backup verification found problems, continuing (use --verify to abort instead)");
        }
        Ok(Some(backup))
    }

    /// Everything after the backup. Any error here is rolled back by the caller.
    async fn apply_stage(
        &self,
        stage: &Stage,
        migrator: &ConfigMigrator<'_>,
        tracker: &mut RunTracker,
    ) -> Result<(MigrationSummary, InstalledBinary, HealthStatus)> {
        self.ensure_not_cancelled(stage)?;
        self.controller.stop().await?;

        let unit = read_optional(&self.service.unit_path).await?;
        let config = read_optional(&self.service.config_path).await?;
        let texts = self.migrate_texts(stage, migrator, unit, config)?;
        self.write_migrations(&texts)?;
        tracker.advance(
            &stage.name,
            UpgradeState::Migrated,
            texts.summary.is_changed().then(|| "unit/config rewritten".to_string()),
        )?;
        self.ensure_not_cancelled(stage)?;

        let installed = self.installer.install(&stage.target).await?;
        let reported = self.service.current_version().await?;
        if reported.as_ref() != Some(&stage.target) {
            bail!(
                "Installed binary reports {}, expected {}",
                reported.map_or_else(|| "nothing".to_string(), |v| v.to_string()),
                stage.target
            );
        }
        tracker.advance(&stage.name, UpgradeState::Installed, Some(installed.version.to_string()))?;

        let validation = migrator.validate(&self.service, &self.service.config_path).await?;
        if !validation.valid {
            bail!(UpgradeError::ConfigValidation {
                path: self.service.config_path.display().to_string(),
                output: validation.output,
            });
        }
        self.ensure_not_cancelled(stage)?;

        self.collaborators.supervisor.daemon_reload().await.context("daemon-reload failed")?;
        self.controller.start().await?;
        tracker.advance(&stage.name, UpgradeState::Restarted, None)?;

        let verifier = HealthVerifier::new(
            self.collaborators.probe.clone(),
            self.service.base_url(),
            self.config.health.query_probe,
        );
        let health = verifier.wait_healthy(&self.config.health).await?;
        tracker.advance(
            &stage.name,
            UpgradeState::HealthVerified,
            Some(format!("{} attempt(s)", health.attempts_used)),
        )?;

        Ok((texts.summary, installed, health))
    }

    async fn roll_back(
        &self,
        stage: &Stage,
        backup: &Backup,
        cause: anyhow::Error,
        tracker: &mut RunTracker,
    ) -> anyhow::Error {
        error!(backup = %backup.id, "Stage failed, rolling back: {cause:#}");
        if let Err(e) = tracker.advance(&stage.name, UpgradeState::RollingBack, Some(backup.id.clone())) {
            warn!("{e:#}");
        }

        let reason = format!("{cause:#}");
        match self.rollback.restore(backup).await {
            Ok(report) => {
                if let Err(e) = tracker.advance(&stage.name, UpgradeState::RolledBack, None) {
                    warn!("{e:#}");
                }
                cause.context(UpgradeError::StageAborted {
                    stage: stage.name.clone(),
                    backup: Some(backup.dir.display().to_string()),
                    data_path: report.data_backup.map(|path| path.display().to_string()),
                    reason,
                })
            }
            Err(rollback_error) => {
                let rollback_reason = format!("{rollback_error:#}");
                error!(backup = %backup.dir.display(), "Rollback failed, manual intervention required: {rollback_reason}");
                if let Err(e) =
                    tracker.advance(&stage.name, UpgradeState::RollbackFailed, Some(rollback_reason.clone()))
                {
                    warn!("{e:#}");
                }
                cause.context(UpgradeError::RollbackFailed {
                    stage: stage.name.clone(),
                    backup: backup.dir.display().to_string(),
                    reason: rollback_reason,
                })
            }
        }
    }

    /// Compute the unit and configuration the stage leaves behind. Pure.
    fn migrate_texts(
        &self,
        stage: &Stage,
        migrator: &ConfigMigrator<'_>,
        unit: Option<String>,
        config: Option<String>,
    ) -> Result<MigratedTexts> {
        let mut summary = MigrationSummary::default();

        let unit = match unit {
            Some(text) => {
                let rewritten = migrator.apply(&text);
                summary.unit_rewritten = rewritten != text;
                rewritten
            }
            None => {
                summary.unit_generated = true;
                UnitSpec::for_version(&stage.target, &self.config.service).render()?
            }
        };

        let config = match config {
            Some(text) => {
                let rewrite = migrator.apply_config(&text)?;
                summary.config_changes = rewrite.changes;
                rewrite.text
            }
            None => {
                summary.config_created = true;
                MINIMAL_CONFIG.replace("{listen}", &self.service.listen_address)
            }
        };

        Ok(MigratedTexts {
            unit,
            config,
            summary,
        })
    }

    fn write_migrations(&self, texts: &MigratedTexts) -> Result<()> {
        let summary = &texts.summary;
        if summary.unit_generated || summary.unit_rewritten {
            atomic_write(&self.service.unit_path, texts.unit.as_bytes())?;
            info!(path = %self.service.unit_path.display(), generated = summary.unit_generated, "Unit written");
        }
        if summary.config_created || !summary.config_changes.is_empty() {
            atomic_write(&self.service.config_path, texts.config.as_bytes())?;
            for change in &summary.config_changes {
                info!(path = %self.service.config_path.display(), "{change}");
            }
        }
        if !self.service.data_path.exists() {
            crate::utils::ensure_dir(&self.service.data_path)?;
            info!(path = %self.service.data_path.display(), "Created data directory");
        }
        Ok(())
    }

    /// Read-only walk over the selected stages, chaining in-memory
    /// migrations so later stages see what earlier ones would write.
    async fn preview(
        &self,
        plan: &UpgradePlan,
        selected: &[Stage],
        remaining: &[Stage],
        options: &UpgradeOptions,
    ) -> Result<DryRunReport> {
        let mut unit = read_optional(&self.service.unit_path).await?;
        let mut config = read_optional(&self.service.config_path).await?;
        let estimate = if options.skip_backup {
            None
        } else {
            Some(self.backups.estimate(options.backup_options()).await?)
        };

        let mut stages = Vec::with_capacity(selected.len());
        for stage in selected {
            let migrator = ConfigMigrator::new(&self.rules, &stage.target);
            let issues = migrator
                .check_texts(unit.as_deref(), config.as_deref(), &self.service.config_path)
                .await?;
            let texts = self.migrate_texts(stage, &migrator, unit.take(), config.take())?;
            stages.push(StagePreview {
                stage: stage.clone(),
                issues,
                migration: texts.summary,
                backup: estimate.clone().filter(|_| stage.has_previous_install()),
                artifact: self.installer.artifact(&stage.target),
            });
            unit = Some(texts.unit);
            config = Some(texts.config);
        }

        Ok(DryRunReport {
            from: plan.from().cloned(),
            target: plan.target().clone(),
            stages,
            remaining: remaining.to_vec(),
            retention_days: options.retention_days.unwrap_or(self.config.backup.retention_days),
        })
    }

    /// Take a backup outside an upgrade.
    pub async fn create_backup(&self, options: BackupOptions) -> Result<Backup> {
        let _lock = self.lock().await?;
        let current = self.service.current_version().await?;
        let backup = self.backups.create("manual", current.as_ref(), options).await?;
        if !self.backups.verify(&backup).await? {
            warn!(backup = %backup.id, "Backup verification found problems");
        }
        Ok(backup)
    }

    /// Restore a backup on operator request.
    pub async fn manual_rollback(&self, request: &RollbackRequest) -> Result<ManualRollback> {
        let _lock = self.lock().await?;
        let backup = match &request.backup_id {
            Some(id) => self.backups.load(id).await?,
            None => self.backups.latest().await?.ok_or_else(|| UpgradeError::ConfigError {
                message: format!("no backups found in {}", self.backups.root().display()),
            })?,
        };

        if request.restore_data && !backup.consistent && !request.accept_inconsistent {
            bail!(UpgradeError::ConfigError {
                message: format!(
                    "backup {} holds an inconsistent data copy; pass --accept-inconsistent to restore it anyway",
                    backup.id
                ),
            });
        }

        let report = self.rollback.restore(&backup).await?;
        let data = if request.restore_data {
            Some(self.rollback.restore_data(&backup, request.accept_inconsistent).await?)
        } else {
            None
        };
        Ok(ManualRollback {
            report,
            data,
        })
    }

    fn ensure_not_cancelled(&self, stage: &Stage) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            warn!("Cancellation requested");
            bail!(UpgradeError::Cancelled {
                stage: stage.name.clone(),
            });
        }
        Ok(())
    }
}

/// Split the plan into the stages to run now and those left for later.
fn select_stages(plan: &UpgradePlan, selection: StageSelection) -> Result<(&[Stage], &[Stage])> {
    let stages = plan.stages();
    match selection {
        StageSelection::Auto => Ok((stages, &[])),
        StageSelection::Through(n) if n >= 1 && n <= stages.len() => Ok(stages.split_at(n)),
        StageSelection::Through(n) => Err(UpgradeError::InvalidStage {
            requested: n,
            available: stages.len(),
        }
        .into()),
    }
}

fn log_issues(issues: &[ConfigIssue]) {
    for issue in issues {
        let location = issue.location.as_deref().unwrap_or("-");
        match (issue.kind, issue.auto_fix) {
            (IssueKind::ChangedDefault, _) => {
                debug!(identifier = %issue.identifier, "Changed default: {}", issue.remediation);
            }
            (_, true) => info!(identifier = %issue.identifier, location, "Will rewrite: {}", issue.remediation),
            (_, false) => warn!(identifier = %issue.identifier, location, "Needs attention: {}", issue.remediation),
        }
    }
}
