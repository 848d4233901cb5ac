//! Detection and rewriting of configuration the target release rejects.
//!
//! Three inputs are inspected: command-line flags in the unit's `ExecStart`
//! ([`flags`]), keys in the server configuration ([`config_file`]) and
//! expressions in rule files ([`expressions`]). Flag and key rewrites are
//! pure text transformations and are always computed in memory first; the
//! orchestrator writes them only after the service has stopped.
//!
//! Rules are data, not code: see [`rules::RuleSet::builtin`].

pub mod config_file;
pub mod expressions;
pub mod flags;
pub mod rules;
pub mod validator;

pub use config_file::{ConfigFileMigrator, ConfigRewrite};
pub use flags::FlagRewriter;
pub use rules::{ConfigIssue, IssueKind, IssueSource, RuleSet};
pub use validator::{ConfigValidator, ValidationReport};

use anyhow::{Context, Result};
use semver::Version;
use std::path::Path;
use tracing::debug;

use crate::service::InstalledService;

/// Migration entry point for one target version.
pub struct ConfigMigrator<'a> {
    rules: &'a RuleSet,
    target: &'a Version,
}

impl<'a> ConfigMigrator<'a> {
    /// Create a migrator for `target`.
    pub fn new(rules: &'a RuleSet, target: &'a Version) -> Self {
        Self {
            rules,
            target,
        }
    }

    /// Report every incompatibility in the installed unit, configuration and
    /// rule files. Missing files are skipped.
    pub async fn check(&self, service: &InstalledService) -> Result<Vec<ConfigIssue>> {
        let unit = read_optional(&service.unit_path).await?;
        let config = read_optional(&service.config_path).await?;
        self.check_texts(unit.as_deref(), config.as_deref(), &service.config_path).await
    }

    /// Like [`check`](Self::check), for texts already in memory.
    pub async fn check_texts(
        &self,
        unit: Option<&str>,
        config: Option<&str>,
        config_path: &Path,
    ) -> Result<Vec<ConfigIssue>> {
        let mut issues = Vec::new();

        if let Some(unit) = unit {
            issues.extend(FlagRewriter::new(self.rules, self.target).check(unit));
        }

        if let Some(config) = config {
            issues.extend(ConfigFileMigrator::new(self.rules, self.target).check(config)?);

            let patterns = ConfigFileMigrator::rule_file_patterns(config)?;
            let files = expressions::resolve_rule_files(config_path, &patterns);
            debug!(count = files.len(), "Scanning rule files");
            issues.extend(expressions::scan_rule_files(self.rules, self.target, &files).await);
        }

        issues.extend(self.rules.default_changes(self.target).map(|change| ConfigIssue {
            kind: IssueKind::ChangedDefault,
            source: IssueSource::Behaviour,
            identifier: change.identifier.to_string(),
            location: None,
            remediation: change.remediation.to_string(),
            auto_fix: false,
        }));

        Ok(issues)
    }

    /// Rewrite unit flags for the target. Pure and idempotent.
    pub fn apply(&self, unit: &str) -> String {
        FlagRewriter::new(self.rules, self.target).apply(unit)
    }

    /// Rewrite configuration keys for the target, in memory.
    pub fn apply_config(&self, config: &str) -> Result<ConfigRewrite> {
        ConfigFileMigrator::new(self.rules, self.target).dry_apply(config)
    }

    /// Run the external validator against `config_path`.
    pub async fn validate(
        &self,
        service: &InstalledService,
        config_path: &Path,
    ) -> Result<ValidationReport> {
        ConfigValidator::locate(service.binary_dir()).validate(config_path).await
    }
}

/// Read a file that may legitimately be absent.
pub(crate) async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_texts_aggregates_sources() {
        let rules = RuleSet::builtin().unwrap();
        let target = Version::new(3, 8, 1);
        let migrator = ConfigMigrator::new(&rules, &target);

        let unit = "ExecStart=/bin/prometheus --storage.tsdb.retention=30d\n";
        let config = "global: {}\nscrape_configs:\n  - job_name: a\n    scrape_classic_histograms: true\n";
        let issues = migrator
            .check_texts(Some(unit), Some(config), Path::new("/nonexistent/prometheus.yml"))
            .await
            .unwrap();

        assert!(issues.iter().any(|i| i.source == IssueSource::Flags));
        assert!(issues.iter().any(|i| i.source == IssueSource::ConfigFile));
        assert_eq!(issues.iter().filter(|i| i.source == IssueSource::Behaviour).count(), 4);
    }

    #[tokio::test]
    async fn test_v2_target_has_no_issues() {
        let rules = RuleSet::builtin().unwrap();
        let target = Version::new(2, 55, 1);
        let migrator = ConfigMigrator::new(&rules, &target);

        let issues = migrator
            .check_texts(
                Some("ExecStart=/bin/prometheus --storage.tsdb.retention=30d\n"),
                Some("global: {}\n"),
                Path::new("/nonexistent/prometheus.yml"),
            )
            .await
            .unwrap();
        assert!(issues.is_empty());
    }
}
