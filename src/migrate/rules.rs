//! Declarative migration rules.
//!
//! Every rule names the first release it applies to (`since`). A rule is
//! active for a stage when the stage's target is at or above `since`, which
//! keeps intermediate 2.x stages free of 3.x rewrites.

use anyhow::{Context, Result};
use regex::Regex;
use semver::Version;
use serde::Serialize;
use std::fmt;

/// Classification of a detected incompatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    /// The flag, feature or key no longer exists.
    Removed,
    /// It exists under a new name.
    Renamed,
    /// Still accepted, but the default behaviour changed.
    ChangedDefault,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Removed => "removed",
            Self::Renamed => "renamed",
            Self::ChangedDefault => "changed-default",
        })
    }
}

/// Where an issue was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueSource {
    /// Command-line flags in the unit's `ExecStart`.
    Flags,
    /// The server configuration file.
    ConfigFile,
    /// A rule file referenced by the configuration.
    RuleFile,
    /// Release-wide behaviour, not tied to a file.
    Behaviour,
}

/// One incompatibility between the current configuration and a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigIssue {
    /// What kind of change it is.
    pub kind: IssueKind,
    /// Where it was found.
    pub source: IssueSource,
    /// Offending flag, key or expression.
    pub identifier: String,
    /// File and line or key path, when known.
    pub location: Option<String>,
    /// What the operator (or promup) should do.
    pub remediation: String,
    /// Whether `apply` rewrites it automatically.
    pub auto_fix: bool,
}

/// Rewrite applied to a command-line flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagAction {
    /// Drop the flag and its value.
    Remove,
    /// Rename the flag, keeping its value.
    Rename(&'static str),
}

/// A command-line flag rule. Flag names exclude the leading `--`.
#[derive(Debug, Clone)]
pub struct FlagRule {
    /// First release the rule applies to.
    pub since: Version,
    /// Flag name.
    pub flag: &'static str,
    /// Whether the flag consumes a value (`--flag value` or `--flag=value`).
    pub takes_value: bool,
    /// Rewrite.
    pub action: FlagAction,
    /// Operator guidance.
    pub remediation: &'static str,
}

/// Rewrite applied to an `--enable-feature` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureAction {
    /// The feature is now always on (or gone); drop it.
    Remove,
    /// The feature became a dedicated flag.
    Promote(&'static str),
}

/// An `--enable-feature` rule.
#[derive(Debug, Clone)]
pub struct FeatureRule {
    /// First release the rule applies to.
    pub since: Version,
    /// Feature name.
    pub feature: &'static str,
    /// Rewrite.
    pub action: FeatureAction,
    /// Operator guidance.
    pub remediation: &'static str,
}

/// Rewrite applied to a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Rename the key, keeping its value.
    Rename(&'static str),
    /// Report only; needs a human decision.
    Report(IssueKind),
}

/// A configuration-file key rule.
#[derive(Debug, Clone)]
pub struct ConfigKeyRule {
    /// First release the rule applies to.
    pub since: Version,
    /// Key name at any depth.
    pub key: &'static str,
    /// Only match when the key's scalar value equals this.
    pub value: Option<&'static str>,
    /// Rewrite.
    pub action: KeyAction,
    /// Operator guidance.
    pub remediation: &'static str,
}

/// A pattern reported when found in rule-file expressions.
#[derive(Debug, Clone)]
pub struct ExpressionRule {
    /// First release the rule applies to.
    pub since: Version,
    /// Short name shown in reports.
    pub identifier: &'static str,
    /// Matched against each line of every rule file.
    pub pattern: Regex,
    /// Classification.
    pub kind: IssueKind,
    /// Operator guidance.
    pub remediation: &'static str,
}

/// A behaviour change with no syntax to detect.
#[derive(Debug, Clone)]
pub struct DefaultChange {
    /// First release the change applies to.
    pub since: Version,
    /// Short name shown in reports.
    pub identifier: &'static str,
    /// Operator guidance.
    pub remediation: &'static str,
}

/// The complete rule table.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    /// Flag rules.
    pub flags: Vec<FlagRule>,
    /// Feature-flag rules.
    pub features: Vec<FeatureRule>,
    /// Config-key rules.
    pub config_keys: Vec<ConfigKeyRule>,
    /// Expression rules.
    pub expressions: Vec<ExpressionRule>,
    /// Behaviour changes.
    pub defaults: Vec<DefaultChange>,
}

impl RuleSet {
    /// Rules for the 2.x → 3.x transition.
    pub fn builtin() -> Result<Self> {
        let v3 = Version::new(3, 0, 0);

        let flags = vec![
            FlagRule {
                since: v3.clone(),
                flag: "storage.tsdb.allow-overlapping-blocks",
                takes_value: false,
                action: FlagAction::Remove,
                remediation: "Overlapping blocks are always allowed; drop the flag",
            },
            FlagRule {
                since: v3.clone(),
                flag: "alertmanager.timeout",
                takes_value: true,
                action: FlagAction::Remove,
                remediation: "Set 'timeout' in the alertmanager_config block instead",
            },
            FlagRule {
                since: v3.clone(),
                flag: "storage.tsdb.retention",
                takes_value: true,
                action: FlagAction::Rename("storage.tsdb.retention.time"),
                remediation: "Use --storage.tsdb.retention.time",
            },
        ];

        let removed_feature = |feature: &'static str, remediation: &'static str| FeatureRule {
            since: v3.clone(),
            feature,
            action: FeatureAction::Remove,
            remediation,
        };
        let promoted_feature =
            |feature: &'static str, flag: &'static str, remediation: &'static str| FeatureRule {
                since: v3.clone(),
                feature,
                action: FeatureAction::Promote(flag),
                remediation,
            };

        let features = vec![
            removed_feature("promql-at-modifier", "The @ modifier is always enabled"),
            removed_feature("promql-negative-offset", "Negative offsets are always enabled"),
            removed_feature(
                "new-service-discovery-manager",
                "The new service discovery manager is the only implementation",
            ),
            removed_feature("expand-external-labels", "External labels are always expanded"),
            removed_feature(
                "no-default-scrape-port",
                "Default ports are no longer added to targets",
            ),
            removed_feature("auto-gomemlimit", "GOMEMLIMIT is set automatically"),
            removed_feature("auto-gomaxprocs", "GOMAXPROCS is set automatically"),
            promoted_feature(
                "remote-write-receiver",
                "web.enable-remote-write-receiver",
                "Use --web.enable-remote-write-receiver",
            ),
            promoted_feature(
                "otlp-write-receiver",
                "web.enable-otlp-receiver",
                "Use --web.enable-otlp-receiver",
            ),
            promoted_feature("agent", "agent", "Use --agent"),
        ];

        let config_keys = vec![
            ConfigKeyRule {
                since: v3.clone(),
                key: "scrape_classic_histograms",
                value: None,
                action: KeyAction::Rename("always_scrape_classic_histograms"),
                remediation: "Renamed to always_scrape_classic_histograms",
            },
            ConfigKeyRule {
                since: v3.clone(),
                key: "api_version",
                value: Some("v1"),
                action: KeyAction::Report(IssueKind::Removed),
                remediation: "The Alertmanager v1 API is gone; upgrade Alertmanager and set api_version: v2",
            },
        ];

        let expressions = vec![
            ExpressionRule {
                since: v3.clone(),
                identifier: "holt_winters",
                pattern: Regex::new(r"\bholt_winters\s*\(").context("invalid expression pattern")?,
                kind: IssueKind::Renamed,
                remediation: "Renamed to double_exponential_smoothing, which requires --enable-feature=promql-experimental-functions",
            },
            ExpressionRule {
                since: v3.clone(),
                identifier: "integer le/quantile matcher",
                pattern: Regex::new(r#"\b(le|quantile)\s*=\s*"[+-]?\d+""#)
                    .context("invalid expression pattern")?,
                kind: IssueKind::ChangedDefault,
                remediation: "le and quantile label values are normalised to floats (\"1\" becomes \"1.0\"); use le=~\"1(\\.0)?\"",
            },
        ];

        let defaults = vec![
            DefaultChange {
                since: v3.clone(),
                identifier: "utf-8 metric and label names",
                remediation: "UTF-8 names are accepted by default; set metric_name_validation_scheme: legacy to keep the old rules",
            },
            DefaultChange {
                since: v3.clone(),
                identifier: "scrape protocol negotiation",
                remediation: "Targets that send an invalid Content-Type now fail; set fallback_scrape_protocol per job",
            },
            DefaultChange {
                since: v3.clone(),
                identifier: "left-open range selectors",
                remediation: "Range and lookback windows exclude the left boundary sample; review rate() windows close to the scrape interval",
            },
            DefaultChange {
                since: v3,
                identifier: "regex . matches newlines",
                remediation: "The regex '.' now matches newlines; review label matchers relying on the old behaviour",
            },
        ];

        Ok(Self {
            flags,
            features,
            config_keys,
            expressions,
            defaults,
        })
    }

    /// Flag rule for `name`, when active for `target`.
    pub fn flag_rule(&self, name: &str, target: &Version) -> Option<&FlagRule> {
        self.flags.iter().find(|r| r.flag == name && *target >= r.since)
    }

    /// Feature rule for `feature`, when active for `target`.
    pub fn feature_rule(&self, feature: &str, target: &Version) -> Option<&FeatureRule> {
        self.features.iter().find(|r| r.feature == feature && *target >= r.since)
    }

    /// Config-key rules active for `target`.
    pub fn config_key_rules<'a>(
        &'a self,
        target: &'a Version,
    ) -> impl Iterator<Item = &'a ConfigKeyRule> + 'a {
        self.config_keys.iter().filter(move |r| *target >= r.since)
    }

    /// Expression rules active for `target`.
    pub fn expression_rules<'a>(
        &'a self,
        target: &'a Version,
    ) -> impl Iterator<Item = &'a ExpressionRule> + 'a {
        self.expressions.iter().filter(move |r| *target >= r.since)
    }

    /// Behaviour changes active for `target`.
    pub fn default_changes<'a>(
        &'a self,
        target: &'a Version,
    ) -> impl Iterator<Item = &'a DefaultChange> + 'a {
        self.defaults.iter().filter(move |r| *target >= r.since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_inactive_below_since() {
        let rules = RuleSet::builtin().unwrap();
        let v2 = Version::new(2, 55, 1);
        let v3 = Version::new(3, 8, 1);

        assert!(rules.flag_rule("storage.tsdb.retention", &v2).is_none());
        assert!(rules.flag_rule("storage.tsdb.retention", &v3).is_some());
        assert!(rules.feature_rule("agent", &v2).is_none());
        assert_eq!(rules.config_key_rules(&v2).count(), 0);
        assert_eq!(rules.default_changes(&v3).count(), 4);
    }

    #[test]
    fn test_expression_patterns() {
        let rules = RuleSet::builtin().unwrap();
        let v3 = Version::new(3, 0, 0);
        let matches = |line: &str| {
            rules.expression_rules(&v3).filter(|r| r.pattern.is_match(line)).count()
        };

        assert_eq!(matches("expr: holt_winters(x[5m], 0.5, 0.5)"), 1);
        assert_eq!(matches(r#"expr: histogram_quantile(0.9, rate(x_bucket{le="1"}[5m]))"#), 1);
        assert_eq!(matches(r#"expr: x_bucket{le="0.5"}"#), 0);
        assert_eq!(matches("expr: rate(x[5m])"), 0);
    }
}
