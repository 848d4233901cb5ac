//! Version parsing and upgrade-path resolution.
//!
//! The on-disk format and flag set of the server change incompatibly at some
//! releases. A [`BoundaryTable`] lists those thresholds and the release an
//! installation must pass through first; [`VersionResolver`] turns a
//! `(current, target)` pair into an immutable [`UpgradePlan`].
//!
//! # Resolution rules
//!
//! - no current version → `[fresh-install(target)]`
//! - `current >= target` → `[]`, or `[reinstall(current)]` when forced
//! - otherwise every boundary strictly between current and target becomes its
//!   own stage, and the final stage is always the target
//!
//! Version strings that are not semver (a single leading `v` is tolerated)
//! fail with [`UpgradeError::VersionParse`]; the resolver never guesses.
//!
//! # Example
//!
//! ```rust,no_run
//! use promup_cli::version::{BoundaryTable, VersionResolver};
//!
//! # fn example() -> anyhow::Result<()> {
//! let table = BoundaryTable::builtin();
//! let plan = VersionResolver::new(&table).resolve(Some("2.48.1"), "3.8.1", false)?;
//! assert_eq!(plan.stages().len(), 2);
//! # Ok(())
//! # }
//! ```

mod boundaries;

pub use boundaries::{Boundary, BoundaryTable};

use semver::Version;
use std::fmt;

use crate::core::UpgradeError;

/// Parse a release version, accepting an optional leading `v`.
pub fn parse_version(input: &str) -> Result<Version, UpgradeError> {
    let trimmed = input.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(bare).map_err(|e| UpgradeError::version_parse(input, &e))
}

/// What a stage does to the installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Nothing is installed yet.
    FreshInstall,
    /// Mandatory stop at a format boundary.
    Intermediate,
    /// The requested target.
    Final,
    /// Forced reinstall of the current version.
    Reinstall,
}

impl StageKind {
    fn label(self) -> &'static str {
        match self {
            Self::FreshInstall => "fresh-install",
            Self::Intermediate => "intermediate",
            Self::Final => "upgrade",
            Self::Reinstall => "reinstall",
        }
    }
}

/// One version hop of an [`UpgradePlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Stage identifier used in logs and the run journal.
    pub name: String,
    /// Role of the stage within the plan.
    pub kind: StageKind,
    /// Version installed by this stage.
    pub target: Version,
}

impl Stage {
    fn new(kind: StageKind, target: Version) -> Self {
        Self {
            name: format!("{}-{}", kind.label(), target),
            kind,
            target,
        }
    }

    /// Whether there is an existing installation to back up and migrate.
    pub fn has_previous_install(&self) -> bool {
        self.kind != StageKind::FreshInstall
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Ordered stages computed once per invocation.
///
/// There is no mutating API; a plan is replaced, never edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePlan {
    from: Option<Version>,
    target: Version,
    stages: Vec<Stage>,
}

impl UpgradePlan {
    /// Version installed when the plan was computed.
    pub fn from(&self) -> Option<&Version> {
        self.from.as_ref()
    }

    /// Requested target version.
    pub fn target(&self) -> &Version {
        &self.target
    }

    /// Stages in execution order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// `true` when there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Version the installation is at before `index` runs.
    pub fn version_before(&self, index: usize) -> Option<&Version> {
        if index == 0 {
            self.from.as_ref()
        } else {
            self.stages.get(index - 1).map(|stage| &stage.target)
        }
    }
}

/// Computes [`UpgradePlan`]s against a boundary table.
pub struct VersionResolver<'a> {
    table: &'a BoundaryTable,
}

impl<'a> VersionResolver<'a> {
    /// Create a resolver over `table`.
    pub fn new(table: &'a BoundaryTable) -> Self {
        Self {
            table,
        }
    }

    /// Resolve the plan from `current` (empty or `None` = fresh install) to
    /// `target`.
    pub fn resolve(
        &self,
        current: Option<&str>,
        target: &str,
        force: bool,
    ) -> Result<UpgradePlan, UpgradeError> {
        let target = parse_version(target)?;
        let current = match current.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(parse_version(raw)?),
            None => None,
        };
        Ok(self.resolve_versions(current, target, force))
    }

    /// Resolve the plan for already-parsed versions.
    pub fn resolve_versions(
        &self,
        current: Option<Version>,
        target: Version,
        force: bool,
    ) -> UpgradePlan {
        let stages = match &current {
            None => vec![Stage::new(StageKind::FreshInstall, target.clone())],
            Some(current) if *current >= target => {
                if force {
                    vec![Stage::new(StageKind::Reinstall, current.clone())]
                } else {
                    Vec::new()
                }
            }
            Some(current) => {
                let mut stages: Vec<Stage> = self
                    .table
                    .stops_between(current, &target)
                    .map(|via| Stage::new(StageKind::Intermediate, via.clone()))
                    .collect();
                stages.push(Stage::new(StageKind::Final, target.clone()));
                stages
            }
        };

        UpgradePlan {
            from: current,
            target,
            stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_parse_version_accepts_v_prefix() {
        assert_eq!(parse_version("v3.8.1").unwrap(), v("3.8.1"));
        assert_eq!(parse_version(" 2.55.1 ").unwrap(), v("2.55.1"));
    }

    #[test]
    fn test_parse_version_rejects_garbage() {
        for input in ["latest", "3.8", "3", "", "vv3.8.1", "3.8.1.4"] {
            let err = parse_version(input).unwrap_err();
            assert!(matches!(err, UpgradeError::VersionParse { .. }), "input {input:?}");
        }
    }

    #[test]
    fn test_two_stage_plan_through_boundary() {
        let table = BoundaryTable::builtin();
        let plan = VersionResolver::new(&table).resolve(Some("2.48.1"), "3.8.1", false).unwrap();

        let targets: Vec<_> = plan.stages().iter().map(|s| s.target.to_string()).collect();
        assert_eq!(targets, vec!["2.55.1", "3.8.1"]);
        assert_eq!(plan.stages()[0].kind, StageKind::Intermediate);
        assert_eq!(plan.stages()[1].kind, StageKind::Final);
        assert_eq!(plan.stages()[0].name, "intermediate-2.55.1");
        assert_eq!(plan.version_before(1), Some(&v("2.55.1")));
    }

    #[test]
    fn test_no_intermediate_when_already_past_boundary() {
        let table = BoundaryTable::builtin();
        let resolver = VersionResolver::new(&table);

        let plan = resolver.resolve(Some("2.55.1"), "3.8.1", false).unwrap();
        assert_eq!(plan.stages().len(), 1);

        let plan = resolver.resolve(Some("2.40.0"), "2.54.0", false).unwrap();
        assert_eq!(plan.stages().len(), 1);
        assert_eq!(plan.stages()[0].target, v("2.54.0"));
    }

    #[test]
    fn test_target_equal_to_boundary_is_single_stage() {
        let table = BoundaryTable::builtin();
        let plan = VersionResolver::new(&table).resolve(Some("2.48.1"), "2.55.1", false).unwrap();
        assert_eq!(plan.stages().len(), 1);
        assert_eq!(plan.stages()[0].kind, StageKind::Final);
    }

    #[test]
    fn test_fresh_install() {
        let table = BoundaryTable::builtin();
        let resolver = VersionResolver::new(&table);
        for current in [None, Some(""), Some("  ")] {
            let plan = resolver.resolve(current, "3.8.1", false).unwrap();
            assert_eq!(plan.stages().len(), 1);
            assert_eq!(plan.stages()[0].kind, StageKind::FreshInstall);
            assert!(!plan.stages()[0].has_previous_install());
        }
    }

    #[test]
    fn test_up_to_date_is_noop_unless_forced() {
        let table = BoundaryTable::builtin();
        let resolver = VersionResolver::new(&table);

        assert!(resolver.resolve(Some("3.8.1"), "3.8.1", false).unwrap().is_empty());
        assert!(resolver.resolve(Some("3.9.0"), "3.8.1", false).unwrap().is_empty());

        let plan = resolver.resolve(Some("3.9.0"), "3.8.1", true).unwrap();
        assert_eq!(plan.stages().len(), 1);
        assert_eq!(plan.stages()[0].kind, StageKind::Reinstall);
        assert_eq!(plan.stages()[0].target, v("3.9.0"));
    }

    #[test]
    fn test_malformed_current_is_rejected() {
        let table = BoundaryTable::builtin();
        let err = VersionResolver::new(&table).resolve(Some("two"), "3.8.1", false).unwrap_err();
        assert!(matches!(err, UpgradeError::VersionParse { .. }));
    }

    #[test]
    fn test_plans_are_strictly_increasing_and_end_at_target() {
        let table = BoundaryTable::new(vec![
            Boundary::new(v("1.9.0"), v("2.0.0"), "first"),
            Boundary::new(v("2.55.1"), v("3.0.0"), "second"),
            Boundary::new(v("3.5.0"), v("4.0.0"), "third"),
        ]);
        let resolver = VersionResolver::new(&table);
        let versions = [
            "1.0.0", "1.9.0", "1.9.1", "2.0.0", "2.48.1", "2.55.1", "2.60.0", "3.0.0", "3.5.0",
            "3.8.1", "4.0.0", "4.2.0",
        ];

        for current in versions {
            for target in versions {
                let plan = resolver.resolve(Some(current), target, false).unwrap();
                if v(current) >= v(target) {
                    assert!(plan.is_empty());
                    continue;
                }
                let stages = plan.stages();
                assert_eq!(stages.last().unwrap().target, v(target), "{current} -> {target}");
                assert!(stages[0].target > v(current));
                for pair in stages.windows(2) {
                    assert!(pair[0].target < pair[1].target, "{current} -> {target}");
                }
            }
        }
    }

    #[test]
    fn test_multiple_boundaries() {
        let table = BoundaryTable::new(vec![
            Boundary::new(v("3.5.0"), v("4.0.0"), "later"),
            Boundary::new(v("2.55.1"), v("3.0.0"), "earlier"),
        ]);
        let plan = VersionResolver::new(&table).resolve(Some("2.0.0"), "4.1.0", false).unwrap();
        let targets: Vec<_> = plan.stages().iter().map(|s| s.target.to_string()).collect();
        assert_eq!(targets, vec!["2.55.1", "3.5.0", "4.1.0"]);
    }
}
