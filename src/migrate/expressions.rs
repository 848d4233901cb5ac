use semver::Version;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::rules::{ConfigIssue, IssueSource, RuleSet};

/// Expand `rule_files` patterns relative to the config file's directory.
pub fn resolve_rule_files(config_path: &Path, patterns: &[String]) -> Vec<PathBuf> {
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    let mut files = Vec::new();

    for pattern in patterns {
        let absolute = if Path::new(pattern).is_absolute() {
            PathBuf::from(pattern)
        } else {
            base.join(pattern)
        };
        let absolute = absolute.to_string_lossy().into_owned();
        match glob::glob(&absolute) {
            Ok(paths) => files.extend(paths.filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Skipping unreadable rule file: {e}");
                    None
                }
            })),
            Err(e) => warn!(pattern = %absolute, "Invalid rule_files pattern: {e}"),
        }
    }

    files.sort();
    files.dedup();
    files
}

/// Scan rule-file text for expressions whose meaning changed in `target`.
pub fn scan_expressions(
    rules: &RuleSet,
    target: &Version,
    file: &Path,
    content: &str,
) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();
    for (number, line) in content.lines().enumerate() {
        for rule in rules.expression_rules(target) {
            if let Some(found) = rule.pattern.find(line) {
                issues.push(ConfigIssue {
                    kind: rule.kind,
                    source: IssueSource::RuleFile,
                    identifier: found.as_str().trim().to_string(),
                    location: Some(format!("{}:{}", file.display(), number + 1)),
                    remediation: rule.remediation.to_string(),
                    auto_fix: false,
                });
            }
        }
    }
    issues
}

/// Read and scan every file in `files`. Files that cannot be read as text
/// are skipped with a warning.
pub async fn scan_rule_files(rules: &RuleSet, target: &Version, files: &[PathBuf]) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();
    for file in files {
        match tokio::fs::read_to_string(file).await {
            Ok(content) => issues.extend(scan_expressions(rules, target, file, &content)),
            Err(e) => warn!(file = %file.display(), "Skipping rule file: {e}"),
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::rules::IssueKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_scan_rule_files_from_globs() {
        let temp = TempDir::new().unwrap();
        let rules_dir = temp.path().join("rules");
        std::fs::create_dir_all(&rules_dir).unwrap();
        std::fs::write(
            rules_dir.join("forecast.yml"),
            "groups:\n  - name: forecast\n    rules:\n      - record: job:smoothed\n        expr: holt_winters(up[1h], 0.3, 0.3)\n",
        )
        .unwrap();
        std::fs::write(
            rules_dir.join("latency.yml"),
            "groups:\n  - name: latency\n    rules:\n      - alert: Slow\n        expr: rate(http_bucket{le=\"1\"}[5m]) > 0\n",
        )
        .unwrap();
        std::fs::write(rules_dir.join("ignored.txt"), "holt_winters(").unwrap();

        let config_path = temp.path().join("prometheus.yml");
        let files = resolve_rule_files(&config_path, &["rules/*.yml".to_string()]);
        assert_eq!(files.len(), 2);

        let rules = RuleSet::builtin().unwrap();
        let issues = scan_rule_files(&rules, &Version::new(3, 8, 1), &files).await;
        assert_eq!(issues.len(), 2);

        let holt = issues.iter().find(|i| i.kind == IssueKind::Renamed).unwrap();
        assert!(holt.location.as_ref().unwrap().ends_with("forecast.yml:5"));
        assert_eq!(holt.identifier, "holt_winters(");

        let le = issues.iter().find(|i| i.kind == IssueKind::ChangedDefault).unwrap();
        assert_eq!(le.identifier, "le=\"1\"");
    }

    #[tokio::test]
    async fn test_unreadable_matches_are_skipped() {
        let temp = TempDir::new().unwrap();
        let rules_dir = temp.path().join("rules");
        std::fs::create_dir_all(rules_dir.join("archive.yml")).unwrap();
        std::fs::write(rules_dir.join("binary.yml"), [0xff, 0xfe, 0x00, 0x9f]).unwrap();
        std::fs::write(rules_dir.join("forecast.yml"), "expr: holt_winters(up[1h], 0.3, 0.3)\n").unwrap();

        let files = resolve_rule_files(&temp.path().join("prometheus.yml"), &["rules/*.yml".to_string()]);
        assert_eq!(files.len(), 3);

        let rules = RuleSet::builtin().unwrap();
        let issues = scan_rule_files(&rules, &Version::new(3, 8, 1), &files).await;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].identifier, "holt_winters(");
    }

    #[test]
    fn test_no_issues_for_v2_target() {
        let rules = RuleSet::builtin().unwrap();
        let issues = scan_expressions(
            &rules,
            &Version::new(2, 55, 1),
            Path::new("rules.yml"),
            "expr: holt_winters(x[5m], 0.1, 0.1)",
        );
        assert!(issues.is_empty());
    }
}
