//! Server configuration file migration.
//!
//! Detection walks the parsed YAML document. Rewrites are applied to the
//! original text line by line so comments and formatting survive, and the
//! result is re-parsed before it is accepted.

use anyhow::{Context, Result, bail};
use regex::Regex;
use semver::Version;
use serde_yaml::Value;
use std::sync::OnceLock;

use super::rules::{ConfigIssue, ConfigKeyRule, IssueKind, IssueSource, KeyAction, RuleSet};

/// Result of a dry-applied configuration rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRewrite {
    /// Rewritten document (equal to the input when nothing changed).
    pub text: String,
    /// Human-readable description of each change.
    pub changes: Vec<String>,
}

impl ConfigRewrite {
    /// Whether anything was rewritten.
    pub fn is_changed(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Applies config-key rules for one target version.
pub struct ConfigFileMigrator<'a> {
    rules: &'a RuleSet,
    target: &'a Version,
}

impl<'a> ConfigFileMigrator<'a> {
    /// Create a migrator for `target`.
    pub fn new(rules: &'a RuleSet, target: &'a Version) -> Self {
        Self {
            rules,
            target,
        }
    }

    /// Report keys the target renamed or removed.
    pub fn check(&self, text: &str) -> Result<Vec<ConfigIssue>> {
        let document = parse(text)?;
        let mut issues = Vec::new();
        let mut path = Vec::new();
        self.walk(&document, &mut path, &mut |rule, location| {
            issues.push(ConfigIssue {
                kind: match rule.action {
                    KeyAction::Rename(_) => IssueKind::Renamed,
                    KeyAction::Report(kind) => kind,
                },
                source: IssueSource::ConfigFile,
                identifier: rule.key.to_string(),
                location: Some(location),
                remediation: rule.remediation.to_string(),
                auto_fix: matches!(rule.action, KeyAction::Rename(_)),
            });
        });
        Ok(issues)
    }

    /// Rewrite renamed keys in memory.
    ///
    /// Fails without producing output when the text cannot be rewritten
    /// unambiguously or the result does not parse.
    pub fn dry_apply(&self, text: &str) -> Result<ConfigRewrite> {
        let document = parse(text)?;

        let renames: Vec<(&'static str, &'static str)> = self
            .rules
            .config_key_rules(self.target)
            .filter_map(|rule| match rule.action {
                KeyAction::Rename(to) => Some((rule.key, to)),
                KeyAction::Report(_) => None,
            })
            .collect();

        let mut expected: usize = 0;
        let mut path = Vec::new();
        self.walk(&document, &mut path, &mut |rule, _| {
            if matches!(rule.action, KeyAction::Rename(_)) {
                expected += 1;
            }
        });
        if expected == 0 {
            return Ok(ConfigRewrite {
                text: text.to_string(),
                changes: Vec::new(),
            });
        }

        let mut changes = Vec::new();
        let lines: Vec<String> = text
            .split('\n')
            .enumerate()
            .map(|(number, line)| {
                let Some(captures) = key_line_pattern().captures(line) else {
                    return line.to_string();
                };
                match renames.iter().find(|(from, _)| *from == &captures[2]) {
                    Some((from, to)) => {
                        changes.push(format!("line {}: {from} -> {to}", number + 1));
                        format!("{}{to}{}", &captures[1], &captures[3])
                    }
                    None => line.to_string(),
                }
            })
            .collect();

        if changes.len() != expected {
            bail!(
                "found {} candidate line(s) for {expected} key(s) to rename; refusing to rewrite ambiguously",
                changes.len()
            );
        }

        let rewritten = lines.join("\n");
        parse(&rewritten).context("Rewritten configuration no longer parses")?;
        Ok(ConfigRewrite {
            text: rewritten,
            changes,
        })
    }

    /// Patterns listed under `rule_files`.
    pub fn rule_file_patterns(text: &str) -> Result<Vec<String>> {
        let document = parse(text)?;
        Ok(document
            .get("rule_files")
            .and_then(Value::as_sequence)
            .map(|entries| entries.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default())
    }

    fn walk(
        &self,
        value: &Value,
        path: &mut Vec<String>,
        visit: &mut dyn FnMut(&ConfigKeyRule, String),
    ) {
        match value {
            Value::Mapping(mapping) => {
                for (key, child) in mapping {
                    let Some(key) = key.as_str() else {
                        continue;
                    };
                    path.push(key.to_string());
                    for rule in self.rules.config_key_rules(self.target) {
                        let value_matches =
                            rule.value.is_none_or(|expected| child.as_str() == Some(expected));
                        if rule.key == key && value_matches {
                            visit(rule, path.join("."));
                        }
                    }
                    self.walk(child, path, visit);
                    path.pop();
                }
            }
            Value::Sequence(items) => {
                for (index, item) in items.iter().enumerate() {
                    path.push(format!("[{index}]"));
                    self.walk(item, path, visit);
                    path.pop();
                }
            }
            _ => {}
        }
    }
}

fn parse(text: &str) -> Result<Value> {
    serde_yaml::from_str(text).context("Configuration is not valid YAML")
}

fn key_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\s*(?:-\s+)?)([A-Za-z_][A-Za-z0-9_]*)(\s*:.*)$")
            .unwrap_or_else(|_| unreachable!("static pattern"))
    })
}
