//! Command-line flag migration inside a unit file's `ExecStart`.
//!
//! The command line is tokenised (quotes and `\` continuations respected),
//! rewritten token by token, and re-rendered in a canonical one-flag-per-line
//! form. Lines outside `ExecStart` are left untouched, and an `ExecStart`
//! whose tokens do not change is kept byte-for-byte, so `apply` is
//! idempotent.

use regex::Regex;
use semver::Version;
use std::collections::HashSet;
use std::iter::Peekable;
use std::sync::OnceLock;

use super::rules::{ConfigIssue, FeatureAction, FlagAction, IssueKind, IssueSource, RuleSet};

const EXEC_START: &str = "ExecStart=";
const ENABLE_FEATURE: &str = "enable-feature";

/// Render an `ExecStart=` line with one argument per continuation line.
pub fn render_exec_start(exe: &str, args: &[String]) -> String {
    let mut line = format!("{EXEC_START}{exe}");
    for arg in args {
        line.push_str(" \\\n  ");
        line.push_str(arg);
    }
    line
}

/// Applies flag and feature rules for one target version.
pub struct FlagRewriter<'a> {
    rules: &'a RuleSet,
    target: &'a Version,
}

/// One logical `ExecStart` assignment spanning `lines[start..end]`.
struct ExecStartBlock {
    start: usize,
    end: usize,
    tokens: Vec<String>,
}

impl<'a> FlagRewriter<'a> {
    /// Create a rewriter for `target`.
    pub fn new(rules: &'a RuleSet, target: &'a Version) -> Self {
        Self {
            rules,
            target,
        }
    }

    /// Report every flag or feature in `unit` that the target rejects.
    pub fn check(&self, unit: &str) -> Vec<ConfigIssue> {
        let lines: Vec<&str> = unit.split('\n').collect();
        let mut issues = Vec::new();

        for block in find_exec_starts(&lines) {
            let mut tokens = block.tokens.iter().skip(1).peekable();
            while let Some(token) = tokens.next() {
                let Some((name, inline)) = parse_flag(token) else {
                    continue;
                };

                if name == ENABLE_FEATURE {
                    let value = inline.or_else(|| take_value(&mut tokens)).unwrap_or_default();
                    for feature in split_features(&value) {
                        if let Some(rule) = self.rules.feature_rule(feature, self.target) {
                            let kind = match rule.action {
                                FeatureAction::Remove => IssueKind::Removed,
                                FeatureAction::Promote(_) => IssueKind::Renamed,
                            };
                            issues.push(flag_issue(
                                kind,
                                format!("--{ENABLE_FEATURE}={feature}"),
                                block.start,
                                rule.remediation,
                            ));
                        }
                    }
                    continue;
                }

                if let Some(rule) = self.rules.flag_rule(&name, self.target) {
                    if inline.is_none() && rule.takes_value {
                        take_value(&mut tokens);
                    }
                    let kind = match rule.action {
                        FlagAction::Remove => IssueKind::Removed,
                        FlagAction::Rename(_) => IssueKind::Renamed,
                    };
                    issues.push(flag_issue(kind, format!("--{name}"), block.start, rule.remediation));
                }
            }
        }

        issues
    }

    /// Rewrite `unit` so its flags are valid for the target.
    pub fn apply(&self, unit: &str) -> String {
        let lines: Vec<&str> = unit.split('\n').collect();
        let blocks = find_exec_starts(&lines);
        if blocks.is_empty() {
            return unit.to_string();
        }

        let mut output: Vec<String> = Vec::with_capacity(lines.len());
        let mut cursor = 0;
        for block in blocks {
            output.extend(lines[cursor..block.start].iter().map(|l| (*l).to_string()));
            let rewritten = self.rewrite_tokens(&block.tokens);
            if rewritten == block.tokens {
                output.extend(lines[block.start..block.end].iter().map(|l| (*l).to_string()));
            } else {
                output.push(render_exec_start(&rewritten[0], &rewritten[1..]));
            }
            cursor = block.end;
        }
        output.extend(lines[cursor..].iter().map(|l| (*l).to_string()));
        output.join("\n")
    }

    fn rewrite_tokens(&self, tokens: &[String]) -> Vec<String> {
        let present: HashSet<String> =
            tokens.iter().filter_map(|t| parse_flag(t).map(|(name, _)| name)).collect();

        let mut iter = tokens.iter().peekable();
        let mut output: Vec<String> = iter.next().cloned().into_iter().collect();
        let mut promoted: Vec<&'static str> = Vec::new();

        while let Some(token) = iter.next() {
            let Some((name, inline)) = parse_flag(token) else {
                output.push(token.clone());
                continue;
            };

            if name == ENABLE_FEATURE {
                let separate = if inline.is_none() { take_value(&mut iter) } else { None };
                let value = inline.or_else(|| separate.clone()).unwrap_or_default();
                let mut kept = Vec::new();
                let mut changed = false;
                for feature in split_features(&value) {
                    match self.rules.feature_rule(feature, self.target).map(|r| r.action) {
                        None => kept.push(feature),
                        Some(FeatureAction::Remove) => changed = true,
                        Some(FeatureAction::Promote(flag)) => {
                            changed = true;
                            promoted.push(flag);
                        }
                    }
                }
                // Untouched lists keep their original spelling.
                if !changed {
                    output.push(token.clone());
                    output.extend(separate);
                } else if !kept.is_empty() {
                    output.push(format!("--{ENABLE_FEATURE}={}", kept.join(",")));
                }
                continue;
            }

            let Some(rule) = self.rules.flag_rule(&name, self.target) else {
                output.push(token.clone());
                continue;
            };
            let value = if inline.is_some() {
                inline
            } else if rule.takes_value {
                take_value(&mut iter)
            } else {
                None
            };

            if let FlagAction::Rename(to) = rule.action {
                // An explicit new-style flag wins over the renamed old one.
                if !present.contains(to) {
                    output.push(match value {
                        Some(value) => format!("--{to}={value}"),
                        None => format!("--{to}"),
                    });
                }
            }
        }

        for flag in promoted {
            let rendered = format!("--{flag}");
            if !present.contains(flag) && !output.contains(&rendered) {
                output.push(rendered);
            }
        }

        output
    }
}

fn flag_issue(kind: IssueKind, identifier: String, line: usize, remediation: &str) -> ConfigIssue {
    ConfigIssue {
        kind,
        source: IssueSource::Flags,
        identifier,
        location: Some(format!("ExecStart (line {})", line + 1)),
        remediation: remediation.to_string(),
        auto_fix: true,
    }
}

fn flag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^--([A-Za-z0-9][A-Za-z0-9._-]*)(?:=(.*))?$")
            .unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

/// Split `--name[=value]` into its parts.
fn parse_flag(token: &str) -> Option<(String, Option<String>)> {
    let captures = flag_pattern().captures(token)?;
    Some((captures[1].to_string(), captures.get(2).map(|m| m.as_str().to_string())))
}

/// Consume the next token as a flag value unless it is itself a flag.
fn take_value<'t, I>(tokens: &mut Peekable<I>) -> Option<String>
where
    I: Iterator<Item = &'t String>,
{
    tokens.next_if(|t| !t.starts_with('-')).cloned()
}

fn split_features(value: &str) -> impl Iterator<Item = &str> {
    value.trim_matches(['"', '\'']).split(',').map(str::trim).filter(|f| !f.is_empty())
}

fn find_exec_starts(lines: &[&str]) -> Vec<ExecStartBlock> {
    let mut blocks = Vec::new();
    let mut index = 0;

    while index < lines.len() {
        let Some(value) = lines[index].trim_start().strip_prefix(EXEC_START) else {
            index += 1;
            continue;
        };

        let start = index;
        let mut command = String::new();
        let mut current = value;
        loop {
            let trimmed = current.trim_end();
            index += 1;
            match trimmed.strip_suffix('\\') {
                Some(continued) if index < lines.len() => {
                    command.push_str(continued);
                    command.push(' ');
                    current = lines[index];
                }
                Some(continued) => {
                    command.push_str(continued);
                    break;
                }
                None => {
                    command.push_str(trimmed);
                    break;
                }
            }
        }

        let tokens = tokenize(&command);
        // A bare `ExecStart=` resets the list in drop-ins; nothing to rewrite.
        if !tokens.is_empty() {
            blocks.push(ExecStartBlock {
                start,
                end: index,
                tokens,
            });
        }
    }

    blocks
}

/// Whitespace tokenisation that keeps quoted strings (quotes included) whole.
fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                current.push(c);
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY_UNIT: &str = "[Unit]\nDescription=Prometheus\n\n[Service]\nUser=prometheus\nExecStart=/usr/local/bin/prometheus \\\n    --config.file=/etc/prometheus/prometheus.yml \\\n    --storage.tsdb.path /var/lib/prometheus \\\n    --storage.tsdb.retention 30d \\\n    --storage.tsdb.allow-overlapping-blocks \\\n    --alertmanager.timeout=10s \\\n    --enable-feature=promql-at-modifier,remote-write-receiver,exemplar-storage \\\n    --web.enable-lifecycle\nRestart=on-failure\n\n[Install]\nWantedBy=multi-user.target\n";

    fn v3() -> Version {
        Version::new(3, 8, 1)
    }

    #[test]
    fn test_tokenize_keeps_quotes() {
        let tokens = tokenize(r#"/bin/prometheus --web.page-title="My Prom" --x"#);
        assert_eq!(tokens, vec!["/bin/prometheus", r#"--web.page-title="My Prom""#, "--x"]);
    }

    #[test]
    fn test_check_reports_each_incompatibility() {
        let rules = RuleSet::builtin().unwrap();
        let target = v3();
        let issues = FlagRewriter::new(&rules, &target).check(LEGACY_UNIT);

        let ids: Vec<_> = issues.iter().map(|i| i.identifier.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "--storage.tsdb.retention",
                "--storage.tsdb.allow-overlapping-blocks",
                "--alertmanager.timeout",
                "--enable-feature=promql-at-modifier",
                "--enable-feature=remote-write-receiver",
            ]
        );
        assert!(issues.iter().all(|i| i.source == IssueSource::Flags && i.auto_fix));
    }

    #[test]
    fn test_apply_rewrites_flags() {
        let rules = RuleSet::builtin().unwrap();
        let target = v3();
        let output = FlagRewriter::new(&rules, &target).apply(LEGACY_UNIT);

        let expected_exec = render_exec_start(
            "/usr/local/bin/prometheus",
            &[
                "--config.file=/etc/prometheus/prometheus.yml".to_string(),
                "--storage.tsdb.path".to_string(),
                "/var/lib/prometheus".to_string(),
                "--storage.tsdb.retention.time=30d".to_string(),
                "--enable-feature=exemplar-storage".to_string(),
                "--web.enable-lifecycle".to_string(),
                "--web.enable-remote-write-receiver".to_string(),
            ],
        );
        assert!(output.contains(&expected_exec), "got:\n{output}");
        assert!(output.starts_with("[Unit]\nDescription=Prometheus\n"));
        assert!(output.ends_with("Restart=on-failure\n\n[Install]\nWantedBy=multi-user.target\n"));
        assert!(FlagRewriter::new(&rules, &target).check(&output).is_empty());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let rules = RuleSet::builtin().unwrap();
        let target = v3();
        let rewriter = FlagRewriter::new(&rules, &target);

        let once = rewriter.apply(LEGACY_UNIT);
        let twice = rewriter.apply(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_apply_below_since_is_noop() {
        let rules = RuleSet::builtin().unwrap();
        let target = Version::new(2, 55, 1);
        assert_eq!(FlagRewriter::new(&rules, &target).apply(LEGACY_UNIT), LEGACY_UNIT);
    }

    #[test]
    fn test_explicit_new_flag_wins_and_empty_feature_dropped() {
        let rules = RuleSet::builtin().unwrap();
        let target = v3();
        let unit = "ExecStart=/bin/prometheus --storage.tsdb.retention=15d --storage.tsdb.retention.time=30d --enable-feature=agent --agent\n";
        let output = FlagRewriter::new(&rules, &target).apply(unit);

        assert_eq!(
            output,
            "ExecStart=/bin/prometheus \\\n  --storage.tsdb.retention.time=30d \\\n  --agent\n"
        );
    }

    #[test]
    fn test_untouched_feature_lists_keep_their_spelling() {
        let rules = RuleSet::builtin().unwrap();
        let units = [
            "ExecStart=/bin/prometheus --enable-feature exemplar-storage --web.enable-lifecycle\n",
            "ExecStart=/bin/prometheus --enable-feature=\"exemplar-storage,memory-snapshot-on-shutdown\"\n",
            "ExecStart=/bin/prometheus --enable-feature a, agent\n",
        ];
        for target in [Version::new(2, 55, 1), v3()] {
            let rewriter = FlagRewriter::new(&rules, &target);
            for unit in units {
                assert_eq!(rewriter.apply(unit), unit, "target {target}");
            }
        }
    }

    #[test]
    fn test_apply_is_idempotent_on_awkward_units() {
        let rules = RuleSet::builtin().unwrap();
        let target = v3();
        let rewriter = FlagRewriter::new(&rules, &target);
        let units = [
            // separate-token feature value
            "ExecStart=/bin/prometheus --enable-feature promql-at-modifier --storage.tsdb.retention 30d\n",
            // quoted feature value
            "ExecStart=/bin/prometheus --enable-feature=\"agent,exemplar-storage\" --web.enable-lifecycle\n",
            // CRLF line endings
            "[Service]\r\nExecStart=/bin/prometheus \\\r\n  --storage.tsdb.retention=15d \\\r\n  --web.enable-lifecycle\r\nRestart=always\r\n",
            // indented assignment
            "[Service]\n    ExecStart=/bin/prometheus --storage.tsdb.allow-overlapping-blocks\n",
            // continuation at end of file
            "ExecStart=/bin/prometheus --storage.tsdb.retention 7d \\",
            // several assignments
            "[Service]\nExecStart=\nExecStart=/bin/prometheus --alertmanager.timeout 10s --web.enable-lifecycle\nExecStartPost=/bin/true\n",
            "ExecStart=/bin/prometheus --storage.tsdb.retention=1d\nExecStart=/bin/prometheus --enable-feature=remote-write-receiver\n",
            // single-quoted tokens
            "ExecStart=/bin/prometheus '--web.page-title=My Prom' --storage.tsdb.retention='30d'\n",
        ];

        for unit in units {
            let once = rewriter.apply(unit);
            assert_eq!(rewriter.apply(&once), once, "input: {unit:?}");
            assert!(rewriter.check(&once).is_empty(), "issues left in {once:?}");
        }
    }

    #[test]
    fn test_reset_exec_start_is_left_alone() {
        let rules = RuleSet::builtin().unwrap();
        let target = v3();
        let unit = "[Service]\nExecStart=\nExecStart=/bin/prometheus --storage.tsdb.allow-overlapping-blocks\n";
        let output = FlagRewriter::new(&rules, &target).apply(unit);
        assert_eq!(output, "[Service]\nExecStart=\nExecStart=/bin/prometheus\n");
    }
}
