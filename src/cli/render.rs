//! Human-readable output for reports. The only place that prints to stdout.

use colored::Colorize;

use crate::backup::{Backup, BackupEstimate, BackupMethod};
use crate::migrate::{ConfigIssue, IssueKind};
use crate::upgrade::{DryRunReport, MigrationSummary, RunJournal, RunOutcome, UpgradeReport};
use crate::utils::human_bytes;
use crate::version::{Stage, UpgradePlan};

fn version_or_none(version: Option<&semver::Version>) -> String {
    version.map_or_else(|| "(not installed)".to_string(), ToString::to_string)
}

pub fn plan(plan: &UpgradePlan) {
    if plan.is_empty() {
        println!(
            "{} {} is already installed",
            "✓".green(),
            version_or_none(plan.from()).bold()
        );
        return;
    }
    println!(
        "Upgrade plan {} → {}",
        version_or_none(plan.from()).yellow(),
        plan.target().to_string().green()
    );
    stage_list(plan.stages(), 1);
}

fn stage_list(stages: &[Stage], first_number: usize) {
    for (offset, stage) in stages.iter().enumerate() {
        println!("  {}. {}", first_number + offset, stage.name.bold());
    }
}

pub fn issues(issues: &[ConfigIssue]) {
    if issues.is_empty() {
        println!("  {} no incompatibilities found", "✓".green());
        return;
    }
    for issue in issues {
        let marker = match (issue.kind, issue.auto_fix) {
            (IssueKind::ChangedDefault, _) => "info".cyan(),
            (_, true) => "fix".green(),
            (_, false) => "todo".yellow(),
        };
        let location = issue.location.as_deref().map(|l| format!(" ({l})")).unwrap_or_default();
        println!("  [{marker}] {} {}{location}", issue.kind, issue.identifier.bold());
        println!("         {}", issue.remediation.dimmed());
    }
}

fn migration(summary: &MigrationSummary, prefix: &str) {
    if summary.unit_generated {
        println!("  {prefix} generate the service unit");
    } else if summary.unit_rewritten {
        println!("  {prefix} rewrite service unit flags");
    }
    if summary.config_created {
        println!("  {prefix} write a minimal configuration");
    }
    for change in &summary.config_changes {
        println!("  {prefix} {change}");
    }
}

fn estimate(estimate: &BackupEstimate) {
    let method = match (estimate.method, estimate.may_fall_back) {
        (BackupMethod::Snapshot, true) => "snapshot (falls back to file copy)".to_string(),
        (method, _) => method.to_string(),
    };
    println!(
        "  would back up {} in {} file(s) via {method}",
        human_bytes(estimate.data.bytes),
        estimate.data.files
    );
    if estimate.stops_service {
        println!("  would stop the service for the copy");
    }
    if !estimate.consistent {
        println!("  {} the data copy would not be crash-consistent", "!".yellow());
    }
}

pub fn dry_run(report: &DryRunReport) {
    println!(
        "{} {} → {}",
        "Dry run:".cyan().bold(),
        version_or_none(report.from.as_ref()),
        report.target
    );
    for (index, preview) in report.stages.iter().enumerate() {
        println!();
        println!("{}. {}", index + 1, preview.stage.name.bold());
        issues(&preview.issues);
        match &preview.backup {
            Some(backup) => estimate(backup),
            None if preview.stage.has_previous_install() => {
                println!("  {} no backup, this stage cannot be rolled back", "!".yellow());
            }
            None => {}
        }
        migration(&preview.migration, "would");
        println!("  would install {}", preview.artifact.archive_url);
        println!("  would restart the service and verify health");
    }
    if !report.remaining.is_empty() {
        println!();
        println!("Not selected (run again to continue):");
        stage_list(&report.remaining, report.stages.len() + 1);
    }
    println!();
    println!("Backups older than {} day(s) would be pruned", report.retention_days);
}

pub fn upgrade(report: &UpgradeReport) {
    for stage in &report.stages {
        println!("{} {}", "✓".green(), stage.stage.name.bold());
        if let Some(backup) = &stage.backup {
            println!("  backup {} ({})", backup.id, human_bytes(backup.size_bytes));
        }
        migration(&stage.migration, "did");
        println!(
            "  healthy after {} attempt(s), running {}",
            stage.health.attempts_used, stage.installed.version
        );
    }

    let installed = report
        .stages
        .last()
        .map_or_else(|| report.target.to_string(), |s| s.installed.version.to_string());
    if report.remaining.is_empty() {
        println!("{} upgraded to {}", "Done:".green().bold(), installed.bold());
    } else {
        println!(
            "{} now at {}; {} stage(s) left towards {}:",
            "Paused:".yellow().bold(),
            installed.bold(),
            report.remaining.len(),
            report.target
        );
        stage_list(&report.remaining, report.stages.len() + 1);
    }
    if !report.pruned.is_empty() {
        println!("Pruned {} old backup(s): {}", report.pruned.len(), report.pruned.join(", "));
    }
}

pub fn backups(backups: &[Backup]) {
    if backups.is_empty() {
        println!("No backups");
        return;
    }
    for backup in backups {
        let consistency = if backup.consistent {
            "consistent".green()
        } else {
            "inconsistent".yellow()
        };
        println!(
            "{}  {}  {:<22} {:<8} {:>10}  {consistency}",
            backup.id.bold(),
            backup.created_at.format("%Y-%m-%d %H:%M:%S"),
            backup.stage,
            backup.method.to_string(),
            human_bytes(backup.size_bytes),
        );
    }
}

pub fn journal(journal: &RunJournal) {
    let outcome = match journal.outcome {
        RunOutcome::Running => "running or interrupted".yellow(),
        RunOutcome::Succeeded => "succeeded".green(),
        RunOutcome::Failed => "failed".red(),
    };
    println!(
        "Last run:  {} → {} started {} (pid {}), {outcome}",
        journal.from.as_deref().unwrap_or("(none)"),
        journal.target,
        journal.started_at.format("%Y-%m-%d %H:%M:%S"),
        journal.pid
    );
    if let Some(entry) = journal.entries.last() {
        println!("           last state {} in {}", entry.state.to_string().bold(), entry.stage);
    }
    if let Some(error) = &journal.error {
        println!("           {}", error.red());
    }
}
