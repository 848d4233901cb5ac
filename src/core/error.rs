//! Error handling for promup
//!
//! Two layers, mirroring how the rest of the crate reports failures:
//! 1. [`UpgradeError`] – strongly typed failures that callers match on to
//!    decide policy (abort, roll back, stop for an operator).
//! 2. [`ErrorContext`] – a user-facing wrapper adding details and an
//!    actionable suggestion, produced by [`user_friendly_error`].
//!
//! Components return `anyhow::Result` and raise an [`UpgradeError`] wherever
//! a failure belongs to the upgrade taxonomy, so the orchestrator and the CLI
//! can recover it with `downcast_ref`.
//!
//! # Propagation policy
//!
//! - Failures before a backup exists ([`UpgradeError::VersionParse`], lock
//!   contention, pre-flight checks) abort without any rollback; nothing was
//!   mutated.
//! - Every fatal failure after a backup exists triggers exactly one rollback.
//!   A successful rollback surfaces as [`UpgradeError::StageAborted`], a failed
//!   one as [`UpgradeError::RollbackFailed`], which is terminal.
//!
//! # Examples
//!
//! ```rust,no_run
//! use promup_cli::core::{UpgradeError, user_friendly_error};
//!
//! let err = anyhow::Error::from(UpgradeError::VersionParse {
//!     input: "latest".to_string(),
//!     reason: "unexpected character 'l'".to_string(),
//! });
//! user_friendly_error(err).display();
//! ```

use colored::Colorize;
use std::fmt;
use thiserror::Error;

/// The main error type for upgrade operations.
///
/// Each variant corresponds to one failure class of the staged upgrade.
/// Variants carry enough context (paths, versions, probe output) for an
/// operator to act without re-running with `--verbose`.
#[derive(Error, Debug, Clone)]
pub enum UpgradeError {
    /// A version string is not valid semver.
    ///
    /// Raised by plan resolution and version detection. There is no safe
    /// default, so the run aborts before any mutation.
    #[error("Cannot parse version '{input}': {reason}")]
    VersionParse {
        /// The rejected input
        input: String,
        /// Parser message
        reason: String,
    },

    /// A release artifact could not be downloaded or unpacked.
    #[error("Failed to download {url}: {reason}")]
    Download {
        /// Artifact URL
        url: String,
        /// Why the download failed
        reason: String,
    },

    /// The archive checksum differs from the release manifest entry.
    #[error("Checksum mismatch for {artifact}")]
    ChecksumMismatch {
        /// Archive file name as listed in the manifest
        artifact: String,
        /// Digest from the manifest
        expected: String,
        /// Digest computed locally
        actual: String,
    },

    /// The validator rejected the migrated configuration.
    #[error("Configuration validation failed for {path}")]
    ConfigValidation {
        /// Config file that failed validation
        path: String,
        /// Validator output
        output: String,
    },

    /// The service could not be confirmed stopped.
    #[error("Service '{unit}' did not stop: {reason}")]
    ServiceStop {
        /// Supervisor unit name
        unit: String,
        /// Last observed state
        reason: String,
    },

    /// The service did not become active after start.
    #[error("Service '{unit}' failed to start: {reason}")]
    ServiceStart {
        /// Supervisor unit name
        unit: String,
        /// Last observed state
        reason: String,
        /// Tail of the service log
        log_tail: Vec<String>,
    },

    /// Readiness/liveness probes never succeeded within the attempt budget.
    ///
    /// Distinct from [`UpgradeError::ServiceStart`]: the process may be up
    /// while the application is still replaying or converting data.
    #[error("Service did not become healthy after {attempts} attempts")]
    HealthTimeout {
        /// Attempts used
        attempts: u32,
        /// Last response seen from each probe
        last_responses: Vec<String>,
    },

    /// A backup could not be produced.
    #[error("Backup failed: {reason}")]
    BackupFailed {
        /// Why the backup failed
        reason: String,
    },

    /// Restoring a backup failed. Terminal; no further automatic action.
    #[error("Rollback failed for stage '{stage}': {reason}")]
    RollbackFailed {
        /// Stage whose failure triggered the rollback
        stage: String,
        /// Backup directory the operator should restore from
        backup: String,
        /// Why the rollback failed
        reason: String,
    },

    /// A stage failed and the previous installation was restored.
    #[error("Stage '{stage}' failed and was rolled back: {reason}")]
    StageAborted {
        /// The failed stage
        stage: String,
        /// Backup used for the rollback
        backup: Option<String>,
        /// Data directory the operator may restore manually
        data_path: Option<String>,
        /// Root cause
        reason: String,
    },

    /// Another upgrade holds the lock.
    #[error("Another upgrade is already in progress{}", .pid.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    UpgradeInProgress {
        /// PID recorded in the lock file, if readable
        pid: Option<u32>,
    },

    /// The operator interrupted the run between steps.
    #[error("Upgrade cancelled before stage '{stage}' mutated anything")]
    Cancelled {
        /// Stage that was about to run
        stage: String,
    },

    /// `--stage` pointed outside the resolved plan.
    #[error("Stage {requested} is out of range; the plan has {available} stage(s)")]
    InvalidStage {
        /// Requested stage number (1-based)
        requested: usize,
        /// Number of stages in the plan
        available: usize,
    },

    /// Operator configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Description of the configuration error
        message: String,
    },
}

impl UpgradeError {
    /// Build a [`UpgradeError::VersionParse`] from a semver failure.
    pub fn version_parse(input: &str, err: &semver::Error) -> Self {
        Self::VersionParse {
            input: input.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Error context wrapper that provides user-friendly error information
///
/// Carries the underlying [`UpgradeError`] plus optional details (yellow) and
/// suggestion (green) for terminal display.
#[derive(Debug)]
pub struct ErrorContext {
    /// The underlying error
    pub error: UpgradeError,
    /// Optional suggestion for resolving the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context without suggestion or details.
    #[must_use]
    pub const fn new(error: UpgradeError) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    /// Add a suggestion for resolving the error
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add additional details explaining the error
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Print the error to stderr with colours.
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.error);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Convert any error into a user-facing [`ErrorContext`].
///
/// Typed [`UpgradeError`]s anywhere in the chain get tailored suggestions;
/// everything else is wrapped as a generic configuration/IO failure with the
/// full `anyhow` chain as details.
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    // `downcast_ref` on the anyhow error also sees typed `.context(...)` layers,
    // which the std chain walk cannot.
    let typed = error
        .downcast_ref::<UpgradeError>()
        .or_else(|| error.chain().find_map(|e| e.downcast_ref::<UpgradeError>()));
    if let Some(upgrade_error) = typed {
        return create_error_context(upgrade_error.clone());
    }

    let permission_denied = error
        .downcast_ref::<std::io::Error>()
        .filter(|io_error| io_error.kind() == std::io::ErrorKind::PermissionDenied);
    if let Some(io_error) = permission_denied {
        return ErrorContext::new(UpgradeError::ConfigError {
            message: io_error.to_string(),
        })
        .with_suggestion("Run promup as root or as a user allowed to manage the service unit")
        .with_details("Installing binaries and unit files requires write access to system paths");
    }

    let chain: Vec<String> = error.chain().skip(1).map(ToString::to_string).collect();
    let context = ErrorContext::new(UpgradeError::ConfigError {
        message: error.to_string(),
    });
    if chain.is_empty() {
        context
    } else {
        context.with_details(chain.join(": "))
    }
}

fn create_error_context(error: UpgradeError) -> ErrorContext {
    match &error {
        UpgradeError::VersionParse { .. } => ErrorContext::new(error.clone())
            .with_suggestion("Use a full semantic version such as 3.8.1 (a leading 'v' is accepted)")
            .with_details("Nothing was changed; the run aborted before resolving a plan"),

        UpgradeError::Download { .. } => ErrorContext::new(error.clone())
            .with_suggestion("Check network access to the release mirror, or point [release].base_url at a local file:// mirror")
            .with_details("Temporary download artifacts were removed"),

        UpgradeError::ChecksumMismatch { expected, actual, .. } => {
            let details = format!("expected {expected}, got {actual}");
            ErrorContext::new(error)
                .with_suggestion("Do not install this archive. Re-download it or verify the mirror's integrity")
                .with_details(details)
        }

        UpgradeError::ConfigValidation { output, .. } => {
            let details = output.clone();
            ErrorContext::new(error)
                .with_suggestion("Run 'promup check <version>' and fix the reported flags or keys")
                .with_details(details)
        }

        UpgradeError::ServiceStop { unit, .. } => {
            let suggestion = format!("Inspect the process with 'systemctl status {unit}' before retrying");
            ErrorContext::new(error)
                .with_suggestion(suggestion)
                .with_details("Binaries and configuration are never replaced while the old process may still run")
        }

        UpgradeError::ServiceStart { log_tail, unit, .. } => {
            let details = log_tail.join("\n");
            let suggestion = format!("Check 'journalctl -u {unit}' for the full startup log");
            ErrorContext::new(error).with_suggestion(suggestion).with_details(details)
        }

        UpgradeError::HealthTimeout { last_responses, .. } => {
            let details = last_responses.join("\n");
            ErrorContext::new(error)
                .with_suggestion("The server may still be converting on-disk data; raise [health].max_attempts if this is expected")
                .with_details(details)
        }

        UpgradeError::BackupFailed { .. } => ErrorContext::new(error.clone())
            .with_suggestion("Free space under [backup].root or rerun with --method file")
            .with_details("No stage was started without a verified backup"),

        UpgradeError::RollbackFailed { backup, .. } => {
            let suggestion = format!("Manual intervention required: restore binary, config and unit from {backup}");
            ErrorContext::new(error)
                .with_suggestion(suggestion)
                .with_details("promup will not retry a failed rollback automatically")
        }

        UpgradeError::StageAborted { data_path, .. } => {
            let details = match data_path {
                Some(path) => format!(
                    "Binary, config and unit were restored. Data was not restored automatically; a copy is at {path}"
                ),
                None => "Binary, config and unit were restored".to_string(),
            };
            ErrorContext::new(error)
                .with_suggestion("Fix the cause above and rerun; 'promup rollback --restore-data' restores data if needed")
                .with_details(details)
        }

        UpgradeError::UpgradeInProgress { .. } => ErrorContext::new(error.clone())
            .with_suggestion("Wait for the running upgrade to finish; remove the lock file only if that process is gone"),

        UpgradeError::Cancelled { .. } => ErrorContext::new(error.clone())
            .with_details("The installation was left untouched"),

        UpgradeError::InvalidStage { .. } => ErrorContext::new(error.clone())
            .with_suggestion("Run 'promup plan <version>' to list the stages"),

        UpgradeError::ConfigError { .. } => ErrorContext::new(error.clone())
            .with_suggestion("Check the promup configuration file and command-line flags"),
    }
}
