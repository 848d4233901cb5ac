use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::constants::VALIDATOR_BINARY_NAME;

/// Outcome of running the external config validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    /// Whether the configuration was accepted (or validation was skipped).
    pub valid: bool,
    /// `true` when no validator was available.
    pub skipped: bool,
    /// Combined validator output.
    pub output: String,
}

/// Wraps `promtool check config`.
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    tool: Option<PathBuf>,
}

impl ConfigValidator {
    /// Prefer the validator installed next to the server binary, then `PATH`.
    ///
    /// The bundled one matches the installed server version, which matters
    /// right after an upgrade.
    pub fn locate(binary_dir: &Path) -> Self {
        let bundled = binary_dir.join(VALIDATOR_BINARY_NAME);
        let tool = if bundled.is_file() {
            Some(bundled)
        } else {
            which::which(VALIDATOR_BINARY_NAME).ok()
        };
        debug!(tool = ?tool, "Located config validator");
        Self {
            tool,
        }
    }

    /// Use a specific validator binary.
    pub fn with_tool(tool: Option<PathBuf>) -> Self {
        Self {
            tool,
        }
    }

    /// Validator path, if one was found.
    pub fn tool(&self) -> Option<&Path> {
        self.tool.as_deref()
    }

    /// Validate `config_path`. Without a validator this succeeds with a
    /// warning.
    pub async fn validate(&self, config_path: &Path) -> Result<ValidationReport> {
        let Some(tool) = &self.tool else {
            warn!("{VALIDATOR_BINARY_NAME} not found; skipping configuration validation");
            return Ok(ValidationReport {
                valid: true,
                skipped: true,
                output: String::new(),
            });
        };

        let output = Command::new(tool)
            .arg("check")
            .arg("config")
            .arg(config_path)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", tool.display()))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ValidationReport {
            valid: output.status.success(),
            skipped: false,
            output: text.trim().to_string(),
        })
    }
}
