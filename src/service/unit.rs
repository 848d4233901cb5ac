//! Generated supervisor units for fresh installs.
//!
//! Existing units are never regenerated; they are migrated in place by
//! [`crate::migrate`]. A unit is only rendered here when nothing is installed
//! yet, and the flag set is chosen from the major version being installed so
//! the first start does not trip over flags the release no longer accepts.

use anyhow::{Context, Result};
use semver::Version;
use serde::Serialize;
use std::path::PathBuf;
use tera::{Context as TeraContext, Tera};

use crate::config::ServiceConfig;
use crate::migrate::flags::render_exec_start;

const UNIT_TEMPLATE: &str = r#"[Unit]
Description={{ description }}
Documentation=https://prometheus.io/docs/introduction/overview/
Wants=network-online.target
After=network-online.target

[Service]
Type=simple
User={{ user }}
Group={{ group }}
ExecReload=/bin/kill -HUP $MAINPID
{{ exec_start }}
TimeoutStopSec=20s
SendSIGKILL=no
Restart=on-failure
LimitNOFILE=65536

[Install]
WantedBy=multi-user.target
"#;

/// Inputs for a generated unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitSpec {
    /// `Description=` line.
    pub description: String,
    /// Service account.
    pub user: String,
    /// Service group.
    pub group: String,
    /// Executable path.
    pub exec: PathBuf,
    /// Command-line flags, one per element.
    pub flags: Vec<String>,
}

impl UnitSpec {
    /// Unit contents appropriate for `version`.
    pub fn for_version(version: &Version, service: &ServiceConfig) -> Self {
        let flags = if version.major >= 3 {
            flags_v3(service)
        } else {
            flags_v2(service)
        };
        Self {
            description: format!("Prometheus {version}"),
            user: service.user.clone(),
            group: service.group.clone(),
            exec: service.binary_path.clone(),
            flags,
        }
    }

    /// Render the unit file.
    pub fn render(&self) -> Result<String> {
        let mut context = TeraContext::new();
        context.insert("description", &self.description);
        context.insert("user", &self.user);
        context.insert("group", &self.group);
        context.insert(
            "exec_start",
            &render_exec_start(&self.exec.to_string_lossy(), &self.flags),
        );
        Tera::one_off(UNIT_TEMPLATE, &context, false).context("Failed to render unit template")
    }
}

fn common_flags(service: &ServiceConfig) -> Vec<String> {
    vec![
        format!("--config.file={}", service.config_path.display()),
        format!("--storage.tsdb.path={}", service.data_path.display()),
        format!("--storage.tsdb.retention.time={}", service.retention_time),
        format!("--web.listen-address={}", service.listen_address),
        "--web.enable-lifecycle".to_string(),
        "--web.enable-admin-api".to_string(),
    ]
}

fn flags_v2(service: &ServiceConfig) -> Vec<String> {
    let mut flags = common_flags(service);
    // 2.x still ships the classic console templates.
    flags.push("--web.console.templates=/etc/prometheus/consoles".to_string());
    flags.push("--web.console.libraries=/etc/prometheus/console_libraries".to_string());
    flags
}

fn flags_v3(service: &ServiceConfig) -> Vec<String> {
    common_flags(service)
}
