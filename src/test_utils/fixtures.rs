//! On-disk fixtures: fake server binaries, release archives, TSDB data and a
//! complete installation in a temporary directory.

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use semver::Version;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::TempDir;

use crate::config::{
    BackupConfig, BackupMethodPreference, HealthConfig, ReleaseConfig, ServiceConfig, TimeoutConfig,
    UpgradeConfig,
};
use crate::constants::{CHECKSUM_MANIFEST_NAME, SERVER_BINARY_NAME, VALIDATOR_BINARY_NAME};
use crate::service::InstalledService;
use crate::utils::fs::set_mode;
use crate::version::parse_version;

/// Block id used by every fixture block.
pub const FIXTURE_BLOCK: &str = "01HQ8Z7JY3Q6W4V0N8T5R2M1KX";

/// Marker that makes the fake validator reject a configuration.
pub const INVALID_CONFIG_MARKER: &str = "promup-test-invalid";

const OS: &str = "linux";
const ARCH: &str = "amd64";

fn server_script(version: &Version) -> String {
    format!(
        "#!/bin/sh\necho \"prometheus, version {version} (branch: HEAD, revision: test)\"\necho \"  build user: promup@test\"\n"
    )
}

fn validator_script() -> String {
    format!(
        r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "promtool, version test"
  exit 0
fi
file="$3"
echo "Checking $file"
if grep -q "{INVALID_CONFIG_MARKER}" "$file"; then
  echo "  FAILED: parsing YAML file $file: invalid configuration"
  exit 1
fi
echo "  SUCCESS: $file is valid prometheus config file syntax"
"#
    )
}

fn write_executable(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    set_mode(path, 0o755)
}

/// Shell script that answers `--version` like a real server.
pub fn write_fake_server(path: &Path, version: &Version) -> Result<()> {
    write_executable(path, &server_script(version))
}

/// Shell script that behaves like `promtool check config`, failing on files
/// containing [`INVALID_CONFIG_MARKER`].
pub fn write_fake_validator(path: &Path) -> Result<()> {
    write_executable(path, &validator_script())
}

/// Release archive with `prometheus-<v>.<os>-<arch>/{prometheus,promtool}`.
pub fn write_release_archive(path: &Path, version: &Version, os: &str, arch: &str) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    let prefix = format!("{SERVER_BINARY_NAME}-{version}.{os}-{arch}");

    for (name, content) in [
        (SERVER_BINARY_NAME, server_script(version)),
        (VALIDATOR_BINARY_NAME, validator_script()),
        ("LICENSE", "Apache License 2.0\n".to_string()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(if name == "LICENSE" { 0o644 } else { 0o755 });
        header.set_cksum();
        builder.append_data(&mut header, format!("{prefix}/{name}"), content.as_bytes())?;
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

/// One complete TSDB block (`meta.json`, `index`, `chunks/`) below `dir`.
pub fn write_block(dir: &Path) -> Result<PathBuf> {
    let block = dir.join(FIXTURE_BLOCK);
    fs::create_dir_all(block.join("chunks"))?;
    fs::write(
        block.join("meta.json"),
        format!(
            r#"{{"ulid":"{FIXTURE_BLOCK}","minTime":1700000000000,"maxTime":1700007200000,"stats":{{"numSamples":1200}},"compaction":{{"level":1}},"version":1}}"#
        ),
    )?;
    fs::write(block.join("index"), b"\xBA\xAA\xD7\x00index")?;
    fs::write(block.join("chunks").join("000001"), b"\x85\xBD\x40\xDDchunks")?;
    Ok(block)
}

const FIXTURE_CONFIG: &str = "global:
  scrape_interval: 15s

rule_files:
  - rules/*.yml

scrape_configs:
  - job_name: prometheus
    scrape_classic_histograms: true
    static_configs:
      - targets: ['localhost:9090']
";

const FIXTURE_RULES: &str = "groups:
  - name: latency
    rules:
      - record: job:latency:smoothed
        expr: holt_winters(job:latency:avg[10m], 0.3, 0.3)
";

/// A complete installation in a temporary directory.
///
/// Layout: `bin/prometheus`, `bin/promtool`, `etc/prometheus.yml` (+ a rule
/// file), `systemd/prometheus.service`, `data/` with one block, a WAL and a
/// lock file, plus `mirror/`, `backups/` and `state/`.
pub struct TestInstallation {
    _temp: TempDir,
    root: PathBuf,
}

impl TestInstallation {
    /// Installation of `version`.
    pub fn new(version: &str) -> Result<Self> {
        let install = Self::empty()?;
        let version = parse_version(version)?;
        let service = install.service();

        write_fake_server(&service.binary_path, &version)?;
        write_fake_validator(&service.validator_path())?;

        let etc = service.config_path.parent().context("config path has no parent")?;
        fs::create_dir_all(etc.join("rules"))?;
        fs::write(&service.config_path, FIXTURE_CONFIG)?;
        fs::write(etc.join("rules").join("recording.yml"), FIXTURE_RULES)?;

        let unit = format!(
            "[Unit]\nDescription=Prometheus\n\n[Service]\nUser=prometheus\nExecStart={} \\\n  --config.file={} \\\n  --storage.tsdb.path={} \\\n  --storage.tsdb.retention=15d \\\n  --web.enable-admin-api\nRestart=on-failure\n\n[Install]\nWantedBy=multi-user.target\n",
            service.binary_path.display(),
            service.config_path.display(),
            service.data_path.display(),
        );
        if let Some(parent) = service.unit_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&service.unit_path, unit)?;

        write_block(&service.data_path)?;
        fs::create_dir_all(service.data_path.join("wal"))?;
        fs::write(service.data_path.join("wal").join("00000000"), b"wal-segment")?;
        fs::write(service.data_path.join("lock"), b"")?;

        Ok(install)
    }

    /// Nothing installed yet: only the mirror, backup and state directories.
    pub fn empty() -> Result<Self> {
        let temp = TempDir::new()?;
        let root = temp.path().to_path_buf();
        for dir in ["mirror", "backups", "state"] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            _temp: temp,
            root,
        })
    }

    /// Root of the temporary directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Configuration pointing every path into this installation, with a
    /// `file://` mirror and timeouts short enough for tests.
    pub fn config(&self) -> UpgradeConfig {
        UpgradeConfig {
            state_dir: self.root.join("state"),
            service: ServiceConfig {
                binary_path: self.root.join("bin").join(SERVER_BINARY_NAME),
                config_path: self.root.join("etc").join("prometheus.yml"),
                data_path: self.root.join("data"),
                unit_path: self.root.join("systemd").join("prometheus.service"),
                listen_address: "127.0.0.1:9090".to_string(),
                ..ServiceConfig::default()
            },
            release: ReleaseConfig {
                base_url: format!("file://{}", self.root.join("mirror").display()),
                os: OS.to_string(),
                arch: ARCH.to_string(),
                ..ReleaseConfig::default()
            },
            backup: BackupConfig {
                root: self.backup_root(),
                retention_days: 30,
                method: BackupMethodPreference::Auto,
                stop_for_copy: true,
            },
            health: HealthConfig {
                max_attempts: 3,
                interval_secs: 0,
                query_probe: true,
                request_timeout_secs: 1,
            },
            timeouts: TimeoutConfig {
                stop_timeout_secs: 1,
                kill_timeout_secs: 1,
                start_attempts: 3,
                start_interval_secs: 0,
                lock_timeout_secs: 1,
                poll_interval_ms: 1,
            },
        }
    }

    /// Write [`config`](Self::config) as TOML and return its path.
    pub fn write_config_file(&self) -> Result<PathBuf> {
        let path = self.root.join("promup.toml");
        fs::write(&path, toml::to_string(&self.config())?)?;
        Ok(path)
    }

    /// Installed service described by [`config`](Self::config).
    pub fn service(&self) -> InstalledService {
        InstalledService::from_config(&self.config().service)
    }

    /// Backup root.
    pub fn backup_root(&self) -> PathBuf {
        self.root.join("backups")
    }

    /// Publish `version` on the mirror: archive plus checksum manifest.
    pub fn publish_release(&self, version: &str) -> Result<()> {
        let version = parse_version(version)?;
        let dir = self.release_dir(&version);
        fs::create_dir_all(&dir)?;

        let name = archive_name(&version);
        let archive = dir.join(&name);
        write_release_archive(&archive, &version, OS, ARCH)?;
        let digest = hex::encode(Sha256::digest(fs::read(&archive)?));
        fs::write(dir.join(CHECKSUM_MANIFEST_NAME), format!("{digest}  {name}\n"))?;
        Ok(())
    }

    /// Replace the manifest entry of `version` with a wrong digest.
    pub fn corrupt_checksum(&self, version: &str) -> Result<()> {
        let version = parse_version(version)?;
        let manifest = self.release_dir(&version).join(CHECKSUM_MANIFEST_NAME);
        fs::write(&manifest, format!("{}  {}\n", "0".repeat(64), archive_name(&version)))?;
        Ok(())
    }

    fn release_dir(&self, version: &Version) -> PathBuf {
        self.root.join("mirror").join(format!("v{version}"))
    }

    fn tracked_files(&self) -> Vec<PathBuf> {
        let service = self.service();
        vec![service.binary_path.clone(), service.validator_path(), service.config_path, service.unit_path]
    }

    /// Contents of binary, validator, config and unit.
    pub fn snapshot_files(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        self.tracked_files()
            .into_iter()
            .filter_map(|path| fs::read(&path).ok().map(|bytes| (path, bytes)))
            .collect()
    }

    /// Modification times of binary, validator, config and unit.
    pub fn mtimes(&self) -> BTreeMap<PathBuf, SystemTime> {
        self.tracked_files()
            .into_iter()
            .filter_map(|path| {
                fs::metadata(&path).and_then(|m| m.modified()).ok().map(|time| (path, time))
            })
            .collect()
    }
}

fn archive_name(version: &Version) -> String {
    format!("{SERVER_BINARY_NAME}-{version}.{OS}-{ARCH}.tar.gz")
}
