//! In-memory stand-ins for systemd, the health endpoints and the snapshot API.

use anyhow::Result;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use super::fixtures::write_block;
use crate::backup::{SnapshotApi, SnapshotOutcome};
use crate::health::{HealthProbe, ProbeResponse};
use crate::service::Supervisor;

const FAKE_PID: u32 = 4242;

#[derive(Debug, Default)]
struct UnitState {
    active: bool,
    pid: Option<u32>,
}

/// Supervisor that tracks one unit in memory and records mutating calls.
#[derive(Debug, Default)]
pub struct FakeSupervisor {
    state: Mutex<UnitState>,
    calls: Mutex<Vec<String>>,
    ignore_stop: bool,
    ignore_kill: bool,
    fail_start: bool,
    fail_status: bool,
}

impl FakeSupervisor {
    /// Unit active with a main PID.
    pub fn running() -> Self {
        Self {
            state: Mutex::new(UnitState {
                active: true,
                pid: Some(FAKE_PID),
            }),
            ..Self::default()
        }
    }

    /// Unit inactive.
    pub fn stopped() -> Self {
        Self::default()
    }

    /// `stop` is accepted but the process keeps running.
    pub fn ignoring_stop(mut self) -> Self {
        self.ignore_stop = true;
        self
    }

    /// `kill` is accepted but the process survives.
    pub fn ignoring_kill(mut self) -> Self {
        self.ignore_kill = true;
        self
    }

    /// `start` is accepted but the unit never becomes active.
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// `is-active` itself fails, so the unit state is unknown.
    pub fn failing_status(mut self) -> Self {
        self.fail_status = true;
        self
    }

    /// Mutating calls so far: `stop`, `kill <signal>`, `start`,
    /// `daemon-reload`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut UnitState) -> T) -> T {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Supervisor for FakeSupervisor {
    fn is_active<'a>(&'a self, _unit: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if self.fail_status {
                anyhow::bail!("systemctl is-active: Failed to connect to bus");
            }
            Ok(self.with_state(|s| s.active))
        })
    }

    fn main_pid<'a>(&'a self, _unit: &'a str) -> BoxFuture<'a, Result<Option<u32>>> {
        Box::pin(async move { Ok(self.with_state(|s| s.pid)) })
    }

    fn process_alive(&self, pid: u32) -> bool {
        self.with_state(|s| s.pid == Some(pid))
    }

    fn start<'a>(&'a self, _unit: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record("start".to_string());
            if !self.fail_start {
                self.with_state(|s| {
                    s.active = true;
                    s.pid = Some(FAKE_PID + 1);
                });
            }
            Ok(())
        })
    }

    fn stop<'a>(&'a self, _unit: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record("stop".to_string());
            if !self.ignore_stop {
                self.with_state(|s| *s = UnitState::default());
            }
            Ok(())
        })
    }

    fn kill<'a>(&'a self, _unit: &'a str, signal: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(format!("kill {signal}"));
            if !self.ignore_kill {
                self.with_state(|s| *s = UnitState::default());
            }
            Ok(())
        })
    }

    fn daemon_reload(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record("daemon-reload".to_string());
            Ok(())
        })
    }

    fn recent_logs<'a>(&'a self, _unit: &'a str, lines: usize) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let log = [
                "level=info msg=\"Starting Prometheus Server\"",
                "level=error msg=\"Error opening storage\" err=\"unexpected block format\"",
            ];
            Ok(log.iter().take(lines).map(ToString::to_string).collect())
        })
    }
}

/// Health endpoints that become ready after a number of polls.
#[derive(Debug)]
pub struct FakeProbe {
    ready_after: Option<u32>,
    ready_calls: AtomicU32,
    fail_queries: bool,
}

impl FakeProbe {
    /// `/-/ready` answers 503 for the first `polls` requests, then 200.
    pub fn ready_after(polls: u32) -> Self {
        Self {
            ready_after: Some(polls),
            ready_calls: AtomicU32::new(0),
            fail_queries: false,
        }
    }

    /// `/-/ready` always answers 503.
    pub fn never_ready() -> Self {
        Self {
            ready_after: None,
            ready_calls: AtomicU32::new(0),
            fail_queries: false,
        }
    }

    /// The `up` query answers with an error envelope.
    pub fn failing_queries(mut self) -> Self {
        self.fail_queries = true;
        self
    }

    fn respond(&self, url: &str) -> ProbeResponse {
        let (status, body) = if url.ends_with("/-/ready") {
            let call = self.ready_calls.fetch_add(1, Ordering::SeqCst);
            match self.ready_after {
                Some(polls) if call >= polls => (200, "Prometheus Server is Ready.\n"),
                _ => (503, "Service Unavailable"),
            }
        } else if url.ends_with("/-/healthy") {
            (200, "Prometheus Server is Healthy.\n")
        } else if url.contains("/api/v1/query") {
            if self.fail_queries {
                (200, r#"{"status":"error","errorType":"execution","error":"query timed out"}"#)
            } else {
                (200, r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#)
            }
        } else {
            (404, "404 page not found")
        };
        ProbeResponse {
            status,
            body: body.to_string(),
        }
    }
}

impl HealthProbe for FakeProbe {
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ProbeResponse>> {
        Box::pin(async move { Ok(self.respond(url)) })
    }
}

/// Snapshot API double.
#[derive(Debug)]
pub struct FakeSnapshots {
    data_path: Option<PathBuf>,
    time_out: bool,
}

impl FakeSnapshots {
    /// Admin API disabled.
    pub fn unsupported() -> Self {
        Self {
            data_path: None,
            time_out: false,
        }
    }

    /// Writes a one-block snapshot `snap-1` below `<data_path>/snapshots`.
    pub fn writing_into(data_path: impl AsRef<Path>) -> Self {
        Self {
            data_path: Some(data_path.as_ref().to_path_buf()),
            time_out: false,
        }
    }

    /// Writes the snapshot like [`writing_into`](Self::writing_into) but
    /// reports a timed-out request.
    pub fn timing_out(data_path: impl AsRef<Path>) -> Self {
        Self {
            time_out: true,
            ..Self::writing_into(data_path)
        }
    }
}

impl SnapshotApi for FakeSnapshots {
    fn create(&self) -> BoxFuture<'_, Result<SnapshotOutcome>> {
        Box::pin(async move {
            let Some(data_path) = &self.data_path else {
                return Ok(SnapshotOutcome::Unsupported("admin APIs disabled".to_string()));
            };
            let name = "snap-1";
            write_block(&data_path.join("snapshots").join(name))?;
            if self.time_out {
                anyhow::bail!("POST /api/v1/admin/tsdb/snapshot failed: operation timed out");
            }
            Ok(SnapshotOutcome::Created(name.to_string()))
        })
    }
}
