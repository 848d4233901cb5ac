use anyhow::Result;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_retry::Retry;
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, info, warn};

use super::Supervisor;
use crate::config::TimeoutConfig;
use crate::constants::SERVICE_LOG_TAIL_LINES;
use crate::core::UpgradeError;

/// Stops and starts the managed unit with bounded, verified waits.
///
/// `stop` only returns `Ok` once the supervisor reports the unit inactive and
/// the recorded main PID is gone. `start` only returns `Ok` once the unit is
/// active. Neither waits forever.
pub struct ServiceController {
    supervisor: Arc<dyn Supervisor>,
    unit: String,
    timeouts: TimeoutConfig,
}

impl ServiceController {
    /// Create a controller for `unit`.
    pub fn new(supervisor: Arc<dyn Supervisor>, unit: impl Into<String>, timeouts: TimeoutConfig) -> Self {
        Self {
            supervisor,
            unit: unit.into(),
            timeouts,
        }
    }

    /// Unit name.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Whether the unit is active right now.
    pub async fn is_running(&self) -> Result<bool> {
        self.supervisor.is_active(&self.unit).await
    }

    /// Stop the unit, escalating to SIGKILL when the graceful stop overruns.
    pub async fn stop(&self) -> Result<()> {
        let pid = match self.supervisor.main_pid(&self.unit).await {
            Ok(pid) => pid,
            Err(e) => {
                warn!(unit = %self.unit, "Could not read main PID: {e:#}");
                None
            }
        };

        if !self.supervisor.is_active(&self.unit).await? && pid.is_none() {
            debug!(unit = %self.unit, "Already stopped");
            return Ok(());
        }

        info!(unit = %self.unit, ?pid, "Stopping service");
        self.supervisor.stop(&self.unit).await.map_err(|e| UpgradeError::ServiceStop {
            unit: self.unit.clone(),
            reason: format!("{e:#}"),
        })?;

        if self.wait_gone(pid, self.timeouts.stop_timeout()).await? {
            info!(unit = %self.unit, "Service stopped");
            return Ok(());
        }

        warn!(
            unit = %self.unit,
            timeout_secs = self.timeouts.stop_timeout_secs,
            "Graceful stop timed out, sending SIGKILL"
        );
        self.supervisor.kill(&self.unit, "SIGKILL").await.map_err(|e| {
            UpgradeError::ServiceStop {
                unit: self.unit.clone(),
                reason: format!("SIGKILL failed: {e:#}"),
            }
        })?;

        if self.wait_gone(pid, self.timeouts.kill_timeout()).await? {
            info!(unit = %self.unit, "Service killed");
            return Ok(());
        }

        Err(UpgradeError::ServiceStop {
            unit: self.unit.clone(),
            reason: format!(
                "process {} still present {}s after SIGKILL",
                pid.map_or_else(|| "(unknown pid)".to_string(), |p| p.to_string()),
                self.timeouts.kill_timeout_secs
            ),
        }
        .into())
    }

    /// Start the unit and wait until the supervisor reports it active.
    pub async fn start(&self) -> Result<()> {
        info!(unit = %self.unit, "Starting service");
        if let Err(e) = self.supervisor.start(&self.unit).await {
            return Err(self.start_failure(format!("{e:#}")).await.into());
        }

        let strategy = FixedInterval::new(self.timeouts.start_interval())
            .take(self.timeouts.start_attempts.saturating_sub(1) as usize);
        let became_active = Retry::spawn(strategy, || self.check_active()).await;

        match became_active {
            Ok(()) => {
                info!(unit = %self.unit, "Service active");
                Ok(())
            }
            Err(reason) => Err(self.start_failure(reason).await.into()),
        }
    }

    async fn check_active(&self) -> Result<(), String> {
        match self.supervisor.is_active(&self.unit).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(format!(
                "not active after {} checks",
                self.timeouts.start_attempts
            )),
            Err(e) => Err(format!("{e:#}")),
        }
    }

    async fn start_failure(&self, reason: String) -> UpgradeError {
        let log_tail = match self.supervisor.recent_logs(&self.unit, SERVICE_LOG_TAIL_LINES).await {
            Ok(lines) => lines,
            Err(e) => vec![format!("(log unavailable: {e:#})")],
        };
        UpgradeError::ServiceStart {
            unit: self.unit.clone(),
            reason,
            log_tail,
        }
    }

    /// Poll until the unit is inactive and `pid` no longer exists, or until
    /// `timeout` elapses. Returns whether the process is gone.
    async fn wait_gone(&self, pid: Option<u32>, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let active = self.supervisor.is_active(&self.unit).await?;
            let alive = pid.is_some_and(|p| self.supervisor.process_alive(p));
            if !active && !alive {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.timeouts.poll_interval()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeSupervisor;

    fn fast_timeouts() -> TimeoutConfig {
        TimeoutConfig {
            stop_timeout_secs: 0,
            kill_timeout_secs: 0,
            start_attempts: 3,
            start_interval_secs: 0,
            lock_timeout_secs: 1,
            poll_interval_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_stop_running_service() {
        let supervisor = Arc::new(FakeSupervisor::running());
        let controller =
            ServiceController::new(supervisor.clone(), "prometheus.service", fast_timeouts());

        controller.stop().await.unwrap();
        assert!(!controller.is_running().await.unwrap());
        assert_eq!(supervisor.calls(), vec!["stop"]);
    }

    #[tokio::test]
    async fn test_stop_already_stopped_is_noop() {
        let supervisor = Arc::new(FakeSupervisor::stopped());
        let controller =
            ServiceController::new(supervisor.clone(), "prometheus.service", fast_timeouts());

        controller.stop().await.unwrap();
        assert!(supervisor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let supervisor = Arc::new(FakeSupervisor::running().ignoring_stop());
        let controller =
            ServiceController::new(supervisor.clone(), "prometheus.service", fast_timeouts());

        controller.stop().await.unwrap();
        assert_eq!(supervisor.calls(), vec!["stop", "kill SIGKILL"]);
    }

    #[tokio::test]
    async fn test_stop_fails_when_process_survives_kill() {
        let supervisor = Arc::new(FakeSupervisor::running().ignoring_stop().ignoring_kill());
        let controller = ServiceController::new(supervisor, "prometheus.service", fast_timeouts());

        let err = controller.stop().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpgradeError>(),
            Some(UpgradeError::ServiceStop { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_reports_log_tail_on_failure() {
        let supervisor = Arc::new(FakeSupervisor::stopped().failing_start());
        let controller = ServiceController::new(supervisor, "prometheus.service", fast_timeouts());

        let err = controller.start().await.unwrap_err();
        match err.downcast_ref::<UpgradeError>() {
            Some(UpgradeError::ServiceStart { log_tail, .. }) => assert!(!log_tail.is_empty()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_success() {
        let supervisor = Arc::new(FakeSupervisor::stopped());
        let controller = ServiceController::new(supervisor, "prometheus.service", fast_timeouts());

        controller.start().await.unwrap();
        assert!(controller.is_running().await.unwrap());
    }
}
