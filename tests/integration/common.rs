use anyhow::Result;
use promup_cli::core::UpgradeError;
use promup_cli::install::FileFetcher;
use promup_cli::test_utils::{FakeProbe, FakeSnapshots, FakeSupervisor, TestInstallation, init_test_logging};
use promup_cli::upgrade::{Collaborators, UpgradeOrchestrator};
use std::sync::Arc;

/// Orchestrator over `install` with a supervisor the test can inspect, a
/// probe that is ready immediately and no snapshot API.
pub fn orchestrator(install: &TestInstallation, supervisor: Arc<FakeSupervisor>) -> Result<UpgradeOrchestrator> {
    init_test_logging(None);
    let collaborators = Collaborators {
        supervisor,
        fetcher: Arc::new(FileFetcher),
        probe: Arc::new(FakeProbe::ready_after(0)),
        snapshots: Arc::new(FakeSnapshots::unsupported()),
    };
    UpgradeOrchestrator::new(install.config(), collaborators)
}

/// The typed error at the bottom of the chain.
pub fn root_cause(err: &anyhow::Error) -> Option<&UpgradeError> {
    err.chain().last().and_then(|e| e.downcast_ref::<UpgradeError>())
}
