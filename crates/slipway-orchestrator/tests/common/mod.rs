//! Shared harness for orchestrator integration tests

#![allow(dead_code)]

use std::sync::Arc;

use slipway_core::{
    DeployError, LifecycleEvent, ProjectId, QuotaRecord, SlipwayConfig, UserId,
};
use slipway_orchestrator::{Deployment, DeploymentOrchestrator};
use slipway_test_utils::{source_dir, test_config, FailingStore, FakeRuntime, Script, ScriptedProbe};
use tempfile::TempDir;
use tokio::sync::broadcast;

pub struct Harness {
    pub store: Arc<FailingStore>,
    pub runtime: Arc<FakeRuntime>,
    pub probe: Arc<ScriptedProbe>,
    pub orchestrator: Arc<DeploymentOrchestrator>,
    pub source: TempDir,
    pub user: UserId,
    pub project: ProjectId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_config(), Script::default(), ScriptedProbe::always(true))
    }

    pub fn with(config: SlipwayConfig, script: Script, probe: ScriptedProbe) -> Self {
        let store = Arc::new(FailingStore::new());
        let runtime = Arc::new(FakeRuntime::with_script(script));
        let probe = Arc::new(probe);
        let orchestrator = Arc::new(
            DeploymentOrchestrator::new(config, store.clone(), runtime.clone(), probe.clone())
                .unwrap(),
        );

        Self {
            store,
            runtime,
            probe,
            orchestrator,
            source: source_dir(),
            user: UserId::new(),
            project: ProjectId::new(),
        }
    }

    /// Second orchestrator over the same store, runtime and probe (a restart)
    pub fn restarted(&self, config: SlipwayConfig) -> DeploymentOrchestrator {
        DeploymentOrchestrator::new(
            config,
            self.store.clone(),
            self.runtime.clone(),
            self.probe.clone(),
        )
        .unwrap()
    }

    pub async fn build_and_deploy(&self) -> Result<Deployment, DeployError> {
        self.orchestrator
            .build_and_deploy(self.user, self.project, self.source.path())
            .await
    }

    pub fn leased(&self) -> usize {
        self.orchestrator.port_stats().leased
    }

    pub async fn quota(&self) -> QuotaRecord {
        self.orchestrator
            .quota()
            .snapshot(self.user)
            .await
            .unwrap()
            .unwrap()
    }
}

/// Everything published so far
pub fn drain(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn names(events: &[LifecycleEvent]) -> Vec<&'static str> {
    events.iter().map(LifecycleEvent::name).collect()
}
