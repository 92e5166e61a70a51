//! Hardened instance launcher
//!
//! Starts a runner from a build artifact on the instance's leased port and
//! holds it behind the health gate: the instance only becomes `healthy`
//! once a liveness probe on the leased port succeeds. Gating ends early if
//! the runner exits, the overall health timeout elapses, or the caller
//! cancels; in each case the runner is torn down before returning.
//!
//! The launcher never touches lease state. Releasing the port after a
//! failed launch is the caller's job.

use std::sync::Arc;

use slipway_core::{
    Artifact, CancelToken, DeployError, ExitStatus, Instance, InstanceStatus, PortConfig,
    RuntimeConfig, SandboxError, SandboxHandle, SandboxRuntime, Stage,
};
use slipway_ports::{PortLeaseRegistry, RetryOutcome, RetryPolicy};

use crate::guard::{teardown, SandboxGuard};
use crate::profile::run_spec;

enum Gate {
    Probe(RetryOutcome<()>),
    Exited(Result<ExitStatus, SandboxError>),
}

/// Launches health-gated runners
pub struct HardenedLauncher {
    runtime: Arc<dyn SandboxRuntime>,
    ports: Arc<PortLeaseRegistry>,
    runtime_config: RuntimeConfig,
    probe: RetryPolicy,
}

impl std::fmt::Debug for HardenedLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardenedLauncher")
            .field("runtime_config", &self.runtime_config)
            .field("probe", &self.probe)
            .finish_non_exhaustive()
    }
}

impl HardenedLauncher {
    /// Create new launcher
    #[must_use]
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        ports: Arc<PortLeaseRegistry>,
        runtime_config: RuntimeConfig,
        port_config: &PortConfig,
    ) -> Self {
        Self {
            runtime,
            ports,
            runtime_config,
            probe: RetryPolicy::new(port_config.probe_attempts, port_config.probe_interval()),
        }
    }

    /// Start `instance` from `artifact` and wait for the health gate.
    ///
    /// Returns the instance as `healthy` with its runtime handle set.
    ///
    /// # Errors
    /// - `DeployError::HealthCheckTimeout` if probes or the overall budget ran out
    /// - `DeployError::Runtime` if the runner could not start or exited while gating
    /// - `DeployError::Cancelled` if `cancel` fired first
    pub async fn launch(
        &self,
        mut instance: Instance,
        artifact: &Artifact,
        cancel: &CancelToken,
    ) -> Result<Instance, DeployError> {
        let port = instance.port().ok_or_else(|| {
            DeployError::InvalidState(format!("instance {} holds no port lease", instance.id))
        })?;
        let spec = run_spec(&self.runtime_config, &instance, artifact)
            .map_err(|e| DeployError::runtime(Stage::Launch, e.to_string()))?;

        let handle = self
            .runtime
            .create(&spec)
            .await
            .map_err(|e| DeployError::runtime(Stage::Launch, e.to_string()))?;
        let guard = SandboxGuard::new(
            Arc::clone(&self.runtime),
            handle.clone(),
            self.runtime_config.stop_grace(),
        );

        if let Err(e) = self.runtime.start(&handle).await {
            if let Err(cleanup) = guard.teardown().await {
                tracing::warn!(instance_id = %instance.id, error = %cleanup, "runner teardown failed after start error");
            }
            return Err(DeployError::runtime(Stage::Launch, e.to_string()));
        }
        tracing::info!(instance_id = %instance.id, port, sandbox = %handle.name, "runner started, health gating");

        let gate = async {
            tokio::select! {
                outcome = self.ports.health_gate(port, self.probe, cancel) => Gate::Probe(outcome),
                exit = self.runtime.wait(&handle) => Gate::Exited(exit),
            }
        };

        let error = match tokio::time::timeout(self.runtime_config.health_timeout(), gate).await {
            Ok(Gate::Probe(RetryOutcome::Ready(()))) => {
                let handle = guard.disarm();
                instance.runtime_handle = handle;
                instance.set_status(InstanceStatus::Healthy);
                tracing::info!(instance_id = %instance.id, port, "instance healthy");
                return Ok(instance);
            }
            Ok(Gate::Probe(RetryOutcome::Exhausted { attempts })) => {
                DeployError::HealthCheckTimeout { attempts }
            }
            Ok(Gate::Probe(RetryOutcome::Cancelled)) => DeployError::Cancelled,
            Ok(Gate::Exited(Ok(status))) => DeployError::runtime(
                Stage::HealthGate,
                format!("runner exited with code {} before becoming healthy", status.code),
            ),
            Ok(Gate::Exited(Err(e))) => DeployError::runtime(Stage::HealthGate, e.to_string()),
            Err(_) => {
                tracing::warn!(
                    instance_id = %instance.id,
                    timeout_secs = self.runtime_config.health_timeout_secs,
                    "health gate timed out"
                );
                DeployError::HealthCheckTimeout {
                    attempts: self.probe.max_attempts,
                }
            }
        };

        tracing::warn!(instance_id = %instance.id, port, code = error.code(), "launch failed, tearing down runner");
        // Rollback error stays the primary one
        if let Err(e) = guard.teardown().await {
            tracing::warn!(instance_id = %instance.id, error = %e, "runner teardown failed after launch error");
        }
        Err(error)
    }

    /// One liveness probe against a running instance
    pub async fn probe_once(&self, instance: &Instance) -> bool {
        match instance.port() {
            Some(port) => self.ports.probe_once(port).await,
            None => false,
        }
    }

    /// Stop and remove a runner
    pub async fn teardown(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        teardown(
            self.runtime.as_ref(),
            handle,
            self.runtime_config.stop_grace(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use slipway_core::{Build, ProjectId, SandboxRole, SlipwayConfig, UserId};
    use slipway_test_utils::{eventually, test_config, FakeRuntime, ScriptedProbe, Script};
    use std::time::Duration;

    struct Fixture {
        runtime: Arc<FakeRuntime>,
        probe: Arc<ScriptedProbe>,
        ports: Arc<PortLeaseRegistry>,
        launcher: HardenedLauncher,
    }

    fn fixture(script: Script, probe: ScriptedProbe) -> Fixture {
        fixture_with(test_config(), script, probe)
    }

    fn fixture_with(config: SlipwayConfig, script: Script, probe: ScriptedProbe) -> Fixture {
        let runtime = Arc::new(FakeRuntime::with_script(script));
        let probe = Arc::new(probe);
        let ports = Arc::new(PortLeaseRegistry::from_config(&config.ports, probe.clone()));
        let launcher =
            HardenedLauncher::new(runtime.clone(), ports.clone(), config.runtime, &config.ports);
        Fixture {
            runtime,
            probe,
            ports,
            launcher,
        }
    }

    fn starting(ports: &PortLeaseRegistry) -> (Instance, Artifact) {
        let config = test_config();
        let build = Build::queued(ProjectId::new(), UserId::new());
        let lease = ports.allocate(build.project_id).unwrap();
        let instance = Instance::starting(
            &build,
            "127.0.0.1",
            lease,
            config.runtime.limits(),
            config.runtime.auto_sleep,
        );
        let artifact = Artifact {
            image: "sha256:built".into(),
            build_id: build.id,
            created_at: Utc::now(),
        };
        (instance, artifact)
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_after_gate_passes() {
        let f = fixture(Script::default(), ScriptedProbe::succeed_after(2));
        let (instance, artifact) = starting(&f.ports);

        let launched = f
            .launcher
            .launch(instance, &artifact, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(launched.status, InstanceStatus::Healthy);
        assert!(launched.runtime_handle.is_some());
        assert_eq!(f.probe.attempts(), 2);
        assert_eq!(f.runtime.live_count_of(SandboxRole::Runner), 1);

        let spec = &f.runtime.created_specs()[0];
        assert_eq!(spec.image, "sha256:built");
        assert!(spec.security.read_only_root);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_probes_tear_down() {
        let f = fixture(Script::default(), ScriptedProbe::always(false));
        let (instance, artifact) = starting(&f.ports);

        let err = f
            .launcher
            .launch(instance, &artifact, &CancelToken::never())
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::HealthCheckTimeout { attempts: 3 }));
        assert_eq!(f.probe.attempts(), 3);
        assert_eq!(f.runtime.live_count(), 0);
        // Lease bookkeeping is left to the caller
        assert_eq!(f.ports.stats().leased, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_during_gating_is_a_runtime_error() {
        let mut config = test_config();
        config.ports.probe_attempts = 1_000;
        let f = fixture_with(config, Script::default(), ScriptedProbe::always(false));
        let (instance, artifact) = starting(&f.ports);
        let launcher = Arc::new(f.launcher);

        let task = tokio::spawn({
            let launcher = Arc::clone(&launcher);
            async move {
                launcher
                    .launch(instance, &artifact, &CancelToken::never())
                    .await
            }
        });

        let runtime = f.runtime.clone();
        assert!(
            eventually(Duration::from_secs(1), || {
                !runtime.handles_of(SandboxRole::Runner).is_empty()
            })
            .await
        );
        for handle in f.runtime.handles_of(SandboxRole::Runner) {
            f.runtime.crash(&handle, 1);
        }

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            DeployError::Runtime {
                stage: Stage::HealthGate,
                ..
            }
        ));
        assert_eq!(f.runtime.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_gating() {
        let mut config = test_config();
        config.ports.probe_attempts = 1_000;
        config.ports.probe_interval_ms = 1_000;
        config.runtime.health_timeout_secs = 10_000;

        let runtime = Arc::new(FakeRuntime::new());
        let probe = Arc::new(ScriptedProbe::always(false));
        let ports = Arc::new(PortLeaseRegistry::from_config(&config.ports, probe.clone()));
        let launcher = Arc::new(HardenedLauncher::new(
            runtime.clone(),
            ports.clone(),
            config.runtime,
            &config.ports,
        ));
        let (instance, artifact) = starting(&ports);
        let (handle, token) = CancelToken::pair();

        let task = tokio::spawn({
            let launcher = Arc::clone(&launcher);
            async move { launcher.launch(instance, &artifact, &token).await }
        });

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        handle.cancel();
        let cancelled_at = tokio::time::Instant::now();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, DeployError::Cancelled));
        assert!(cancelled_at.elapsed() <= Duration::from_secs(1));
        assert_eq!(runtime.live_count(), 0);
    }

    #[tokio::test]
    async fn start_failure_removes_runner() {
        let f = fixture(
            Script {
                fail_start: true,
                ..Script::default()
            },
            ScriptedProbe::always(true),
        );
        let (instance, artifact) = starting(&f.ports);

        let err = f
            .launcher
            .launch(instance, &artifact, &CancelToken::never())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeployError::Runtime {
                stage: Stage::Launch,
                ..
            }
        ));
        assert_eq!(f.runtime.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_error_wins_over_failed_teardown() {
        let f = fixture(
            Script {
                fail_stop: true,
                fail_remove: true,
                ..Script::default()
            },
            ScriptedProbe::always(false),
        );
        let (instance, artifact) = starting(&f.ports);

        let err = f
            .launcher
            .launch(instance, &artifact, &CancelToken::never())
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::HealthCheckTimeout { attempts: 3 }));
        let ops = f.runtime.operations();
        assert!(ops.iter().any(|op| op.starts_with("stop:")));
        assert!(ops.iter().any(|op| op.starts_with("remove:")));
    }

    #[tokio::test]
    async fn start_error_wins_over_failed_teardown() {
        let f = fixture(
            Script {
                fail_start: true,
                fail_remove: true,
                ..Script::default()
            },
            ScriptedProbe::always(true),
        );
        let (instance, artifact) = starting(&f.ports);

        let err = f
            .launcher
            .launch(instance, &artifact, &CancelToken::never())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeployError::Runtime {
                stage: Stage::Launch,
                ..
            }
        ));
        assert!(f.runtime.operations().iter().any(|op| op.starts_with("remove:")));
    }
}
