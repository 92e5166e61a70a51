//! Deployment orchestrator
//!
//! Composes the quota gate, port lease registry, isolated builder and
//! hardened launcher into the build -> deploy -> stop lifecycle:
//! 1. Admit the build
//! 2. Build; a failed build is persisted with its logs
//! 3. Admit the instance
//! 4. Lease a port; exhaustion aborts before any runner exists
//! 5. Launch behind the health gate; a failure releases the lease
//! 6. Persist the healthy instance and emit `instance.healthy`
//!
//! Flows for the same project run one at a time. Every failure after a
//! resource is taken gives it back: the lease through guarded release, the
//! concurrency slot through the quota gate, the runner through teardown.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use slipway_core::{
    AdmissionKind, Artifact, Build, BuildFailureReason, BuildId, BuildStatus, CancelHandle,
    CancelToken, ConfigError, DeployError, DeploymentStore, EventBus, Instance, InstanceId,
    InstanceStatus, LifecycleEvent, ProjectId, SandboxRuntime, SlipwayConfig, UserId,
};
use slipway_ports::{HealthProbe, PoolStats, PortLeaseRegistry};
use slipway_quota::{Admission, QuotaGate};
use slipway_sandbox::{HardenedLauncher, IsolatedBuilder};
use tokio::sync::broadcast;

use crate::instances::InstanceRegistry;
use crate::locks::ProjectLocks;

/// Result of a combined build and deploy
#[derive(Debug, Clone)]
pub struct Deployment {
    /// The succeeded build
    pub build: Build,
    /// Its healthy instance
    pub instance: Instance,
}

/// What [`DeploymentOrchestrator::recover`] found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Live instances whose lease was re-established
    pub restored: usize,
    /// Rows marked failed (interrupted gating, lost lease)
    pub failed: usize,
}

/// Removes an in-flight build's cancel handle however the build ends
struct BuildSlot<'a> {
    builds: &'a DashMap<BuildId, CancelHandle>,
    id: BuildId,
}

impl Drop for BuildSlot<'_> {
    fn drop(&mut self) {
        self.builds.remove(&self.id);
    }
}

/// Build / deploy / stop lifecycle over shared ports, quota and sandboxes
pub struct DeploymentOrchestrator {
    config: SlipwayConfig,
    store: Arc<dyn DeploymentStore>,
    quota: QuotaGate,
    ports: Arc<PortLeaseRegistry>,
    builder: IsolatedBuilder,
    launcher: HardenedLauncher,
    locks: ProjectLocks,
    instances: InstanceRegistry,
    builds: DashMap<BuildId, CancelHandle>,
    events: EventBus,
}

impl std::fmt::Debug for DeploymentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentOrchestrator")
            .field("config", &self.config)
            .field("live_instances", &self.instances.len())
            .field("builds_in_flight", &self.builds.len())
            .finish_non_exhaustive()
    }
}

impl DeploymentOrchestrator {
    /// Create new orchestrator over the given collaborators
    ///
    /// # Errors
    /// - `ConfigError::Invalid` if `config` does not validate
    pub fn new(
        config: SlipwayConfig,
        store: Arc<dyn DeploymentStore>,
        runtime: Arc<dyn SandboxRuntime>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let ports = Arc::new(PortLeaseRegistry::from_config(&config.ports, probe));
        let quota = QuotaGate::new(Arc::clone(&store), config.quota.clone());
        let builder = IsolatedBuilder::new(Arc::clone(&runtime), config.build.clone());
        let launcher = HardenedLauncher::new(
            runtime,
            Arc::clone(&ports),
            config.runtime.clone(),
            &config.ports,
        );

        Ok(Self {
            config,
            store,
            quota,
            ports,
            builder,
            launcher,
            locks: ProjectLocks::new(),
            instances: InstanceRegistry::new(),
            builds: DashMap::new(),
            events: EventBus::default(),
        })
    }

    /// Publish on an existing bus instead of a private one
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SlipwayConfig {
        &self.config
    }

    /// Quota gate, for recording AI usage and operator resets
    #[inline]
    #[must_use]
    pub fn quota(&self) -> &QuotaGate {
        &self.quota
    }

    /// Port pool usage
    #[must_use]
    pub fn port_stats(&self) -> PoolStats {
        self.ports.stats()
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Build `source` for `project`.
    ///
    /// # Errors
    /// - `DeployError::QuotaExceeded` if the build is not admitted
    /// - `DeployError::BuildFailed` with captured logs if the build failed
    /// - `DeployError::Cancelled` if [`Self::cancel_build`] stopped it
    /// - `DeployError::Persistence` if the build row could not be written
    pub async fn build(
        &self,
        user: UserId,
        project: ProjectId,
        source: &Path,
    ) -> Result<Build, DeployError> {
        let _project = self.locks.acquire(project).await;
        self.run_build(user, project, source).await
    }

    /// Deploy a succeeded build.
    ///
    /// A live instance of the same project is stopped first. If the same
    /// user owns it, its concurrency slot carries over to the new instance.
    ///
    /// # Errors
    /// - `DeployError::NotFound` / `DeployError::Forbidden` for unknown or foreign builds
    /// - `DeployError::InvalidState` if the build has no artifact
    /// - `DeployError::QuotaExceeded`, `DeployError::PortPoolExhausted`
    /// - `DeployError::HealthCheckTimeout` / `DeployError::Runtime` if launching failed
    /// - `DeployError::Cancelled` if the instance was stopped while gating
    pub async fn deploy(
        &self,
        user: UserId,
        project: ProjectId,
        build_id: BuildId,
    ) -> Result<Instance, DeployError> {
        let _project = self.locks.acquire(project).await;

        let build = self
            .store
            .get_build(build_id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("build {build_id}")))?;
        if build.user_id != user {
            return Err(DeployError::Forbidden(format!(
                "build {build_id} belongs to another user"
            )));
        }
        if build.project_id != project {
            return Err(DeployError::InvalidState(format!(
                "build {build_id} belongs to project {}",
                build.project_id
            )));
        }
        let artifact = match (&build.status, &build.artifact) {
            (BuildStatus::Succeeded, Some(artifact)) => artifact.clone(),
            (status, _) => {
                return Err(DeployError::InvalidState(format!(
                    "build {build_id} is {} and has no artifact",
                    status.as_str()
                )))
            }
        };

        self.run_deploy(&build, &artifact).await
    }

    /// Build and deploy in one serialized flow.
    ///
    /// If the build succeeds but the deploy is not admitted, the build stays
    /// persisted as succeeded and can be deployed later.
    ///
    /// # Errors
    /// Any error of [`Self::build`] or [`Self::deploy`].
    pub async fn build_and_deploy(
        &self,
        user: UserId,
        project: ProjectId,
        source: &Path,
    ) -> Result<Deployment, DeployError> {
        let _project = self.locks.acquire(project).await;

        let build = self.run_build(user, project, source).await?;
        let artifact = build.artifact.clone().ok_or_else(|| {
            DeployError::InvalidState(format!("build {} has no artifact", build.id))
        })?;
        let instance = self.run_deploy(&build, &artifact).await?;

        Ok(Deployment { build, instance })
    }

    /// Stop an instance.
    ///
    /// Cancels a pending health gate, tears the runner down and always
    /// releases the port, even if teardown fails. Stopping a stopped or
    /// failed instance returns it unchanged.
    ///
    /// # Errors
    /// - `DeployError::NotFound` for unknown instances
    /// - `DeployError::Persistence` if the final state could not be written
    ///   (the port is released regardless)
    pub async fn stop(&self, id: InstanceId) -> Result<Instance, DeployError> {
        let instance = self.find_instance(id).await?;
        if self.instances.cancel_gate(id) {
            tracing::info!(instance_id = %id, "stop requested during health gating");
        }

        let _project = self.locks.acquire(instance.project_id).await;
        // A cancelled gate has been rolled back by its own flow by now
        let current = self.find_instance(id).await?;
        if current.status.is_terminal() {
            return Ok(current);
        }
        self.stop_locked(current, false).await
    }

    /// Fetch an instance, recording the access
    ///
    /// # Errors
    /// - `DeployError::NotFound` for unknown instances
    pub async fn get_instance(&self, id: InstanceId) -> Result<Instance, DeployError> {
        if let Some(instance) = self.instances.touch(id) {
            return Ok(instance);
        }
        self.store
            .get_instance(id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("instance {id}")))
    }

    /// Fetch an instance without recording an access
    ///
    /// # Errors
    /// - `DeployError::NotFound` for unknown instances
    pub async fn peek_instance(&self, id: InstanceId) -> Result<Instance, DeployError> {
        self.find_instance(id).await
    }

    /// Record an access without fetching. Returns false if the instance is not live.
    pub fn touch(&self, id: InstanceId) -> bool {
        self.instances.touch(id).is_some()
    }

    /// The project's current starting or live instance
    #[must_use]
    pub fn current_instance(&self, project: ProjectId) -> Option<Instance> {
        self.instances.current(project)
    }

    /// Every starting or live instance
    #[must_use]
    pub fn live_instances(&self) -> Vec<Instance> {
        self.instances.snapshot()
    }

    /// Fetch a build
    ///
    /// # Errors
    /// - `DeployError::NotFound` for unknown builds
    pub async fn get_build(&self, id: BuildId) -> Result<Build, DeployError> {
        self.store
            .get_build(id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("build {id}")))
    }

    /// Signal an in-flight build to stop. Returns false if it is not running.
    pub fn cancel_build(&self, id: BuildId) -> bool {
        match self.builds.get(&id) {
            Some(handle) => {
                handle.cancel();
                tracing::info!(build_id = %id, "build cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Probe a live instance once and move it between healthy and unhealthy.
    ///
    /// Unhealthy instances keep running. If the project is busy with another
    /// flow the probe is skipped and the current status returned.
    ///
    /// # Errors
    /// - `DeployError::NotFound` if the instance is not live
    /// - `DeployError::InvalidState` if it is still starting
    /// - `DeployError::Persistence` if the new status could not be written
    pub async fn refresh_health(&self, id: InstanceId) -> Result<InstanceStatus, DeployError> {
        let instance = self
            .instances
            .get(id)
            .ok_or_else(|| DeployError::NotFound(format!("instance {id}")))?;
        if !instance.status.is_live() {
            return Err(DeployError::InvalidState(format!(
                "instance {id} is {}",
                instance.status
            )));
        }

        let Some(_project) = self.locks.try_acquire(instance.project_id) else {
            tracing::debug!(instance_id = %id, "project busy, skipping health refresh");
            return Ok(instance.status);
        };

        let next = if self.launcher.probe_once(&instance).await {
            InstanceStatus::Healthy
        } else {
            InstanceStatus::Unhealthy
        };
        if next == instance.status {
            return Ok(next);
        }

        let updated = self.instances.transition(
            id,
            &[InstanceStatus::Healthy, InstanceStatus::Unhealthy],
            |i| i.set_status(next),
        )?;
        self.store.update_instance_status(&updated).await?;

        match (next, updated.port()) {
            (InstanceStatus::Healthy, Some(port)) => {
                tracing::info!(instance_id = %id, port, "instance recovered");
                self.events.emit(LifecycleEvent::InstanceHealthy {
                    instance_id: id,
                    project_id: updated.project_id,
                    port,
                });
            }
            _ => {
                tracing::warn!(instance_id = %id, "instance unhealthy");
                self.events.emit(LifecycleEvent::InstanceUnhealthy {
                    instance_id: id,
                    project_id: updated.project_id,
                });
            }
        }
        Ok(next)
    }

    /// Stop every live instance idle past its auto-sleep policy.
    ///
    /// Returns the stopped ids; individual failures are logged.
    pub async fn sweep_idle(&self) -> Vec<InstanceId> {
        let now = Utc::now();
        let idle: Vec<InstanceId> = self
            .instances
            .snapshot()
            .into_iter()
            .filter(|i| i.status.is_live() && i.auto_sleep.is_idle(i.last_accessed_at, now))
            .map(|i| i.id)
            .collect();

        let mut stopped = Vec::with_capacity(idle.len());
        for id in idle {
            match self.stop(id).await {
                Ok(_) => {
                    tracing::info!(instance_id = %id, "idle instance put to sleep");
                    stopped.push(id);
                }
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %e, "failed to stop idle instance");
                }
            }
        }
        stopped
    }

    /// Rebuild the live view from persisted instances after a restart.
    ///
    /// Healthy and unhealthy rows get their lease back. Rows still
    /// `starting` were interrupted mid-gate and are marked failed, as are
    /// rows whose lease cannot be restored.
    ///
    /// # Errors
    /// - `DeployError::Persistence` if instances could not be listed
    pub async fn recover(&self) -> Result<RecoveryReport, DeployError> {
        let mut report = RecoveryReport::default();

        for instance in self.store.list_instances().await? {
            match instance.status {
                InstanceStatus::Healthy | InstanceStatus::Unhealthy => {
                    let restored = match &instance.lease {
                        Some(lease) => self
                            .ports
                            .restore(lease.clone())
                            .map_err(|e| format!("lease not restored: {e}")),
                        None => Err("no lease recorded".to_string()),
                    };
                    match restored {
                        Ok(()) => {
                            self.instances.upsert(instance);
                            report.restored += 1;
                        }
                        Err(reason) => {
                            self.fail_recovered(instance, reason).await;
                            report.failed += 1;
                        }
                    }
                }
                InstanceStatus::Starting => {
                    self.fail_recovered(instance, "interrupted during health gating".to_string())
                        .await;
                    report.failed += 1;
                }
                InstanceStatus::Stopped | InstanceStatus::Failed => {}
            }
        }

        tracing::info!(
            restored = report.restored,
            failed = report.failed,
            "instances recovered"
        );
        Ok(report)
    }

    async fn run_build(
        &self,
        user: UserId,
        project: ProjectId,
        source: &Path,
    ) -> Result<Build, DeployError> {
        self.admit(user, AdmissionKind::Build).await?;

        let mut build = Build::queued(project, user);
        build.mark_running();
        self.store.create_build(&build).await?;
        self.events.emit(LifecycleEvent::BuildStarted {
            build_id: build.id,
            project_id: project,
        });

        let (handle, token) = CancelToken::pair();
        self.builds.insert(build.id, handle);
        let slot = BuildSlot {
            builds: &self.builds,
            id: build.id,
        };
        let result = self.builder.build(build.id, project, source, &token).await;
        drop(slot);

        match result {
            Ok(output) => {
                let image = output.artifact.image.clone();
                build.succeed(output.artifact, output.logs, output.usage);
                self.store.update_build_status(&build).await?;
                self.events.emit(LifecycleEvent::BuildSucceeded {
                    build_id: build.id,
                    project_id: project,
                    artifact: image,
                });
                Ok(build)
            }
            Err(failure) => {
                let cancelled = failure.reason == BuildFailureReason::Cancelled;
                if cancelled {
                    build.cancel(failure.logs.clone());
                } else {
                    build.fail(
                        failure.exit_code,
                        failure.reason.to_string(),
                        failure.logs.clone(),
                        failure.usage,
                    );
                }
                if let Err(e) = self.store.update_build_status(&build).await {
                    tracing::error!(build_id = %build.id, error = %e, "failed to persist build failure");
                }
                self.events.emit(LifecycleEvent::BuildFailed {
                    build_id: build.id,
                    project_id: project,
                    reason: failure.reason.to_string(),
                });

                if cancelled {
                    Err(DeployError::Cancelled)
                } else {
                    Err(failure.into())
                }
            }
        }
    }

    async fn run_deploy(&self, build: &Build, artifact: &Artifact) -> Result<Instance, DeployError> {
        let (user, project) = (build.user_id, build.project_id);
        let replaced = self.instances.current(project);
        // A replacement by the same user takes over the old instance's slot
        let hand_over = replaced.as_ref().is_some_and(|p| p.user_id == user);
        let admission = if hand_over {
            self.quota.admit_replacement(user).await
        } else {
            self.quota.admit(user, AdmissionKind::DeployInstance).await
        };
        admitted(admission)?;

        if let Some(previous) = replaced {
            tracing::info!(project_id = %project, instance_id = %previous.id, hand_over, "replacing current instance");
            if let Err(e) = self.stop_locked(previous, hand_over).await {
                tracing::warn!(project_id = %project, error = %e, "replaced instance did not stop cleanly");
            }
        }

        let lease = match self.ports.allocate(project) {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(project_id = %project, error = %e, "no port for deploy");
                self.release_slot(user).await;
                return Err(e.into());
            }
        };

        let instance = Instance::starting(
            build,
            self.config.runtime.host.clone(),
            lease.clone(),
            self.config.runtime.limits(),
            self.config.runtime.auto_sleep,
        );
        if let Err(e) = self.store.create_instance(&instance).await {
            self.ports.release_lease(&lease);
            self.release_slot(user).await;
            return Err(e.into());
        }

        let (gate, token) = CancelToken::pair();
        self.instances.begin(instance.clone(), gate);
        tracing::info!(
            instance_id = %instance.id,
            project_id = %project,
            build_id = %build.id,
            port = lease.port,
            "deploying"
        );

        let launched = self.launcher.launch(instance.clone(), artifact, &token).await;
        self.instances.settle(instance.id);

        let healthy = match launched {
            Ok(healthy) => healthy,
            Err(e) => return Err(self.roll_back_launch(instance, e).await),
        };

        if let Err(e) = self.store.update_instance_status(&healthy).await {
            if let Some(handle) = &healthy.runtime_handle {
                if let Err(teardown) = self.launcher.teardown(handle).await {
                    tracing::warn!(instance_id = %healthy.id, error = %teardown, "runner teardown failed after persistence error");
                }
            }
            return Err(self.roll_back_launch(instance, e.into()).await);
        }

        self.instances.upsert(healthy.clone());
        self.events.emit(LifecycleEvent::InstanceHealthy {
            instance_id: healthy.id,
            project_id: project,
            port: lease.port,
        });
        tracing::info!(instance_id = %healthy.id, port = lease.port, "instance live");
        Ok(healthy)
    }

    /// Undo a launch that never went live; returns `error` for the caller
    async fn roll_back_launch(&self, mut instance: Instance, error: DeployError) -> DeployError {
        if let Some(lease) = &instance.lease {
            self.ports.release_lease(lease);
        }

        let stopped = matches!(error, DeployError::Cancelled);
        if stopped {
            instance.set_status(InstanceStatus::Stopped);
        } else {
            instance.set_status(InstanceStatus::Failed);
            instance.error = Some(error.to_string());
        }

        let was_live = self.instances.remove(instance.id).is_some();
        self.persist_instance(&instance).await;
        if was_live {
            self.release_slot(instance.user_id).await;
        }

        if stopped {
            self.events.emit(LifecycleEvent::InstanceStopped {
                instance_id: instance.id,
                project_id: instance.project_id,
            });
        } else {
            self.events.emit(LifecycleEvent::InstanceFailed {
                instance_id: instance.id,
                project_id: instance.project_id,
                reason: error.code().to_string(),
            });
        }
        tracing::warn!(instance_id = %instance.id, code = error.code(), "deploy rolled back");
        error
    }

    /// Tear down, release the port and record `stopped`.
    ///
    /// The concurrency slot goes back only if the instance was still in the
    /// live view, so a retried stop returns it at most once. With
    /// `hand_over` it passes to the replacing deploy instead.
    async fn stop_locked(
        &self,
        mut instance: Instance,
        hand_over: bool,
    ) -> Result<Instance, DeployError> {
        if let Some(handle) = &instance.runtime_handle {
            if let Err(e) = self.launcher.teardown(handle).await {
                tracing::warn!(instance_id = %instance.id, error = %e, "runner teardown failed, releasing port anyway");
            }
        }
        if let Some(lease) = &instance.lease {
            self.ports.release_lease(lease);
        }

        instance.set_status(InstanceStatus::Stopped);
        let was_live = self.instances.remove(instance.id).is_some();
        if was_live && !hand_over {
            self.release_slot(instance.user_id).await;
        }

        let persisted = self.store.update_instance_status(&instance).await;
        self.events.emit(LifecycleEvent::InstanceStopped {
            instance_id: instance.id,
            project_id: instance.project_id,
        });
        tracing::info!(instance_id = %instance.id, project_id = %instance.project_id, "instance stopped");

        persisted?;
        Ok(instance)
    }

    async fn fail_recovered(&self, mut instance: Instance, reason: String) {
        tracing::warn!(instance_id = %instance.id, reason = %reason, "instance not recovered");
        if let Some(handle) = &instance.runtime_handle {
            if let Err(e) = self.launcher.teardown(handle).await {
                tracing::warn!(instance_id = %instance.id, error = %e, "runner teardown failed during recovery");
            }
        }

        instance.set_status(InstanceStatus::Failed);
        instance.error = Some(reason.clone());
        self.persist_instance(&instance).await;
        self.release_slot(instance.user_id).await;
        self.events.emit(LifecycleEvent::InstanceFailed {
            instance_id: instance.id,
            project_id: instance.project_id,
            reason,
        });
    }

    async fn find_instance(&self, id: InstanceId) -> Result<Instance, DeployError> {
        if let Some(instance) = self.instances.get(id) {
            return Ok(instance);
        }
        self.store
            .get_instance(id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("instance {id}")))
    }

    async fn admit(&self, user: UserId, kind: AdmissionKind) -> Result<(), DeployError> {
        admitted(self.quota.admit(user, kind).await)
    }

    async fn release_slot(&self, user: UserId) {
        if let Err(e) = self.quota.release_instance(user).await {
            tracing::warn!(user_id = %user, error = %e, "failed to return concurrency slot");
        }
    }

    async fn persist_instance(&self, instance: &Instance) {
        if let Err(e) = self.store.update_instance_status(instance).await {
            tracing::error!(
                instance_id = %instance.id,
                status = %instance.status,
                error = %e,
                "failed to persist instance state"
            );
        }
    }
}

fn admitted(admission: Admission) -> Result<(), DeployError> {
    match admission {
        Admission::Allow => Ok(()),
        Admission::Deny(reason) => Err(DeployError::QuotaExceeded(reason.message)),
    }
}
