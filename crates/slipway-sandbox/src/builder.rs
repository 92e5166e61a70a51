//! Isolated build runner
//!
//! Runs the untrusted build command in an ephemeral builder sandbox:
//! 1. Create the sandbox from the builder profile
//! 2. Start it and capture output incrementally
//! 3. Wait for exit, racing the build timeout and cancellation
//! 4. On exit 0, commit the sandbox into an artifact
//! 5. Tear the sandbox down, whatever happened
//!
//! Builds are never retried here.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use slipway_core::{
    Artifact, BuildConfig, BuildFailureReason, BuildId, CancelToken, DeployError, ExitStatus,
    ProjectId, ResourceUsage, SandboxError, SandboxHandle, SandboxRuntime, Stage,
};

use crate::guard::SandboxGuard;
use crate::logs::LogBuffer;
use crate::profile::build_spec;

/// How long to keep draining logs after the build process exits
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Successful build
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Image committed from the builder
    pub artifact: Artifact,
    /// Combined build output
    pub logs: String,
    /// Resources the build consumed
    pub usage: ResourceUsage,
}

/// Failed build with whatever output was captured
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct BuildFailure {
    /// `None` if the build never exited on its own
    pub exit_code: Option<i64>,
    /// Output captured up to the failure
    pub logs: String,
    /// Why it failed; timeouts and cancellation are reasons too
    pub reason: BuildFailureReason,
    /// Resources consumed before the failure
    pub usage: ResourceUsage,
}

impl BuildFailure {
    fn runtime(stage: Stage, err: &SandboxError, logs: String) -> Self {
        Self {
            exit_code: None,
            logs,
            reason: BuildFailureReason::Runtime {
                stage,
                message: err.to_string(),
            },
            usage: ResourceUsage::default(),
        }
    }
}

impl From<BuildFailure> for DeployError {
    fn from(failure: BuildFailure) -> Self {
        DeployError::BuildFailed {
            exit_code: failure.exit_code,
            logs: failure.logs,
            reason: failure.reason,
        }
    }
}

enum Waited {
    Exited(ExitStatus),
    Failed(SandboxError),
    TimedOut,
    Cancelled,
}

/// Runs builds in throwaway sandboxes
pub struct IsolatedBuilder {
    runtime: Arc<dyn SandboxRuntime>,
    config: BuildConfig,
}

impl std::fmt::Debug for IsolatedBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IsolatedBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: BuildConfig) -> Self {
        Self { runtime, config }
    }

    /// Build `source` for `project`.
    ///
    /// The builder sandbox is gone when this returns, on every path. If the
    /// future is dropped mid-build, teardown is scheduled on the runtime.
    pub async fn build(
        &self,
        build_id: BuildId,
        project: ProjectId,
        source: &Path,
        cancel: &CancelToken,
    ) -> Result<BuildOutput, BuildFailure> {
        let spec = build_spec(&self.config, build_id, project, source)
            .map_err(|e| BuildFailure::runtime(Stage::BuildSetup, &e, String::new()))?;

        let handle = self
            .runtime
            .create(&spec)
            .await
            .map_err(|e| BuildFailure::runtime(Stage::BuildSetup, &e, String::new()))?;
        let guard = SandboxGuard::new(
            Arc::clone(&self.runtime),
            handle.clone(),
            Duration::from_secs(self.config.stop_grace_secs),
        );

        tracing::info!(build_id = %build_id, project_id = %project, sandbox = %handle.name, "build started");
        let result = self.run(build_id, project, &handle, cancel).await;

        if let Err(e) = guard.teardown().await {
            tracing::warn!(build_id = %build_id, error = %e, "builder teardown failed");
        }

        match &result {
            Ok(output) => {
                tracing::info!(build_id = %build_id, artifact = %output.artifact.image, "build succeeded");
            }
            Err(failure) => {
                tracing::info!(build_id = %build_id, reason = %failure.reason, "build failed");
            }
        }
        result
    }

    async fn run(
        &self,
        build_id: BuildId,
        project: ProjectId,
        handle: &SandboxHandle,
        cancel: &CancelToken,
    ) -> Result<BuildOutput, BuildFailure> {
        if cancel.is_cancelled() {
            return Err(Self::cancelled(String::new()));
        }

        self.runtime
            .start(handle)
            .await
            .map_err(|e| BuildFailure::runtime(Stage::BuildSetup, &e, String::new()))?;

        let logs = LogBuffer::new(self.config.max_log_bytes);
        let mut collector = {
            let runtime = Arc::clone(&self.runtime);
            let handle = handle.clone();
            let logs = logs.clone();
            tokio::spawn(async move {
                match runtime.logs(&handle).await {
                    Ok(stream) => logs.collect(stream).await,
                    Err(e) => tracing::warn!(sandbox = %handle.name, error = %e, "failed to attach build logs"),
                }
            })
        };

        let waited = tokio::select! {
            biased;
            () = cancel.cancelled() => Waited::Cancelled,
            result = tokio::time::timeout(self.config.timeout(), self.runtime.wait(handle)) => {
                match result {
                    Ok(Ok(status)) => Waited::Exited(status),
                    Ok(Err(e)) => Waited::Failed(e),
                    Err(_) => Waited::TimedOut,
                }
            }
        };

        if matches!(waited, Waited::Exited(_)) {
            // The stream ends with the process; give it a moment to flush
            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut collector).await.is_err() {
                collector.abort();
            }
        } else {
            collector.abort();
        }
        let captured = logs.snapshot();

        match waited {
            Waited::Exited(status) if status.success() => {
                let reference = format!("slipway/{project}:{build_id}");
                let image = self
                    .runtime
                    .commit(handle, &reference)
                    .await
                    .map_err(|e| BuildFailure::runtime(Stage::Commit, &e, captured.clone()))?;
                Ok(BuildOutput {
                    artifact: Artifact {
                        image,
                        build_id,
                        created_at: Utc::now(),
                    },
                    logs: captured,
                    usage: status.usage,
                })
            }
            Waited::Exited(status) => Err(BuildFailure {
                exit_code: Some(status.code),
                logs: captured,
                reason: BuildFailureReason::NonZeroExit,
                usage: status.usage,
            }),
            Waited::Failed(e) => Err(BuildFailure::runtime(Stage::Build, &e, captured)),
            Waited::TimedOut => Err(BuildFailure {
                exit_code: None,
                logs: captured,
                reason: BuildFailureReason::Timeout {
                    after_secs: self.config.timeout_secs,
                },
                usage: ResourceUsage::default(),
            }),
            Waited::Cancelled => Err(Self::cancelled(captured)),
        }
    }

    fn cancelled(logs: String) -> BuildFailure {
        BuildFailure {
            exit_code: None,
            logs,
            reason: BuildFailureReason::Cancelled,
            usage: ResourceUsage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_core::SandboxRole;
    use slipway_test_utils::{source_dir, test_config, FakeRuntime, Script};

    fn builder(script: Script) -> (Arc<FakeRuntime>, IsolatedBuilder) {
        let runtime = Arc::new(FakeRuntime::with_script(script));
        let builder = IsolatedBuilder::new(runtime.clone(), test_config().build);
        (runtime, builder)
    }

    #[tokio::test]
    async fn successful_build_commits_artifact() {
        let (runtime, builder) = builder(Script::default());
        let source = source_dir();
        let build_id = BuildId::new();

        let output = builder
            .build(build_id, ProjectId::new(), source.path(), &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(output.artifact.build_id, build_id);
        assert!(output.artifact.image.starts_with("sha256:"));
        assert_eq!(output.logs, "installing\nbuilt\n");
        assert_eq!(output.usage.cpu_time_ms, 1_500);
        assert_eq!(runtime.live_count(), 0);
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_logs_and_code() {
        let (runtime, builder) = builder(Script {
            build_exit_code: 2,
            build_logs: vec!["npm ERR! missing script: build".into()],
            ..Script::default()
        });
        let source = source_dir();

        let failure = builder
            .build(BuildId::new(), ProjectId::new(), source.path(), &CancelToken::never())
            .await
            .unwrap_err();

        assert_eq!(failure.exit_code, Some(2));
        assert_eq!(failure.reason, BuildFailureReason::NonZeroExit);
        assert!(failure.logs.contains("missing script"));
        assert_eq!(runtime.live_count(), 0);
        assert!(!runtime.operations().iter().any(|op| op.starts_with("commit:")));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_failure_with_partial_logs() {
        let (runtime, builder) = builder(Script {
            build_hangs: true,
            build_logs: vec!["step 1/3".into()],
            ..Script::default()
        });
        let source = source_dir();

        let failure = builder
            .build(BuildId::new(), ProjectId::new(), source.path(), &CancelToken::never())
            .await
            .unwrap_err();

        assert_eq!(failure.reason, BuildFailureReason::Timeout { after_secs: 5 });
        assert!(failure.logs.contains("step 1/3"));
        assert_eq!(runtime.live_count(), 0);

        let err: DeployError = failure.into();
        assert_eq!(err.code(), "build_timeout");
    }

    #[tokio::test]
    async fn runtime_error_mid_build_still_tears_down() {
        let (runtime, builder) = builder(Script {
            fail_wait: true,
            ..Script::default()
        });
        let source = source_dir();

        let failure = builder
            .build(BuildId::new(), ProjectId::new(), source.path(), &CancelToken::never())
            .await
            .unwrap_err();

        assert!(matches!(
            failure.reason,
            BuildFailureReason::Runtime {
                stage: Stage::Build,
                ..
            }
        ));
        assert_eq!(runtime.live_count(), 0);
    }

    #[tokio::test]
    async fn commit_failure_is_a_runtime_error() {
        let (runtime, builder) = builder(Script {
            fail_commit: true,
            ..Script::default()
        });
        let source = source_dir();

        let failure = builder
            .build(BuildId::new(), ProjectId::new(), source.path(), &CancelToken::never())
            .await
            .unwrap_err();

        assert!(matches!(
            failure.reason,
            BuildFailureReason::Runtime {
                stage: Stage::Commit,
                ..
            }
        ));
        assert_eq!(runtime.live_count(), 0);
    }

    #[tokio::test]
    async fn create_failure_leaves_nothing_behind() {
        let (runtime, builder) = builder(Script {
            fail_create: Some(SandboxRole::Builder),
            ..Script::default()
        });
        let source = source_dir();

        let failure = builder
            .build(BuildId::new(), ProjectId::new(), source.path(), &CancelToken::never())
            .await
            .unwrap_err();

        assert!(matches!(
            failure.reason,
            BuildFailureReason::Runtime {
                stage: Stage::BuildSetup,
                ..
            }
        ));
        assert_eq!(runtime.live_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_the_build() {
        let (runtime, builder) = builder(Script {
            build_hangs: true,
            ..Script::default()
        });
        let builder = Arc::new(builder);
        let source = source_dir();
        let (handle, token) = CancelToken::pair();

        let task = tokio::spawn({
            let builder = Arc::clone(&builder);
            let path = source.path().to_path_buf();
            async move {
                builder
                    .build(BuildId::new(), ProjectId::new(), &path, &token)
                    .await
            }
        });

        assert!(
            slipway_test_utils::eventually(Duration::from_secs(1), || {
                runtime.live_count_of(SandboxRole::Builder) == 1
            })
            .await
        );
        handle.cancel();

        let failure = task.await.unwrap().unwrap_err();
        assert_eq!(failure.reason, BuildFailureReason::Cancelled);
        assert_eq!(runtime.live_count(), 0);
    }
}
