//! Docker-backed sandbox runtime (feature `docker`)
//!
//! Maps a [`SandboxSpec`] onto a container:
//! - memory ceiling and CPU quota from the spec limits
//! - `cap_drop = ALL`, `no-new-privileges`, optional seccomp profile
//! - read-only root filesystem with tmpfs scratch mounts
//! - network mode (or networking disabled) and the leased port binding
//!
//! Resource usage is not sampled; exit statuses report zero usage.

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CommitContainerOptions;
use bollard::models::{HostConfig, PortBinding as DockerPortBinding};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use slipway_core::{
    ExitStatus, LogStream, NetworkMode, ResourceUsage, SandboxError, SandboxHandle,
    SandboxRuntime, SandboxSpec, SandboxState,
};

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn op_error(operation: &'static str, handle: &SandboxHandle, err: &bollard::errors::Error) -> SandboxError {
    if is_not_found(err) {
        SandboxError::NotFound(handle.name.clone())
    } else {
        SandboxError::operation(operation, err.to_string())
    }
}

fn exit(code: i64) -> ExitStatus {
    ExitStatus {
        code,
        usage: ResourceUsage::default(),
    }
}

/// Sandbox runtime over the local Docker daemon
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    bind_host: String,
}

impl DockerRuntime {
    /// Wrap an existing client; leased ports are published on `bind_host`
    #[must_use]
    pub fn new(docker: Docker, bind_host: impl Into<String>) -> Self {
        Self {
            docker,
            bind_host: bind_host.into(),
        }
    }

    /// Connect with the platform defaults (unix socket / named pipe)
    pub fn connect_local(bind_host: impl Into<String>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;
        Ok(Self::new(docker, bind_host))
    }

    /// Check the daemon answers
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Unavailable(e.to_string()))
    }

    fn host_config(&self, spec: &SandboxSpec) -> HostConfig {
        let security = &spec.security;

        let mut security_opt = Vec::new();
        if security.no_new_privileges {
            security_opt.push("no-new-privileges:true".to_string());
        }
        if let Some(profile) = &security.seccomp_profile {
            security_opt.push(format!("seccomp={profile}"));
        }

        let tmpfs: HashMap<String, String> = security
            .scratch
            .iter()
            .map(|(path, size_mb)| (path.clone(), format!("rw,noexec,nosuid,size={size_mb}m")))
            .collect();

        let binds: Vec<String> = spec
            .binds
            .iter()
            .map(|b| {
                let mode = if b.read_only { "ro" } else { "rw" };
                format!("{}:{}:{mode}", b.source.display(), b.target)
            })
            .collect();

        let port_bindings = spec.port.map(|p| {
            HashMap::from([(
                format!("{}/tcp", p.container_port),
                Some(vec![DockerPortBinding {
                    host_ip: Some(self.bind_host.clone()),
                    host_port: Some(p.host_port.to_string()),
                }]),
            )])
        });

        let network_mode = match &spec.network {
            NetworkMode::None => "none".to_string(),
            NetworkMode::Segment(name) => name.clone(),
        };

        HostConfig {
            memory: i64::try_from(spec.limits.memory_bytes()).ok(),
            nano_cpus: i64::try_from(spec.limits.cpu_millicores)
                .ok()
                .map(|m| m * 1_000_000),
            pids_limit: Some(512),
            cap_drop: security
                .drop_all_capabilities
                .then(|| vec!["ALL".to_string()]),
            security_opt: (!security_opt.is_empty()).then_some(security_opt),
            readonly_rootfs: Some(security.read_only_root),
            tmpfs: (!tmpfs.is_empty()).then_some(tmpfs),
            binds: (!binds.is_empty()).then_some(binds),
            network_mode: Some(network_mode),
            port_bindings,
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let exposed_ports = spec.port.map(|p| {
            HashMap::from([(format!("{}/tcp", p.container_port), HashMap::new())])
        });

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            user: Some(spec.security.user.clone()),
            working_dir: spec.working_dir.clone(),
            labels: Some(labels),
            exposed_ports,
            network_disabled: Some(spec.network == NetworkMode::None),
            host_config: Some(self.host_config(spec)),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::operation("create", e.to_string()))?;

        tracing::debug!(sandbox = %spec.name, id = %response.id, "container created");
        Ok(SandboxHandle {
            id: response.id,
            name: spec.name.clone(),
            role: spec.role,
        })
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.docker
            .start_container::<String>(&handle.id, None)
            .await
            .map_err(|e| op_error("start", handle, &e))
    }

    async fn logs(&self, handle: &SandboxHandle) -> Result<LogStream, SandboxError> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        let name = handle.name.clone();
        let stream = self
            .docker
            .logs(&handle.id, Some(options))
            .map(move |chunk| match chunk {
                Ok(LogOutput::StdOut { message } | LogOutput::StdErr { message }) => {
                    Ok(String::from_utf8_lossy(&message).into_owned())
                }
                Ok(_) => Ok(String::new()),
                Err(e) => Err(SandboxError::operation(
                    "logs",
                    format!("{name}: {e}"),
                )),
            });
        Ok(stream.boxed())
    }

    async fn wait(&self, handle: &SandboxHandle) -> Result<ExitStatus, SandboxError> {
        let mut stream = self
            .docker
            .wait_container(&handle.id, None::<WaitContainerOptions<String>>);

        match stream.try_next().await {
            Ok(Some(response)) => Ok(exit(response.status_code)),
            // Non-zero exits surface as an error carrying the code
            Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => Ok(exit(code)),
            Ok(None) => match self.inspect(handle).await? {
                SandboxState::Exited { code } => Ok(exit(code)),
                state => Err(SandboxError::operation(
                    "wait",
                    format!("wait ended while container was {state:?}"),
                )),
            },
            Err(e) => Err(op_error("wait", handle, &e)),
        }
    }

    async fn inspect(&self, handle: &SandboxHandle) -> Result<SandboxState, SandboxError> {
        let details = match self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => details,
            Err(e) if is_not_found(&e) => return Ok(SandboxState::Missing),
            Err(e) => return Err(SandboxError::operation("inspect", e.to_string())),
        };

        let Some(state) = details.state else {
            return Ok(SandboxState::Created);
        };
        if state.running.unwrap_or(false) {
            return Ok(SandboxState::Running);
        }
        match state.exit_code {
            Some(code) if state.finished_at.as_deref().is_some_and(|t| !t.starts_with("0001")) => {
                Ok(SandboxState::Exited { code })
            }
            _ => Ok(SandboxState::Created),
        }
    }

    async fn commit(&self, handle: &SandboxHandle, reference: &str) -> Result<String, SandboxError> {
        let (repo, tag) = reference.rsplit_once(':').unwrap_or((reference, "latest"));
        let options = CommitContainerOptions {
            container: handle.id.as_str(),
            repo,
            tag,
            pause: true,
            ..Default::default()
        };

        self.docker
            .commit_container(options, Config::<String>::default())
            .await
            .map_err(|e| op_error("commit", handle, &e))?;

        let image = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(|e| SandboxError::operation("commit", e.to_string()))?;
        Ok(image.id.unwrap_or_else(|| reference.to_string()))
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &[String],
    ) -> Result<ExitStatus, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                &handle.id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| op_error("exec", handle, &e))?;

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| op_error("exec", handle, &e))?
        {
            while let Some(chunk) = output.next().await {
                if let Err(e) = chunk {
                    return Err(SandboxError::operation("exec", e.to_string()));
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::operation("exec", e.to_string()))?;
        Ok(exit(inspected.exit_code.unwrap_or(-1)))
    }

    async fn stop(&self, handle: &SandboxHandle, grace: Duration) -> Result<(), SandboxError> {
        let t = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
        match self
            .docker
            .stop_container(&handle.id, Some(StopContainerOptions { t }))
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(op_error("stop", handle, &e)),
        }
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        match self
            .docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(SandboxError::operation("remove", e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_core::{BindMount, PortBinding, ResourceLimits, SandboxRole, SecurityProfile};
    use std::collections::BTreeMap;

    fn runner_spec() -> SandboxSpec {
        SandboxSpec {
            name: "slipway-run-test".into(),
            role: SandboxRole::Runner,
            image: "sha256:abc".into(),
            command: vec!["npm".into(), "start".into()],
            env: BTreeMap::new(),
            binds: vec![BindMount {
                source: "/srv/project".into(),
                target: "/src".into(),
                read_only: true,
            }],
            working_dir: None,
            network: NetworkMode::Segment("slipway-run".into()),
            limits: ResourceLimits::new(512, 500),
            security: SecurityProfile {
                user: "10001:10001".into(),
                read_only_root: true,
                drop_all_capabilities: true,
                no_new_privileges: true,
                seccomp_profile: None,
                scratch: BTreeMap::from([("/tmp".to_string(), 64)]),
            },
            port: Some(PortBinding {
                container_port: 3000,
                host_port: 3005,
            }),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn host_config_is_hardened() {
        // Building a client does not contact the daemon
        let Ok(runtime) = DockerRuntime::connect_local("127.0.0.1") else {
            return;
        };
        let config = runtime.host_config(&runner_spec());

        assert_eq!(config.memory, Some(512 * 1024 * 1024));
        assert_eq!(config.nano_cpus, Some(500_000_000));
        assert_eq!(config.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(config.readonly_rootfs, Some(true));
        assert_eq!(
            config.security_opt,
            Some(vec!["no-new-privileges:true".to_string()])
        );
        assert_eq!(config.network_mode.as_deref(), Some("slipway-run"));
        assert_eq!(config.binds, Some(vec!["/srv/project:/src:ro".to_string()]));

        let tmpfs = config.tmpfs.unwrap();
        assert!(tmpfs["/tmp"].contains("size=64m"));

        let bindings = config.port_bindings.unwrap();
        let binding = &bindings["3000/tcp"].as_ref().unwrap()[0];
        assert_eq!(binding.host_port.as_deref(), Some("3005"));
        assert_eq!(binding.host_ip.as_deref(), Some("127.0.0.1"));
    }
}
