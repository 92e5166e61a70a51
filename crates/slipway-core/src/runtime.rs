//! Sandbox runtime interface
//!
//! The container engine is an injected collaborator. The builder and the
//! runner describe what they need as a [`SandboxSpec`]; the runtime enforces
//! limits and the security profile and reports exit status.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;
use crate::types::{ResourceLimits, ResourceUsage};

/// Which half of the builder/runner split a sandbox belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxRole {
    /// Ephemeral, runs untrusted build commands
    Builder,
    /// Long-lived, serves the built artifact
    Runner,
}

/// Network attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// No network at all
    None,
    /// A named, isolated segment
    Segment(String),
}

impl NetworkMode {
    /// "none" maps to [`NetworkMode::None`], anything else to a segment
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.is_empty() || name == "none" {
            Self::None
        } else {
            Self::Segment(name.to_string())
        }
    }
}

/// Host directory mounted into the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Publish a container port on a leased host port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
}

/// Hardening applied to a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityProfile {
    /// uid:gid the process runs as; never root
    pub user: String,
    pub read_only_root: bool,
    pub drop_all_capabilities: bool,
    pub no_new_privileges: bool,
    /// Seccomp profile name; `None` keeps the runtime default filter
    pub seccomp_profile: Option<String>,
    /// Writable tmpfs mounts: path -> size in MB
    pub scratch: BTreeMap<String, u64>,
}

/// Everything the runtime needs to create a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub name: String,
    pub role: SandboxRole,
    pub image: String,
    pub command: Vec<String>,
    /// Complete environment; nothing is inherited from the host
    pub env: BTreeMap<String, String>,
    pub binds: Vec<BindMount>,
    pub working_dir: Option<String>,
    pub network: NetworkMode,
    pub limits: ResourceLimits,
    pub security: SecurityProfile,
    pub port: Option<PortBinding>,
    pub labels: BTreeMap<String, String>,
}

/// Opaque runtime reference to a created sandbox
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
    pub name: String,
    pub role: SandboxRole,
}

/// Final status of a sandbox process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i64,
    pub usage: ResourceUsage,
}

impl ExitStatus {
    #[inline]
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Point-in-time sandbox state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxState {
    Created,
    Running,
    Exited { code: i64 },
    /// Unknown to the runtime (already removed)
    Missing,
}

/// Incremental combined stdout/stderr
pub type LogStream = BoxStream<'static, Result<String, SandboxError>>;

/// Capability set of the container / sandbox engine
#[async_trait::async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Create (but do not start) a sandbox
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError>;

    /// Start a created sandbox
    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Follow combined output until the sandbox exits
    async fn logs(&self, handle: &SandboxHandle) -> Result<LogStream, SandboxError>;

    /// Resolve when the sandbox process exits
    async fn wait(&self, handle: &SandboxHandle) -> Result<ExitStatus, SandboxError>;

    /// Current state
    async fn inspect(&self, handle: &SandboxHandle) -> Result<SandboxState, SandboxError>;

    /// Snapshot the sandbox filesystem into an image; returns the image id
    async fn commit(&self, handle: &SandboxHandle, reference: &str)
        -> Result<String, SandboxError>;

    /// Run a command inside a running sandbox
    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &[String],
    ) -> Result<ExitStatus, SandboxError>;

    /// Stop the process, killing it after `grace`
    async fn stop(&self, handle: &SandboxHandle, grace: Duration) -> Result<(), SandboxError>;

    /// Remove the sandbox and anything it mounted
    async fn remove(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;
}
