//! Slipway Core
//!
//! Shared vocabulary for the deployment pipeline:
//! - Identifiers and the Build / Instance / Port Lease / Quota Record model
//! - The deploy error taxonomy with machine-readable reason codes
//! - Configuration loaded from TOML
//! - Collaborator interfaces: persistence ([`DeploymentStore`]) and the
//!   sandbox runtime ([`SandboxRuntime`])
//! - Lifecycle events and cancellation signals
//!
//! Nothing in this crate touches a container engine or a socket; the
//! concrete behaviour lives in `slipway-ports`, `slipway-quota`,
//! `slipway-sandbox` and `slipway-orchestrator`.

#![allow(missing_docs)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod runtime;
pub mod store;
pub mod types;

// Re-exports
pub use cancel::{CancelHandle, CancelToken};
pub use config::{BuildConfig, PortConfig, RuntimeConfig, SlipwayConfig};
pub use error::{
    BuildFailureReason, ConfigError, DeployError, SandboxError, Stage, StoreError,
};
pub use events::{EventBus, LifecycleEvent};
pub use runtime::{
    BindMount, ExitStatus, LogStream, NetworkMode, PortBinding, SandboxHandle, SandboxRole,
    SandboxRuntime, SandboxSpec, SandboxState, SecurityProfile,
};
pub use store::{DeploymentStore, MemoryStore};
pub use types::{
    AdmissionKind, Artifact, AutoSleepPolicy, Build, BuildId, BuildStatus, Instance, InstanceId,
    InstanceStatus, PortLease, ProjectId, QuotaBreach, QuotaLimits, QuotaRecord, ResourceLimits,
    ResourceUsage, UserId,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
