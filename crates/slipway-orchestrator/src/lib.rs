//! Slipway Orchestrator
//!
//! Turns a build request into a supervised, resource-bounded, health-verified
//! running instance:
//! - [`DeploymentOrchestrator`] owns the build -> deploy -> stop lifecycle and
//!   its rollback
//! - [`ProjectLocks`] serializes flows per project
//! - [`InstanceRegistry`] is the live view of starting and running instances
//! - [`LifecycleApi`] is the typed surface for a web layer

pub mod api;
pub mod instances;
pub mod locks;
pub mod orchestrator;

pub use api::{ApiError, BuildRequest, BuildView, DeployRequest, InstanceView, LifecycleApi};
pub use instances::InstanceRegistry;
pub use locks::{ProjectGuard, ProjectLocks};
pub use orchestrator::{Deployment, DeploymentOrchestrator, RecoveryReport};
