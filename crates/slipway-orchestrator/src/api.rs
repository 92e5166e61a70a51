//! Typed admission / lifecycle API
//!
//! The surface a web layer maps onto `POST build`, `POST deploy`,
//! `DELETE instance` and `GET instance`. Requests and responses are plain
//! serde structs; every error carries a machine-readable code and, for
//! failed builds, the captured logs.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use slipway_core::{
    Build, BuildId, BuildStatus, DeployError, Instance, InstanceId, InstanceStatus, ProjectId,
    UserId,
};

use crate::orchestrator::DeploymentOrchestrator;

/// `POST build`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Caller; quota is charged to this user
    pub user_id: UserId,
    /// Project to build
    pub project_id: ProjectId,
    /// Project source tree on the host
    pub source: PathBuf,
}

/// `POST deploy`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Caller; must own the build
    pub user_id: UserId,
    /// Project to deploy; its live instance is replaced
    pub project_id: ProjectId,
    /// A succeeded build of `project_id`
    pub build_id: BuildId,
}

/// Build as returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildView {
    /// Id to pass to `POST deploy`
    pub build_id: BuildId,
    /// Owning project
    pub project_id: ProjectId,
    /// Final state of the build
    pub status: BuildStatus,
    /// Image reference, once the build succeeded
    pub artifact: Option<String>,
    /// Captured build output
    pub logs: String,
}

impl From<&Build> for BuildView {
    fn from(build: &Build) -> Self {
        Self {
            build_id: build.id,
            project_id: build.project_id,
            status: build.status,
            artifact: build.artifact.as_ref().map(|a| a.image.clone()),
            logs: build.logs.clone(),
        }
    }
}

/// `GET instance` body: `{status, port, host}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceView {
    /// Id for `GET` and `DELETE instance`
    pub instance_id: InstanceId,
    /// Lifecycle state
    pub status: InstanceStatus,
    /// Only reported once the health gate has passed
    pub port: Option<u16>,
    /// Host the port is bound on
    pub host: String,
}

impl From<&Instance> for InstanceView {
    fn from(instance: &Instance) -> Self {
        Self {
            instance_id: instance.id,
            status: instance.status,
            port: instance
                .status
                .is_live()
                .then(|| instance.port())
                .flatten(),
            host: instance.host.clone(),
        }
    }
}

/// Error body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    /// Stable reason code, e.g. `quota_exceeded`
    pub code: String,
    /// Human-readable detail
    pub message: String,
    /// Captured logs, for failed builds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    /// Whether retrying later may succeed
    pub retryable: bool,
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        Self {
            code: err.code().to_string(),
            logs: err.logs().map(str::to_string),
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

/// Lifecycle API over a shared orchestrator
#[derive(Debug, Clone)]
pub struct LifecycleApi {
    orchestrator: Arc<DeploymentOrchestrator>,
}

impl LifecycleApi {
    /// Create new API
    #[must_use]
    pub fn new(orchestrator: Arc<DeploymentOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Underlying orchestrator
    #[inline]
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<DeploymentOrchestrator> {
        &self.orchestrator
    }

    /// `POST build(projectId)`
    pub async fn build(&self, request: BuildRequest) -> Result<BuildView, ApiError> {
        let build = self
            .orchestrator
            .build(request.user_id, request.project_id, &request.source)
            .await?;
        Ok(BuildView::from(&build))
    }

    /// `POST deploy(projectId, buildId)`
    pub async fn deploy(&self, request: DeployRequest) -> Result<InstanceView, ApiError> {
        let instance = self
            .orchestrator
            .deploy(request.user_id, request.project_id, request.build_id)
            .await?;
        Ok(InstanceView::from(&instance))
    }

    /// `DELETE instance(instanceId)`
    pub async fn delete_instance(
        &self,
        user: UserId,
        id: InstanceId,
    ) -> Result<InstanceView, ApiError> {
        self.owned_instance(user, id).await?;
        let stopped = self.orchestrator.stop(id).await?;
        Ok(InstanceView::from(&stopped))
    }

    /// `GET instance(instanceId)`
    ///
    /// Only the owner's reads count as activity.
    pub async fn get_instance(&self, user: UserId, id: InstanceId) -> Result<InstanceView, ApiError> {
        self.owned_instance(user, id).await?;
        let instance = self.orchestrator.get_instance(id).await?;
        Ok(InstanceView::from(&instance))
    }

    async fn owned_instance(&self, user: UserId, id: InstanceId) -> Result<Instance, DeployError> {
        let instance = self.orchestrator.peek_instance(id).await?;
        if instance.user_id != user {
            return Err(DeployError::Forbidden(format!(
                "instance {id} belongs to another user"
            )));
        }
        Ok(instance)
    }
}
