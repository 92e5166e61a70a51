//! Persistence interface
//!
//! The orchestrator reads and writes Build, Instance and Quota rows through
//! [`DeploymentStore`] and never embeds backend-specific queries.
//! [`MemoryStore`] is the in-process implementation used by tests and by the
//! CLI.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::StoreError;
use crate::types::{Build, BuildId, Instance, InstanceId, QuotaRecord, UserId};

/// Narrow repository over the durable rows
#[async_trait::async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new build row
    async fn create_build(&self, build: &Build) -> Result<(), StoreError>;

    /// Overwrite a build row's status, logs and result
    async fn update_build_status(&self, build: &Build) -> Result<(), StoreError>;

    /// Fetch a build
    async fn get_build(&self, id: BuildId) -> Result<Option<Build>, StoreError>;

    /// Insert a new instance row
    async fn create_instance(&self, instance: &Instance) -> Result<(), StoreError>;

    /// Overwrite an instance row's status and runtime fields
    async fn update_instance_status(&self, instance: &Instance) -> Result<(), StoreError>;

    /// Fetch an instance
    async fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>, StoreError>;

    /// All instance rows
    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError>;

    /// Fetch a user's quota record
    async fn get_quota(&self, user: UserId) -> Result<Option<QuotaRecord>, StoreError>;

    /// Compare-and-swap a quota record.
    ///
    /// Writes `record` only if the stored row's version equals
    /// `expected_version` (`None`: only if no row exists). Returns whether
    /// the write happened.
    async fn update_quota_counters(
        &self,
        record: &QuotaRecord,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    builds: RwLock<HashMap<BuildId, Build>>,
    instances: RwLock<HashMap<InstanceId, Instance>>,
    quotas: RwLock<HashMap<UserId, QuotaRecord>>,
}

impl MemoryStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of build rows
    #[must_use]
    pub fn build_count(&self) -> usize {
        self.builds.read().len()
    }

    /// Seed or overwrite a quota record, bypassing the version check
    pub fn put_quota(&self, record: QuotaRecord) {
        self.quotas.write().insert(record.user_id, record);
    }
}

#[async_trait::async_trait]
impl DeploymentStore for MemoryStore {
    async fn create_build(&self, build: &Build) -> Result<(), StoreError> {
        let mut builds = self.builds.write();
        if builds.contains_key(&build.id) {
            return Err(StoreError::Conflict(format!("build {}", build.id)));
        }
        builds.insert(build.id, build.clone());
        Ok(())
    }

    async fn update_build_status(&self, build: &Build) -> Result<(), StoreError> {
        let mut builds = self.builds.write();
        let row = builds
            .get_mut(&build.id)
            .ok_or_else(|| StoreError::NotFound(format!("build {}", build.id)))?;
        *row = build.clone();
        Ok(())
    }

    async fn get_build(&self, id: BuildId) -> Result<Option<Build>, StoreError> {
        Ok(self.builds.read().get(&id).cloned())
    }

    async fn create_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        if instances.contains_key(&instance.id) {
            return Err(StoreError::Conflict(format!("instance {}", instance.id)));
        }
        instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn update_instance_status(&self, instance: &Instance) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let row = instances
            .get_mut(&instance.id)
            .ok_or_else(|| StoreError::NotFound(format!("instance {}", instance.id)))?;
        *row = instance.clone();
        Ok(())
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>, StoreError> {
        Ok(self.instances.read().get(&id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        Ok(self.instances.read().values().cloned().collect())
    }

    async fn get_quota(&self, user: UserId) -> Result<Option<QuotaRecord>, StoreError> {
        Ok(self.quotas.read().get(&user).cloned())
    }

    async fn update_quota_counters(
        &self,
        record: &QuotaRecord,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut quotas = self.quotas.write();
        let current = quotas.get(&record.user_id).map(|r| r.version);
        if current != expected_version {
            return Ok(false);
        }
        quotas.insert(record.user_id, record.clone());
        Ok(true)
    }
}
