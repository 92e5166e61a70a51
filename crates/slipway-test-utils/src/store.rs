use std::sync::atomic::{AtomicBool, Ordering};

use slipway_core::{
    Build, BuildId, DeploymentStore, Instance, InstanceId, MemoryStore, QuotaRecord, StoreError,
    UserId,
};

/// [`MemoryStore`] that fails selected operations on demand
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_quota: AtomicBool,
    fail_builds: AtomicBool,
    fail_instances: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn fail_quota(&self, fail: bool) {
        self.fail_quota.store(fail, Ordering::SeqCst);
    }

    pub fn fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    pub fn fail_instances(&self, fail: bool) {
        self.fail_instances.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DeploymentStore for FailingStore {
    async fn create_build(&self, build: &Build) -> Result<(), StoreError> {
        Self::check(&self.fail_builds)?;
        self.inner.create_build(build).await
    }

    async fn update_build_status(&self, build: &Build) -> Result<(), StoreError> {
        Self::check(&self.fail_builds)?;
        self.inner.update_build_status(build).await
    }

    async fn get_build(&self, id: BuildId) -> Result<Option<Build>, StoreError> {
        self.inner.get_build(id).await
    }

    async fn create_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        Self::check(&self.fail_instances)?;
        self.inner.create_instance(instance).await
    }

    async fn update_instance_status(&self, instance: &Instance) -> Result<(), StoreError> {
        Self::check(&self.fail_instances)?;
        self.inner.update_instance_status(instance).await
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>, StoreError> {
        self.inner.get_instance(id).await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        self.inner.list_instances().await
    }

    async fn get_quota(&self, user: UserId) -> Result<Option<QuotaRecord>, StoreError> {
        Self::check(&self.fail_quota)?;
        self.inner.get_quota(user).await
    }

    async fn update_quota_counters(
        &self,
        record: &QuotaRecord,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        Self::check(&self.fail_quota)?;
        self.inner.update_quota_counters(record, expected_version).await
    }
}
