//! Per-project serialization
//!
//! At most one build/deploy/stop flow runs per project at a time. Flows for
//! different projects never contend.

use std::sync::Arc;

use dashmap::DashMap;
use slipway_core::ProjectId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held for the duration of one flow; dropping it lets the next one in
pub type ProjectGuard = OwnedMutexGuard<()>;

/// Table of per-project mutual-exclusion tokens
#[derive(Debug, Default)]
pub struct ProjectLocks {
    locks: DashMap<ProjectId, Arc<Mutex<()>>>,
}

impl ProjectLocks {
    /// Create new lock table
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `project`
    pub async fn acquire(&self, project: ProjectId) -> ProjectGuard {
        self.lock_for(project).lock_owned().await
    }

    /// Exclusive access to `project` if nobody holds it
    #[must_use]
    pub fn try_acquire(&self, project: ProjectId) -> Option<ProjectGuard> {
        self.lock_for(project).try_lock_owned().ok()
    }

    /// Number of projects seen so far
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no project has been locked yet
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn lock_for(&self, project: ProjectId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(project).or_default().value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_project_is_exclusive() {
        let locks = ProjectLocks::new();
        let project = ProjectId::new();

        let guard = locks.acquire(project).await;
        assert!(locks.try_acquire(project).is_none());

        let waiting = tokio::time::timeout(Duration::from_millis(20), locks.acquire(project)).await;
        assert!(waiting.is_err());

        drop(guard);
        assert!(locks.try_acquire(project).is_some());
    }

    #[tokio::test]
    async fn different_projects_do_not_contend() {
        let locks = ProjectLocks::new();
        let _a = locks.acquire(ProjectId::new()).await;
        let _b = locks.acquire(ProjectId::new()).await;
        assert_eq!(locks.len(), 2);
    }
}
