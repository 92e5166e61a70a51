//! Live instance view
//!
//! Authoritative in-process record of instances that hold (or are about to
//! hold) a port and a runner:
//! - `starting` instances together with the cancel handle of their health gate
//! - `healthy` / `unhealthy` instances
//!
//! Terminal instances leave the view; the store keeps their history.

use chrono::Utc;
use dashmap::DashMap;
use slipway_core::{
    CancelHandle, DeployError, Instance, InstanceId, InstanceStatus, ProjectId,
};

/// Instances currently starting or live
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    live: DashMap<InstanceId, Instance>,
    by_project: DashMap<ProjectId, InstanceId>,
    gates: DashMap<InstanceId, CancelHandle>,
}

impl InstanceRegistry {
    /// Create new registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a `starting` instance and the handle that cancels its gate
    pub fn begin(&self, instance: Instance, gate: CancelHandle) {
        let id = instance.id;
        self.gates.insert(id, gate);
        self.by_project.insert(instance.project_id, id);
        self.live.insert(id, instance);
    }

    /// Gate finished, one way or another
    pub fn settle(&self, id: InstanceId) {
        self.gates.remove(&id);
    }

    /// Cancel a pending health gate. Returns false if none is pending.
    pub fn cancel_gate(&self, id: InstanceId) -> bool {
        match self.gates.get(&id) {
            Some(gate) => {
                gate.cancel();
                true
            }
            None => false,
        }
    }

    /// Insert or replace an instance
    pub fn upsert(&self, instance: Instance) {
        self.by_project.insert(instance.project_id, instance.id);
        self.live.insert(instance.id, instance);
    }

    /// Drop an instance from the view
    pub fn remove(&self, id: InstanceId) -> Option<Instance> {
        let (_, instance) = self.live.remove(&id)?;
        self.by_project
            .remove_if(&instance.project_id, |_, current| *current == id);
        self.gates.remove(&id);
        Some(instance)
    }

    /// Instance by id
    #[must_use]
    pub fn get(&self, id: InstanceId) -> Option<Instance> {
        self.live.get(&id).map(|entry| entry.value().clone())
    }

    /// The project's current instance
    #[must_use]
    pub fn current(&self, project: ProjectId) -> Option<Instance> {
        let id = *self.by_project.get(&project)?;
        self.get(id)
    }

    /// Record an access; returns the updated instance
    pub fn touch(&self, id: InstanceId) -> Option<Instance> {
        let mut entry = self.live.get_mut(&id)?;
        entry.last_accessed_at = Utc::now();
        Some(entry.clone())
    }

    /// Apply `apply` if the instance is in one of `allowed_from`.
    ///
    /// # Errors
    /// - `DeployError::NotFound` if the instance is not live
    /// - `DeployError::InvalidState` if its status is not in `allowed_from`
    pub fn transition(
        &self,
        id: InstanceId,
        allowed_from: &[InstanceStatus],
        apply: impl FnOnce(&mut Instance),
    ) -> Result<Instance, DeployError> {
        let mut entry = self
            .live
            .get_mut(&id)
            .ok_or_else(|| DeployError::NotFound(format!("instance {id}")))?;

        if !allowed_from.contains(&entry.status) {
            return Err(DeployError::InvalidState(format!(
                "instance {id} is {}",
                entry.status
            )));
        }
        apply(&mut entry);
        Ok(entry.clone())
    }

    /// Copy of every tracked instance
    #[must_use]
    pub fn snapshot(&self) -> Vec<Instance> {
        self.live.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Number of tracked instances
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether nothing is tracked
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
