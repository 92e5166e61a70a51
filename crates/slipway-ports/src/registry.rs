//! Port lease registry
//!
//! Owns a fixed pool of host ports:
//! - Idempotent allocation (a project holds at most one lease)
//! - Unconditional release by port, guarded release by lease id
//! - Recovery of persisted leases after a restart
//! - Pool statistics
//!
//! Every port is at all times either in the free set or leased to exactly
//! one project.

use std::collections::{BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slipway_core::{CancelToken, DeployError, PortConfig, PortLease, ProjectId};

use crate::probe::HealthProbe;
use crate::retry::{retry_until, RetryOutcome, RetryPolicy};

/// Lease errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    /// No free port left
    #[error("port pool exhausted (size: {size})")]
    PoolExhausted { size: usize },

    /// Port is not part of the pool
    #[error("port {0} is outside the pool")]
    PortOutOfRange(u16),

    /// Port already leased, or the project already holds another port
    #[error("port {port} already leased to project {holder}")]
    PortInUse { port: u16, holder: ProjectId },
}

impl From<LeaseError> for DeployError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::PoolExhausted { .. } => DeployError::PortPoolExhausted,
            other => DeployError::InvalidState(other.to_string()),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Total ports in the pool
    pub size: usize,
    /// Ports available for allocation
    pub free: usize,
    /// Ports currently leased
    pub leased: usize,
    /// Leased share of the pool, 0-100
    pub utilization_percent: f64,
}

#[derive(Debug)]
struct LeaseTable {
    free: BTreeSet<u16>,
    leased: HashMap<u16, PortLease>,
    by_project: HashMap<ProjectId, u16>,
}

impl LeaseTable {
    fn insert(&mut self, lease: PortLease) {
        self.free.remove(&lease.port);
        self.by_project.insert(lease.holder, lease.port);
        self.leased.insert(lease.port, lease);
    }

    fn remove(&mut self, port: u16) -> Option<PortLease> {
        let lease = self.leased.remove(&port)?;
        self.by_project.remove(&lease.holder);
        self.free.insert(port);
        Some(lease)
    }
}

/// Registry of port leases
pub struct PortLeaseRegistry {
    range: RangeInclusive<u16>,
    probe_host: String,
    probe: Arc<dyn HealthProbe>,
    inner: Mutex<LeaseTable>,
}

impl std::fmt::Debug for PortLeaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLeaseRegistry")
            .field("range", &self.range)
            .field("probe_host", &self.probe_host)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl PortLeaseRegistry {
    /// Create new registry over `range` (inclusive)
    #[must_use]
    pub fn new(
        range: RangeInclusive<u16>,
        probe_host: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let free = range.clone().collect();
        Self {
            range,
            probe_host: probe_host.into(),
            probe,
            inner: Mutex::new(LeaseTable {
                free,
                leased: HashMap::new(),
                by_project: HashMap::new(),
            }),
        }
    }

    /// Create registry from the `[ports]` config section
    #[must_use]
    pub fn from_config(config: &PortConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self::new(
            config.range_start..=config.range_end,
            config.probe_host.clone(),
            probe,
        )
    }

    /// Lease a port for `project`.
    ///
    /// Idempotent: a project that already holds a lease gets the same lease
    /// back and the pool is not touched.
    ///
    /// # Errors
    /// - `LeaseError::PoolExhausted` if no port is free; no state changes
    pub fn allocate(&self, project: ProjectId) -> Result<PortLease, LeaseError> {
        let mut table = self.inner.lock();

        if let Some(port) = table.by_project.get(&project).copied() {
            if let Some(existing) = table.leased.get(&port) {
                return Ok(existing.clone());
            }
        }

        let size = self.size();
        let port = table
            .free
            .pop_first()
            .ok_or(LeaseError::PoolExhausted { size })?;

        let lease = PortLease {
            port,
            holder: project,
            lease_id: uuid::Uuid::new_v4(),
            allocated_at: Utc::now(),
        };
        table.insert(lease.clone());
        drop(table);

        tracing::info!(port, project_id = %project, "port leased");
        Ok(lease)
    }

    /// Return `port` to the free set. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) -> Option<PortLease> {
        let released = self.inner.lock().remove(port);
        if let Some(lease) = &released {
            tracing::info!(port, project_id = %lease.holder, "port released");
        }
        released
    }

    /// Release `lease` only if the port is still held under the same lease id
    pub fn release_lease(&self, lease: &PortLease) -> bool {
        let mut table = self.inner.lock();
        let current = table.leased.get(&lease.port).map(|l| l.lease_id);
        if current != Some(lease.lease_id) {
            return false;
        }
        table.remove(lease.port);
        drop(table);

        tracing::info!(port = lease.port, project_id = %lease.holder, "lease released");
        true
    }

    /// Lease currently held by `project`
    #[must_use]
    pub fn lease_for(&self, project: ProjectId) -> Option<PortLease> {
        let table = self.inner.lock();
        let port = table.by_project.get(&project)?;
        table.leased.get(port).cloned()
    }

    /// Re-establish a lease recorded before a restart.
    ///
    /// Restoring an identical lease is a no-op.
    ///
    /// # Errors
    /// - `LeaseError::PortOutOfRange` if the port is not in this pool
    /// - `LeaseError::PortInUse` if the port, or the project, is taken
    pub fn restore(&self, lease: PortLease) -> Result<(), LeaseError> {
        if !self.range.contains(&lease.port) {
            return Err(LeaseError::PortOutOfRange(lease.port));
        }

        let mut table = self.inner.lock();
        if let Some(existing) = table.leased.get(&lease.port) {
            if *existing == lease {
                return Ok(());
            }
            return Err(LeaseError::PortInUse {
                port: lease.port,
                holder: existing.holder,
            });
        }
        if let Some(port) = table.by_project.get(&lease.holder).copied() {
            return Err(LeaseError::PortInUse {
                port,
                holder: lease.holder,
            });
        }

        let (port, holder) = (lease.port, lease.holder);
        table.insert(lease);
        drop(table);

        tracing::info!(port, project_id = %holder, "lease restored");
        Ok(())
    }

    /// Total ports in the pool
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.range.clone().count()
    }

    /// Snapshot of pool usage
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let table = self.inner.lock();
        let size = self.size();
        let leased = table.leased.len();
        #[allow(clippy::cast_precision_loss)]
        let utilization_percent = if size == 0 {
            0.0
        } else {
            leased as f64 * 100.0 / size as f64
        };
        PoolStats {
            size,
            free: table.free.len(),
            leased,
            utilization_percent,
        }
    }

    /// Host the probes connect to
    #[inline]
    #[must_use]
    pub fn probe_host(&self) -> &str {
        &self.probe_host
    }

    /// Probe `port` up to `max_attempts` times, `interval` apart.
    ///
    /// Does not touch lease state.
    pub async fn health_check(&self, port: u16, max_attempts: u32, interval: Duration) -> bool {
        self.health_gate(
            port,
            RetryPolicy::new(max_attempts, interval),
            &CancelToken::never(),
        )
        .await
        .is_ready()
    }

    /// Cancellable form of [`Self::health_check`]
    pub async fn health_gate(
        &self,
        port: u16,
        policy: RetryPolicy,
        cancel: &CancelToken,
    ) -> RetryOutcome<()> {
        let outcome = retry_until(policy, cancel, |attempt| async move {
            let ok = self.probe.probe(&self.probe_host, port).await;
            tracing::debug!(port, attempt, ok, "health probe");
            ok.then_some(())
        })
        .await;

        match &outcome {
            RetryOutcome::Ready(()) => tracing::debug!(port, "health gate passed"),
            RetryOutcome::Exhausted { attempts } => {
                tracing::warn!(port, attempts, "health gate exhausted");
            }
            RetryOutcome::Cancelled => tracing::info!(port, "health gate cancelled"),
        }
        outcome
    }

    /// Single probe, used for periodic health refresh
    pub async fn probe_once(&self, port: u16) -> bool {
        self.probe.probe(&self.probe_host, port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProbe {
        healthy_after: u32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl HealthProbe for CountingProbe {
        async fn probe(&self, _host: &str, _port: u16) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.healthy_after
        }
    }

    fn registry(range: RangeInclusive<u16>) -> PortLeaseRegistry {
        PortLeaseRegistry::new(
            range,
            "127.0.0.1",
            Arc::new(CountingProbe {
                healthy_after: u32::MAX,
                calls: AtomicU32::new(0),
            }),
        )
    }

    #[test]
    fn allocate_is_idempotent_per_project() {
        let registry = registry(3001..=3100);
        let project = ProjectId::new();

        let first = registry.allocate(project).unwrap();
        let second = registry.allocate(project).unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.stats().free, 99);
        assert_eq!(registry.stats().leased, 1);
    }

    #[test]
    fn lowest_free_port_first() {
        let registry = registry(3001..=3003);
        let a = registry.allocate(ProjectId::new()).unwrap();
        let b = registry.allocate(ProjectId::new()).unwrap();
        assert_eq!((a.port, b.port), (3001, 3002));

        registry.release(3001);
        let c = registry.allocate(ProjectId::new()).unwrap();
        assert_eq!(c.port, 3001);
    }

    #[test]
    fn exhaustion_is_an_error_and_mutates_nothing() {
        let registry = registry(3001..=3100);
        for _ in 0..100 {
            registry.allocate(ProjectId::new()).unwrap();
        }
        let before = registry.stats();

        let err = registry.allocate(ProjectId::new()).unwrap_err();
        assert_eq!(err, LeaseError::PoolExhausted { size: 100 });
        assert_eq!(registry.stats(), before);
        assert!((before.utilization_percent - 100.0).abs() < f64::EPSILON);

        let deploy: DeployError = err.into();
        assert_eq!(deploy.code(), "port_pool_exhausted");
    }

    #[test]
    fn release_is_idempotent() {
        let registry = registry(3001..=3010);
        let lease = registry.allocate(ProjectId::new()).unwrap();

        assert!(registry.release(lease.port).is_some());
        assert!(registry.release(lease.port).is_none());
        assert!(registry.release(9999).is_none());
        assert_eq!(registry.stats().free, 10);
    }

    #[test]
    fn guarded_release_ignores_stale_leases() {
        let registry = registry(3001..=3001);
        let project = ProjectId::new();
        let stale = registry.allocate(project).unwrap();
        registry.release(stale.port);

        let fresh = registry.allocate(ProjectId::new()).unwrap();
        assert_eq!(fresh.port, stale.port);

        assert!(!registry.release_lease(&stale));
        assert_eq!(registry.stats().leased, 1);
        assert!(registry.release_lease(&fresh));
        assert_eq!(registry.stats().leased, 0);
        assert!(registry.lease_for(project).is_none());
    }

    #[test]
    fn restore_reclaims_persisted_lease() {
        let registry = registry(3001..=3010);
        let project = ProjectId::new();
        let lease = PortLease {
            port: 3005,
            holder: project,
            lease_id: uuid::Uuid::new_v4(),
            allocated_at: Utc::now(),
        };

        registry.restore(lease.clone()).unwrap();
        registry.restore(lease.clone()).unwrap();
        assert_eq!(registry.lease_for(project), Some(lease.clone()));
        assert_eq!(registry.allocate(project).unwrap(), lease);
        assert_eq!(registry.stats().free, 9);

        let clash = PortLease {
            holder: ProjectId::new(),
            lease_id: uuid::Uuid::new_v4(),
            ..lease
        };
        assert!(matches!(
            registry.restore(clash),
            Err(LeaseError::PortInUse { port: 3005, .. })
        ));

        let outside = PortLease {
            port: 80,
            holder: ProjectId::new(),
            lease_id: uuid::Uuid::new_v4(),
            allocated_at: Utc::now(),
        };
        assert_eq!(registry.restore(outside), Err(LeaseError::PortOutOfRange(80)));
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_returns_on_first_success() {
        let probe = Arc::new(CountingProbe {
            healthy_after: 2,
            calls: AtomicU32::new(0),
        });
        let registry = PortLeaseRegistry::new(3001..=3001, "127.0.0.1", probe.clone());

        assert!(registry.health_check(3001, 5, Duration::from_millis(10)).await);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_gives_up_after_budget() {
        let registry = registry(3001..=3001);
        let lease = registry.allocate(ProjectId::new()).unwrap();

        assert!(!registry.health_check(lease.port, 3, Duration::from_secs(1)).await);
        // Probing never touches lease state
        assert_eq!(registry.lease_for(lease.holder), Some(lease));
    }
}
