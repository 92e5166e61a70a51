//! Quota gate
//!
//! Per-user admission control. Every counter change is a read-modify-write
//! of the user's [`QuotaRecord`] committed with a versioned compare-and-swap,
//! so two concurrent admissions can never both pass on the same stale count.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use slipway_core::{
    AdmissionKind, DeploymentStore, QuotaBreach, QuotaLimits, QuotaRecord, StoreError, UserId,
};

use crate::policy::{apply_admission, apply_replacement, evaluate, handed_over, roll_windows};

/// Share of a monthly limit at which usage is logged as a warning
const WARN_THRESHOLD_PERCENT: u64 = 80;

/// Gate errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum QuotaError {
    /// Store round-trip failed
    #[error("quota store error: {0}")]
    Store(#[from] StoreError),

    /// Compare-and-swap kept losing to concurrent writers
    #[error("quota record contended after {attempts} attempts")]
    Contention { attempts: u32 },
}

/// Reason attached to a denial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyReason {
    /// Tripped limit; `None` for internal errors
    pub breach: Option<QuotaBreach>,
    /// Human-readable reason
    pub message: String,
}

impl DenyReason {
    fn internal(err: &QuotaError) -> Self {
        Self {
            breach: None,
            message: format!("internal-error: {err}"),
        }
    }

    /// Whether the gate failed closed rather than tripping a limit
    #[inline]
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.breach.is_none()
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Admission decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny(DenyReason),
}

impl Admission {
    #[inline]
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Per-user admission control
pub struct QuotaGate {
    store: Arc<dyn DeploymentStore>,
    defaults: QuotaLimits,
    max_cas_attempts: u32,
}

impl std::fmt::Debug for QuotaGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGate")
            .field("defaults", &self.defaults)
            .field("max_cas_attempts", &self.max_cas_attempts)
            .finish_non_exhaustive()
    }
}

impl QuotaGate {
    /// Create new gate; records are created lazily with `defaults`
    #[must_use]
    pub fn new(store: Arc<dyn DeploymentStore>, defaults: QuotaLimits) -> Self {
        Self {
            store,
            defaults,
            max_cas_attempts: 64,
        }
    }

    /// With compare-and-swap attempt budget
    #[inline]
    #[must_use]
    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    /// Admit or deny one operation of `kind`.
    ///
    /// Never fails: store errors deny with an `internal-error` reason.
    /// A denial sets the sticky exceeded flag.
    pub async fn admit(&self, user: UserId, kind: AdmissionKind) -> Admission {
        self.admit_with(user, kind, false).await
    }

    /// Admit a deploy that replaces one of the user's live instances.
    ///
    /// The replaced instance's concurrency slot is handed over, so the
    /// concurrency limit never denies it and `active_instances` is left
    /// unchanged. Every other limit applies as for
    /// [`AdmissionKind::DeployInstance`].
    pub async fn admit_replacement(&self, user: UserId) -> Admission {
        self.admit_with(user, AdmissionKind::DeployInstance, true).await
    }

    async fn admit_with(&self, user: UserId, kind: AdmissionKind, hand_over: bool) -> Admission {
        let result = self
            .update(user, |record| {
                let now = Utc::now();
                roll_windows(record, now);
                let verdict = if hand_over {
                    evaluate(&handed_over(record), kind)
                } else {
                    evaluate(record, kind)
                };
                match verdict {
                    Some(breach) => {
                        if !record.exceeded {
                            record.mark_exceeded(breach.kind, breach.message.clone());
                        }
                        Admission::Deny(DenyReason {
                            breach: Some(breach.kind),
                            message: breach.message,
                        })
                    }
                    None if hand_over => {
                        apply_replacement(record);
                        Admission::Allow
                    }
                    None => {
                        apply_admission(record, kind);
                        Admission::Allow
                    }
                }
            })
            .await;

        match result {
            Ok(Admission::Allow) => {
                tracing::debug!(user_id = %user, %kind, "admitted");
                Admission::Allow
            }
            Ok(Admission::Deny(reason)) => {
                tracing::info!(user_id = %user, %kind, reason = %reason, "admission denied");
                Admission::Deny(reason)
            }
            Err(e) => {
                tracing::warn!(user_id = %user, %kind, error = %e, "quota check failed, denying");
                Admission::Deny(DenyReason::internal(&e))
            }
        }
    }

    /// Record consumption after an admitted operation completes
    pub async fn record(
        &self,
        user: UserId,
        tokens: u64,
        cost: Decimal,
    ) -> Result<QuotaRecord, QuotaError> {
        let record = self
            .update(user, |record| {
                roll_windows(record, Utc::now());
                record.tokens_used_this_month =
                    record.tokens_used_this_month.saturating_add(tokens);
                record.cost_this_month += cost;
                record.clone()
            })
            .await?;

        warn_near_limit(&record);
        Ok(record)
    }

    /// Give back a concurrency slot (failed deploy or stopped instance)
    pub async fn release_instance(&self, user: UserId) -> Result<(), QuotaError> {
        self.update(user, |record| {
            record.active_instances = record.active_instances.saturating_sub(1);
            if record.exceeded_breach == Some(QuotaBreach::ConcurrentInstances)
                && record.active_instances < record.limits.concurrent_instance_limit
            {
                record.clear_exceeded();
            }
        })
        .await
    }

    /// Operator reset: clears the sticky flag and restarts every window.
    ///
    /// Live instances still count against the concurrency limit.
    pub async fn reset(&self, user: UserId) -> Result<(), QuotaError> {
        self.update(user, |record| {
            let now = Utc::now();
            record.clear_exceeded();
            record.tokens_used_this_month = 0;
            record.cost_this_month = Decimal::ZERO;
            record.month_window_start = now;
            record.requests_this_hour = 0;
            record.hour_window_start = now;
            record.builds_today = 0;
            record.day_window_start = now;
        })
        .await?;

        tracing::info!(user_id = %user, "quota reset");
        Ok(())
    }

    /// Replace a user's limits
    pub async fn set_limits(&self, user: UserId, limits: QuotaLimits) -> Result<(), QuotaError> {
        self.update(user, move |record| record.limits = limits.clone())
            .await
    }

    /// Current record, if one exists
    pub async fn snapshot(&self, user: UserId) -> Result<Option<QuotaRecord>, QuotaError> {
        Ok(self.store.get_quota(user).await?)
    }

    /// Compare-and-swap loop around `apply`.
    ///
    /// Unchanged records are not written back.
    async fn update<R, F>(&self, user: UserId, mut apply: F) -> Result<R, QuotaError>
    where
        F: FnMut(&mut QuotaRecord) -> R,
    {
        for _ in 0..self.max_cas_attempts {
            let (mut record, expected) = self.load(user, Utc::now()).await?;
            let original = record.clone();
            let out = apply(&mut record);

            if expected.is_some() && record == original {
                return Ok(out);
            }

            record.version = expected.map_or(1, |v| v + 1);
            if self.store.update_quota_counters(&record, expected).await? {
                return Ok(out);
            }
            tokio::task::yield_now().await;
        }

        Err(QuotaError::Contention {
            attempts: self.max_cas_attempts,
        })
    }

    async fn load(
        &self,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<(QuotaRecord, Option<u64>), QuotaError> {
        Ok(match self.store.get_quota(user).await? {
            Some(record) => {
                let version = record.version;
                (record, Some(version))
            }
            None => (QuotaRecord::new(user, self.defaults.clone(), now), None),
        })
    }
}

fn warn_near_limit(record: &QuotaRecord) {
    let limits = &record.limits;
    let token_threshold = limits.monthly_token_limit / 100 * WARN_THRESHOLD_PERCENT;
    if limits.monthly_token_limit > 0 && record.tokens_used_this_month >= token_threshold {
        tracing::warn!(
            user_id = %record.user_id,
            used = record.tokens_used_this_month,
            limit = limits.monthly_token_limit,
            "monthly token usage above {WARN_THRESHOLD_PERCENT}%"
        );
    }

    let cost_threshold =
        limits.monthly_cost_limit * Decimal::from(WARN_THRESHOLD_PERCENT) / Decimal::from(100u64);
    if limits.monthly_cost_limit > Decimal::ZERO && record.cost_this_month >= cost_threshold {
        tracing::warn!(
            user_id = %record.user_id,
            spent = %record.cost_this_month,
            limit = %limits.monthly_cost_limit,
            "monthly spend above {WARN_THRESHOLD_PERCENT}%"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_core::MemoryStore;

    fn gate() -> (Arc<MemoryStore>, QuotaGate) {
        let store = Arc::new(MemoryStore::new());
        let gate = QuotaGate::new(store.clone(), QuotaLimits::default());
        (store, gate)
    }

    #[tokio::test]
    async fn first_admission_creates_record() {
        let (_store, gate) = gate();
        let user = UserId::new();

        assert!(gate.snapshot(user).await.unwrap().is_none());
        assert!(gate.admit(user, AdmissionKind::Build).await.is_allowed());

        let record = gate.snapshot(user).await.unwrap().unwrap();
        assert_eq!(record.builds_today, 1);
        assert_eq!(record.requests_this_hour, 1);
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn record_then_admit_hits_token_limit() {
        let (store, gate) = gate();
        let user = UserId::new();
        let mut seeded = QuotaRecord::new(user, QuotaLimits::default(), Utc::now());
        seeded.tokens_used_this_month = 999_999;
        store.put_quota(seeded);

        assert!(gate.admit(user, AdmissionKind::AiRequest).await.is_allowed());
        gate.record(user, 2, Decimal::ZERO).await.unwrap();

        let Admission::Deny(reason) = gate.admit(user, AdmissionKind::AiRequest).await else {
            panic!("expected denial");
        };
        assert_eq!(reason.breach, Some(QuotaBreach::MonthlyTokens));
        assert!(reason.message.contains("monthly token limit"));

        let record = gate.snapshot(user).await.unwrap().unwrap();
        assert!(record.exceeded);
        assert_eq!(record.tokens_used_this_month, 1_000_001);
    }

    #[tokio::test]
    async fn admitted_but_unrecorded_work_is_free() {
        let (_store, gate) = gate();
        let user = UserId::new();

        assert!(gate.admit(user, AdmissionKind::AiRequest).await.is_allowed());
        let record = gate.snapshot(user).await.unwrap().unwrap();
        assert_eq!(record.tokens_used_this_month, 0);
        assert_eq!(record.cost_this_month, Decimal::ZERO);
    }

    #[tokio::test]
    async fn concurrency_slot_is_returned() {
        let (_store, gate) = gate();
        let user = UserId::new();
        let limits = QuotaLimits {
            concurrent_instance_limit: 1,
            ..QuotaLimits::default()
        };
        gate.set_limits(user, limits).await.unwrap();

        assert!(gate.admit(user, AdmissionKind::DeployInstance).await.is_allowed());
        assert!(!gate.admit(user, AdmissionKind::DeployInstance).await.is_allowed());

        gate.release_instance(user).await.unwrap();
        let record = gate.snapshot(user).await.unwrap().unwrap();
        assert_eq!(record.active_instances, 0);
        assert!(!record.exceeded);
        assert!(gate.admit(user, AdmissionKind::DeployInstance).await.is_allowed());
    }

    #[tokio::test]
    async fn replacement_at_the_limit_keeps_the_slot_count() {
        let (_store, gate) = gate();
        let user = UserId::new();
        let limits = QuotaLimits {
            concurrent_instance_limit: 1,
            ..QuotaLimits::default()
        };
        gate.set_limits(user, limits).await.unwrap();
        assert!(gate.admit(user, AdmissionKind::DeployInstance).await.is_allowed());

        assert!(gate.admit_replacement(user).await.is_allowed());

        let record = gate.snapshot(user).await.unwrap().unwrap();
        assert_eq!(record.active_instances, 1);
        assert!(!record.exceeded);
        assert!(gate.admit(user, AdmissionKind::Build).await.is_allowed());
    }

    #[tokio::test]
    async fn reset_clears_sticky_flag() {
        let (_store, gate) = gate();
        let user = UserId::new();
        gate.set_limits(
            user,
            QuotaLimits {
                requests_per_hour: 1,
                ..QuotaLimits::default()
            },
        )
        .await
        .unwrap();

        assert!(gate.admit(user, AdmissionKind::AiRequest).await.is_allowed());
        assert!(!gate.admit(user, AdmissionKind::AiRequest).await.is_allowed());

        gate.reset(user).await.unwrap();
        assert!(gate.admit(user, AdmissionKind::AiRequest).await.is_allowed());
    }

    #[tokio::test]
    async fn unchanged_denials_are_not_rewritten() {
        let (_store, gate) = gate();
        let user = UserId::new();
        gate.set_limits(
            user,
            QuotaLimits {
                requests_per_hour: 0,
                ..QuotaLimits::default()
            },
        )
        .await
        .unwrap();

        assert!(!gate.admit(user, AdmissionKind::AiRequest).await.is_allowed());
        let version = gate.snapshot(user).await.unwrap().unwrap().version;
        assert!(!gate.admit(user, AdmissionKind::AiRequest).await.is_allowed());
        assert_eq!(gate.snapshot(user).await.unwrap().unwrap().version, version);
    }
}
