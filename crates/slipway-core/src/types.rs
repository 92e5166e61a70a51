//! Core data model
//!
//! Defines the entities the orchestrator coordinates:
//! - Builds and their artifacts
//! - Instances (previews / deployments) and their resource limits
//! - Port leases
//! - Per-user quota records

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::runtime::SandboxHandle;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            /// Generate a fresh random identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Owning user of projects, builds and quota
    UserId
);
uuid_id!(
    /// Project whose source tree is built and deployed
    ProjectId
);
uuid_id!(
    /// A single build attempt
    BuildId
);
uuid_id!(
    /// A running (or once running) instance of a build
    InstanceId
);

/// Build lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Accepted, sandbox not yet started
    Queued,
    /// Build command executing in the sandbox
    Running,
    /// Artifact produced
    Succeeded,
    /// Non-zero exit, timeout or runtime failure
    Failed,
    /// Stopped on request
    Cancelled,
}

impl BuildStatus {
    /// Terminal statuses never change again
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Stable lower-case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources consumed by a sandbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Peak memory in bytes
    pub memory_bytes: u64,
    /// CPU time in milliseconds
    pub cpu_time_ms: u64,
}

/// Reference to a build output that a runner can be started from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Image id (or equivalent runtime reference)
    pub image: String,
    /// Build that produced it
    pub build_id: BuildId,
    /// When the artifact was committed
    pub created_at: DateTime<Utc>,
}

/// A build attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub status: BuildStatus,
    /// Combined stdout/stderr captured from the builder
    pub logs: String,
    /// Error detail for failed/cancelled builds
    pub error: Option<String>,
    pub exit_code: Option<i64>,
    pub artifact: Option<Artifact>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub usage: ResourceUsage,
}

impl Build {
    /// Create a queued build
    #[must_use]
    pub fn queued(project_id: ProjectId, user_id: UserId) -> Self {
        Self {
            id: BuildId::new(),
            project_id,
            user_id,
            status: BuildStatus::Queued,
            logs: String::new(),
            error: None,
            exit_code: None,
            artifact: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            usage: ResourceUsage::default(),
        }
    }

    /// Move to `running`. Returns false if the build is already terminal.
    pub fn mark_running(&mut self) -> bool {
        if self.status != BuildStatus::Queued {
            return false;
        }
        self.status = BuildStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Record a successful build
    pub fn succeed(&mut self, artifact: Artifact, logs: String, usage: ResourceUsage) -> bool {
        if !self.finish(BuildStatus::Succeeded, logs, usage) {
            return false;
        }
        self.exit_code = Some(0);
        self.artifact = Some(artifact);
        true
    }

    /// Record a failed build
    pub fn fail(
        &mut self,
        exit_code: Option<i64>,
        error: impl Into<String>,
        logs: String,
        usage: ResourceUsage,
    ) -> bool {
        if !self.finish(BuildStatus::Failed, logs, usage) {
            return false;
        }
        self.exit_code = exit_code;
        self.error = Some(error.into());
        true
    }

    /// Record a cancelled build
    pub fn cancel(&mut self, logs: String) -> bool {
        if !self.finish(BuildStatus::Cancelled, logs, ResourceUsage::default()) {
            return false;
        }
        self.error = Some("cancelled".to_string());
        true
    }

    fn finish(&mut self, status: BuildStatus, logs: String, usage: ResourceUsage) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.logs = logs;
        self.usage = usage;
        self.finished_at = Some(Utc::now());
        true
    }
}

/// Instance lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Container started, health gate not yet passed
    Starting,
    /// Passed the health gate; externally reachable
    Healthy,
    /// Was healthy, a later probe failed
    Unhealthy,
    /// Stopped on request or by inactivity
    Stopped,
    /// Never became healthy, or crashed while gating
    Failed,
}

impl InstanceStatus {
    /// Healthy or unhealthy: a container is running and a lease is held
    #[inline]
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Healthy | Self::Unhealthy)
    }

    /// Stopped or failed
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Stable lower-case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory / CPU ceilings for a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in MB
    pub memory_mb: u64,
    /// CPU ceiling in millicores (1000 = one core)
    pub cpu_millicores: u64,
}

impl ResourceLimits {
    /// Create new limits
    #[inline]
    #[must_use]
    pub fn new(memory_mb: u64, cpu_millicores: u64) -> Self {
        Self {
            memory_mb,
            cpu_millicores,
        }
    }

    /// Memory ceiling in bytes
    #[inline]
    #[must_use]
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb * 1024 * 1024
    }
}

/// Inactivity policy for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSleepPolicy {
    pub enabled: bool,
    /// Idle time after which the instance is stopped
    pub idle_timeout_secs: u64,
}

impl AutoSleepPolicy {
    /// Whether an instance last accessed at `last_accessed` is idle at `now`
    #[must_use]
    pub fn is_idle(&self, last_accessed: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let Some(timeout) = i64::try_from(self.idle_timeout_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds)
        else {
            return false;
        };
        self.enabled && now - last_accessed > timeout
    }
}

impl Default for AutoSleepPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout_secs: 30 * 60,
        }
    }
}

/// Exclusive claim on one port for one project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLease {
    pub port: u16,
    pub holder: ProjectId,
    /// Distinguishes successive leases of the same port
    pub lease_id: uuid::Uuid,
    pub allocated_at: DateTime<Utc>,
}

/// A preview / deployment instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub build_id: BuildId,
    pub runtime_handle: Option<SandboxHandle>,
    pub host: String,
    pub lease: Option<PortLease>,
    pub status: InstanceStatus,
    pub limits: ResourceLimits,
    pub auto_sleep: AutoSleepPolicy,
    /// Failure detail for failed instances
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl Instance {
    /// New instance in `starting`, holding `lease`
    #[must_use]
    pub fn starting(
        build: &Build,
        host: impl Into<String>,
        lease: PortLease,
        limits: ResourceLimits,
        auto_sleep: AutoSleepPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(),
            project_id: build.project_id,
            user_id: build.user_id,
            build_id: build.id,
            runtime_handle: None,
            host: host.into(),
            lease: Some(lease),
            status: InstanceStatus::Starting,
            limits,
            auto_sleep,
            error: None,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
        }
    }

    /// Leased port, if any
    #[inline]
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.lease.as_ref().map(|l| l.port)
    }

    /// Set status and bump `updated_at`
    pub fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Operation kinds subject to admission control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionKind {
    Build,
    DeployInstance,
    AiRequest,
}

impl std::fmt::Display for AdmissionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Build => f.write_str("build"),
            Self::DeployInstance => f.write_str("deploy-instance"),
            Self::AiRequest => f.write_str("ai-request"),
        }
    }
}

/// Per-user limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub monthly_token_limit: u64,
    /// Monthly spend ceiling in USD
    pub monthly_cost_limit: Decimal,
    pub concurrent_instance_limit: u32,
    pub requests_per_hour: u32,
    pub builds_per_day: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            monthly_token_limit: 1_000_000,
            monthly_cost_limit: Decimal::new(5000, 2),
            concurrent_instance_limit: 3,
            requests_per_hour: 100,
            builds_per_day: 50,
        }
    }
}

/// Which limit a denial tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaBreach {
    MonthlyTokens,
    MonthlyCost,
    ConcurrentInstances,
    DailyBuilds,
    HourlyRate,
    /// Sticky flag set without a recorded breach kind
    Sticky,
}

impl QuotaBreach {
    /// Stable lower-case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MonthlyTokens => "monthly_token_limit",
            Self::MonthlyCost => "monthly_cost_limit",
            Self::ConcurrentInstances => "concurrent_instance_limit",
            Self::DailyBuilds => "daily_build_limit",
            Self::HourlyRate => "hourly_request_limit",
            Self::Sticky => "quota_exceeded",
        }
    }
}

impl std::fmt::Display for QuotaBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-user quota counters and limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub user_id: UserId,
    pub limits: QuotaLimits,

    pub tokens_used_this_month: u64,
    pub cost_this_month: Decimal,
    pub month_window_start: DateTime<Utc>,

    pub active_instances: u32,

    pub requests_this_hour: u32,
    pub hour_window_start: DateTime<Utc>,

    pub builds_today: u32,
    pub day_window_start: DateTime<Utc>,

    /// Sticky until the owning window rolls over or an operator resets it
    pub exceeded: bool,
    pub exceeded_reason: Option<String>,
    pub exceeded_breach: Option<QuotaBreach>,

    /// Compare-and-swap version; bumped on every write
    pub version: u64,
}

impl QuotaRecord {
    /// Fresh record with all windows starting at `now`
    #[must_use]
    pub fn new(user_id: UserId, limits: QuotaLimits, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            limits,
            tokens_used_this_month: 0,
            cost_this_month: Decimal::ZERO,
            month_window_start: now,
            active_instances: 0,
            requests_this_hour: 0,
            hour_window_start: now,
            builds_today: 0,
            day_window_start: now,
            exceeded: false,
            exceeded_reason: None,
            exceeded_breach: None,
            version: 0,
        }
    }

    /// Whether `now` falls in a later calendar month than the month window
    #[must_use]
    pub fn month_elapsed(&self, now: DateTime<Utc>) -> bool {
        (now.year(), now.month())
            > (
                self.month_window_start.year(),
                self.month_window_start.month(),
            )
    }

    /// Set the sticky flag
    pub fn mark_exceeded(&mut self, breach: QuotaBreach, reason: impl Into<String>) {
        self.exceeded = true;
        self.exceeded_breach = Some(breach);
        self.exceeded_reason = Some(reason.into());
    }

    /// Clear the sticky flag
    pub fn clear_exceeded(&mut self) {
        self.exceeded = false;
        self.exceeded_breach = None;
        self.exceeded_reason = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn build_is_immutable_once_terminal() {
        let mut build = Build::queued(ProjectId::new(), UserId::new());
        assert!(build.mark_running());
        assert!(build.fail(Some(2), "exit 2", "boom".into(), ResourceUsage::default()));

        let artifact = Artifact {
            image: "sha256:abc".into(),
            build_id: build.id,
            created_at: Utc::now(),
        };
        assert!(!build.succeed(artifact, String::new(), ResourceUsage::default()));
        assert!(!build.cancel(String::new()));
        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.exit_code, Some(2));
        assert_eq!(build.logs, "boom");
    }

    #[test]
    fn instance_status_classes() {
        assert!(InstanceStatus::Healthy.is_live());
        assert!(InstanceStatus::Unhealthy.is_live());
        assert!(!InstanceStatus::Starting.is_live());
        assert!(InstanceStatus::Failed.is_terminal());
        assert_eq!(InstanceStatus::Unhealthy.to_string(), "unhealthy");
    }

    #[test]
    fn auto_sleep_idle_detection() {
        let policy = AutoSleepPolicy {
            enabled: true,
            idle_timeout_secs: 60,
        };
        let last = Utc::now();
        assert!(!policy.is_idle(last, last + ChronoDuration::seconds(30)));
        assert!(policy.is_idle(last, last + ChronoDuration::seconds(61)));

        let disabled = AutoSleepPolicy {
            enabled: false,
            ..policy
        };
        assert!(!disabled.is_idle(last, last + ChronoDuration::days(1)));
    }

    #[test]
    fn month_window_uses_calendar_months() {
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 23, 0, 0).unwrap();
        let record = QuotaRecord::new(UserId::new(), QuotaLimits::default(), start);

        assert!(!record.month_elapsed(Utc.with_ymd_and_hms(2026, 1, 31, 23, 59, 0).unwrap()));
        assert!(record.month_elapsed(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()));
        assert!(record.month_elapsed(Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn ids_round_trip_through_strings() {
        let id = ProjectId::new();
        let parsed: ProjectId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
