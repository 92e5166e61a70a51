//! Error types for Slipway
//!
//! Provides the error taxonomy for:
//! - Admission (quota) denials
//! - Port pool exhaustion
//! - Build failures with captured logs
//! - Health gate timeouts
//! - Sandbox runtime and persistence failures
//!
//! Every [`DeployError`] carries a stable reason code via [`DeployError::code`].

use serde::{Deserialize, Serialize};

/// Pipeline stage at which a runtime error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Creating the builder sandbox
    BuildSetup,
    /// Running the build command
    Build,
    /// Snapshotting the build output into an artifact
    Commit,
    /// Creating / starting the runner
    Launch,
    /// Waiting on the health gate
    HealthGate,
    /// Stopping / removing a sandbox
    Teardown,
    /// Store round-trip
    Persist,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BuildSetup => "build-setup",
            Self::Build => "build",
            Self::Commit => "commit",
            Self::Launch => "launch",
            Self::HealthGate => "health-gate",
            Self::Teardown => "teardown",
            Self::Persist => "persist",
        };
        f.write_str(s)
    }
}

/// Why a build did not produce an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum BuildFailureReason {
    /// Build command exited non-zero
    NonZeroExit,
    /// Build exceeded its timeout
    Timeout { after_secs: u64 },
    /// The sandbox runtime failed at some stage
    Runtime { stage: Stage, message: String },
    /// Stopped on request
    Cancelled,
}

impl std::fmt::Display for BuildFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonZeroExit => f.write_str("build command exited with non-zero status"),
            Self::Timeout { after_secs } => write!(f, "build timed out after {after_secs}s"),
            Self::Runtime { stage, message } => write!(f, "runtime error during {stage}: {message}"),
            Self::Cancelled => f.write_str("build cancelled"),
        }
    }
}

/// Main deployment error type
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Admission denied
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// No free port in the lease pool
    #[error("port pool exhausted")]
    PortPoolExhausted,

    /// Build did not produce an artifact
    #[error("build failed: {reason}")]
    BuildFailed {
        exit_code: Option<i64>,
        logs: String,
        reason: BuildFailureReason,
    },

    /// Instance never passed the health gate
    #[error("health check timed out after {attempts} attempts")]
    HealthCheckTimeout { attempts: u32 },

    /// Sandbox runtime failure
    #[error("runtime error during {stage}: {message}")]
    Runtime { stage: Stage, message: String },

    /// Unknown build / instance
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller does not own the resource
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Operation not valid for the resource's current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Store round-trip failed
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Stopped while in flight
    #[error("operation cancelled")]
    Cancelled,
}

impl DeployError {
    /// Shorthand for a runtime error at `stage`
    #[inline]
    pub fn runtime(stage: Stage, message: impl Into<String>) -> Self {
        Self::Runtime {
            stage,
            message: message.into(),
        }
    }

    /// Machine-readable reason code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::PortPoolExhausted => "port_pool_exhausted",
            Self::BuildFailed {
                reason: BuildFailureReason::Timeout { .. },
                ..
            } => "build_timeout",
            Self::BuildFailed { .. } => "build_failed",
            Self::HealthCheckTimeout { .. } => "health_check_timeout",
            Self::Runtime { .. } => "runtime_error",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidState(_) => "invalid_state",
            Self::Persistence(_) => "persistence_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Captured logs, where the failure has any
    #[must_use]
    pub fn logs(&self) -> Option<&str> {
        match self {
            Self::BuildFailed { logs, .. } => Some(logs.as_str()),
            _ => None,
        }
    }

    /// Whether a later attempt may succeed without user action
    ///
    /// Only capacity exhaustion is transient; builds and health checks are
    /// never retried automatically.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PortPoolExhausted)
    }
}

/// Persistence errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Row missing where one was required
    #[error("row not found: {0}")]
    NotFound(String),

    /// Row already exists
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend unavailable or failed
    #[error("backend error: {0}")]
    Backend(String),
}

/// Sandbox runtime errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    /// Runtime could not be reached
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// Sandbox handle unknown to the runtime
    #[error("sandbox not found: {0}")]
    NotFound(String),

    /// Spec rejected before anything was created
    #[error("invalid sandbox spec: {0}")]
    InvalidSpec(String),

    /// A runtime operation failed
    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },
}

impl SandboxError {
    /// Shorthand for an operation failure
    #[inline]
    pub fn operation(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            message: message.into(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML did not parse
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_error_codes_are_stable() {
        assert_eq!(DeployError::PortPoolExhausted.code(), "port_pool_exhausted");
        assert_eq!(
            DeployError::QuotaExceeded("monthly token limit".into()).code(),
            "quota_exceeded"
        );
        assert_eq!(
            DeployError::HealthCheckTimeout { attempts: 3 }.code(),
            "health_check_timeout"
        );
        assert_eq!(
            DeployError::runtime(Stage::Launch, "boom").code(),
            "runtime_error"
        );
    }

    #[test]
    fn build_timeout_has_its_own_code() {
        let timeout = DeployError::BuildFailed {
            exit_code: None,
            logs: "partial".into(),
            reason: BuildFailureReason::Timeout { after_secs: 600 },
        };
        let failed = DeployError::BuildFailed {
            exit_code: Some(1),
            logs: "npm ERR!".into(),
            reason: BuildFailureReason::NonZeroExit,
        };

        assert_eq!(timeout.code(), "build_timeout");
        assert_eq!(failed.code(), "build_failed");
        assert_eq!(failed.logs(), Some("npm ERR!"));
        assert!(timeout.to_string().contains("600s"));
    }

    #[test]
    fn only_capacity_errors_are_retryable() {
        assert!(DeployError::PortPoolExhausted.is_retryable());
        assert!(!DeployError::QuotaExceeded("x".into()).is_retryable());
        assert!(!DeployError::HealthCheckTimeout { attempts: 3 }.is_retryable());
        assert!(!DeployError::Forbidden("x".into()).is_retryable());
    }

    #[test]
    fn store_errors_convert() {
        let err: DeployError = StoreError::Backend("down".into()).into();
        assert_eq!(err.code(), "persistence_error");
        assert!(err.to_string().contains("down"));
    }
}
