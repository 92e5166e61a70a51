//! Slipway configuration
//!
//! Loaded from TOML; every section and field has a default so a partial file
//! (or none at all) is valid.
//!
//! ```toml
//! [ports]
//! range_start = 3001
//! range_end = 3100
//!
//! [build]
//! timeout_secs = 600
//!
//! [runtime]
//! health_timeout_secs = 60
//!
//! [quota]
//! requests_per_hour = 100
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{AutoSleepPolicy, QuotaLimits, ResourceLimits};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlipwayConfig {
    /// Port lease pool and health probing
    pub ports: PortConfig,
    /// Isolated builder
    pub build: BuildConfig,
    /// Hardened runner
    pub runtime: RuntimeConfig,
    /// Default limits for lazily created quota records
    pub quota: QuotaLimits,
}

impl SlipwayConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// With a port range (inclusive)
    #[inline]
    #[must_use]
    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.ports.range_start = start;
        self.ports.range_end = end;
        self
    }

    /// With health probe budget
    #[inline]
    #[must_use]
    pub fn with_probe(mut self, attempts: u32, interval_ms: u64) -> Self {
        self.ports.probe_attempts = attempts;
        self.ports.probe_interval_ms = interval_ms;
        self
    }

    /// With build timeout
    #[inline]
    #[must_use]
    pub fn with_build_timeout(mut self, secs: u64) -> Self {
        self.build.timeout_secs = secs;
        self
    }

    /// With default quota limits
    #[inline]
    #[must_use]
    pub fn with_quota(mut self, limits: QuotaLimits) -> Self {
        self.quota = limits;
        self
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.range_start == 0 || self.ports.range_start > self.ports.range_end {
            return Err(ConfigError::Invalid(format!(
                "port range {}-{} is empty or starts at 0",
                self.ports.range_start, self.ports.range_end
            )));
        }
        if self.ports.probe_attempts == 0 {
            return Err(ConfigError::Invalid(
                "ports.probe_attempts must be at least 1".into(),
            ));
        }
        if self.build.timeout_secs == 0 {
            return Err(ConfigError::Invalid("build.timeout_secs must be positive".into()));
        }
        if self.build.command.is_empty() {
            return Err(ConfigError::Invalid("build.command must not be empty".into()));
        }
        if self.runtime.command.is_empty() {
            return Err(ConfigError::Invalid("runtime.command must not be empty".into()));
        }
        if self.runtime.health_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "runtime.health_timeout_secs must be positive".into(),
            ));
        }
        if self.build.network == self.runtime.network && self.build.network != "none" {
            return Err(ConfigError::Invalid(format!(
                "builder and runner must not share network segment {:?}",
                self.build.network
            )));
        }
        Ok(())
    }
}

/// Port lease pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// First port in the pool (inclusive)
    pub range_start: u16,
    /// Last port in the pool (inclusive)
    pub range_end: u16,
    /// Host the liveness probe connects to
    pub probe_host: String,
    /// Maximum probe attempts during health gating
    pub probe_attempts: u32,
    /// Sleep between probe attempts
    pub probe_interval_ms: u64,
    /// Per-attempt connect timeout
    pub probe_connect_timeout_ms: u64,
}

impl PortConfig {
    /// Number of ports in the pool
    #[inline]
    #[must_use]
    pub fn pool_size(&self) -> usize {
        usize::from(self.range_end.saturating_sub(self.range_start)) + 1
    }

    #[inline]
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            range_start: 3001,
            range_end: 3100,
            probe_host: "127.0.0.1".to_string(),
            probe_attempts: 30,
            probe_interval_ms: 1000,
            probe_connect_timeout_ms: 500,
        }
    }
}

/// Isolated builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Builder image
    pub image: String,
    /// Build command run inside the sandbox, from `workdir`
    pub command: Vec<String>,
    /// Where the source tree is bind-mounted
    pub source_mount: String,
    /// Working directory inside the builder; lives in the container layer so
    /// the committed artifact includes the build output
    pub workdir: String,
    /// If set, source trees must live under this directory
    pub source_root: Option<PathBuf>,
    pub timeout_secs: u64,
    pub memory_mb: u64,
    pub cpu_millicores: u64,
    /// Network segment; "none" disables networking
    pub network: String,
    /// Non-root uid:gid
    pub user: String,
    /// Grace period for stopping the builder
    pub stop_grace_secs: u64,
    /// Log capture cap; older output is dropped beyond this
    pub max_log_bytes: usize,
}

impl BuildConfig {
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[inline]
    #[must_use]
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits::new(self.memory_mb, self.cpu_millicores)
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            image: "slipway-builder:latest".to_string(),
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cp -a /src/. . && npm ci && npm run build".to_string(),
            ],
            source_mount: "/src".to_string(),
            workdir: "/workspace".to_string(),
            source_root: None,
            timeout_secs: 600,
            memory_mb: 2048,
            cpu_millicores: 2000,
            network: "none".to_string(),
            user: "1000:1000".to_string(),
            stop_grace_secs: 5,
            max_log_bytes: 1024 * 1024,
        }
    }
}

/// Hardened runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Command starting the service inside the artifact
    pub command: Vec<String>,
    /// Port the service listens on inside the container
    pub container_port: u16,
    /// Host the leased port is bound on and reported to callers
    pub host: String,
    pub memory_mb: u64,
    pub cpu_millicores: u64,
    /// Run-time network segment, separate from the build network
    pub network: String,
    /// Writable tmpfs scratch size
    pub scratch_size_mb: u64,
    /// Non-root uid:gid
    pub user: String,
    /// Overall health-gate budget, independent of the probe count
    pub health_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub auto_sleep: AutoSleepPolicy,
}

impl RuntimeConfig {
    #[inline]
    #[must_use]
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits::new(self.memory_mb, self.cpu_millicores)
    }

    #[inline]
    #[must_use]
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    #[inline]
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: vec!["npm".to_string(), "run".to_string(), "start".to_string()],
            container_port: 3000,
            host: "127.0.0.1".to_string(),
            memory_mb: 512,
            cpu_millicores: 500,
            network: "slipway-run".to_string(),
            scratch_size_mb: 64,
            user: "10001:10001".to_string(),
            health_timeout_secs: 60,
            stop_grace_secs: 10,
            auto_sleep: AutoSleepPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = SlipwayConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.ports.pool_size(), 100);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SlipwayConfig::from_toml_str(
            r#"
            [ports]
            range_start = 4000
            range_end = 4009

            [quota]
            requests_per_hour = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.ports.pool_size(), 10);
        assert_eq!(config.ports.probe_attempts, 30);
        assert_eq!(config.quota.requests_per_hour, 7);
        assert_eq!(config.quota.builds_per_day, 50);
        assert_eq!(config.build.network, "none");
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = SlipwayConfig::new().with_port_range(3100, 3001).validate();
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn shared_network_segment_is_rejected() {
        let mut config = SlipwayConfig::new();
        config.build.network = "shared".into();
        config.runtime.network = "shared".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[build]\ntimeout_secs = 42").unwrap();

        let config = SlipwayConfig::load(file.path()).unwrap();
        assert_eq!(config.build.timeout(), Duration::from_secs(42));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = SlipwayConfig::from_toml_str("[ports\nrange_start = ");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }
}
