//! Testing utilities for the Slipway workspace
//!
//! Shared fakes and fixtures: an in-memory sandbox runtime, a scripted
//! liveness probe, a store that fails on demand, and config/source fixtures.

#![allow(missing_docs)]

mod probe;
mod runtime;
mod store;

use std::time::Duration;

use slipway_core::SlipwayConfig;

pub use probe::ScriptedProbe;
pub use runtime::{FakeRuntime, Script};
pub use store::FailingStore;

/// Small, fast configuration: 10 ports, 3 probes 10ms apart, short timeouts
pub fn test_config() -> SlipwayConfig {
    let mut config = SlipwayConfig::new()
        .with_port_range(3001, 3010)
        .with_probe(3, 10)
        .with_build_timeout(5);
    config.runtime.health_timeout_secs = 5;
    config.runtime.stop_grace_secs = 1;
    config.build.stop_grace_secs = 1;
    config
}

/// Temporary project tree with a minimal package manifest
pub fn source_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("package.json"),
        r#"{"name":"preview","scripts":{"build":"echo ok"}}"#,
    )
    .unwrap();
    dir
}

/// Poll `check` until it holds or `limit` elapses
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
