use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use slipway_ports::HealthProbe;

/// Probe whose answers are set by the test
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    healthy: AtomicBool,
    succeed_after: AtomicU32,
    attempts: AtomicU32,
}

impl ScriptedProbe {
    /// Always answers `healthy`
    pub fn always(healthy: bool) -> Self {
        let probe = Self::default();
        probe.healthy.store(healthy, Ordering::SeqCst);
        probe
    }

    /// Fails until the `n`th attempt, then succeeds
    pub fn succeed_after(n: u32) -> Self {
        let probe = Self::default();
        probe.succeed_after.store(n, Ordering::SeqCst);
        probe
    }

    /// Switch every later answer
    pub fn set_healthy(&self, healthy: bool) {
        self.succeed_after.store(0, Ordering::SeqCst);
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Probes issued so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, _host: &str, _port: u16) -> bool {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let after = self.succeed_after.load(Ordering::SeqCst);
        if after > 0 && n >= after {
            return true;
        }
        self.healthy.load(Ordering::SeqCst)
    }
}
