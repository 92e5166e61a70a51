//! Unconditional sandbox teardown
//!
//! A [`SandboxGuard`] owns a created sandbox until it is either torn down
//! explicitly or disarmed (handed over to a longer-lived owner). If the
//! owning future is dropped or unwinds first, `Drop` schedules the teardown
//! on the current runtime.

use std::sync::Arc;
use std::time::Duration;

use slipway_core::{SandboxError, SandboxHandle, SandboxRuntime};

/// Stop (best effort) and then remove a sandbox.
///
/// A failed stop is logged and removal is still attempted; the removal
/// result is returned.
pub async fn teardown(
    runtime: &dyn SandboxRuntime,
    handle: &SandboxHandle,
    grace: Duration,
) -> Result<(), SandboxError> {
    if let Err(e) = runtime.stop(handle, grace).await {
        tracing::warn!(sandbox = %handle.name, error = %e, "failed to stop sandbox (may already be stopped)");
    }

    match runtime.remove(handle).await {
        Ok(()) => {
            tracing::debug!(sandbox = %handle.name, "sandbox removed");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(sandbox = %handle.name, error = %e, "failed to remove sandbox (may require manual cleanup)");
            Err(e)
        }
    }
}

/// Owns a sandbox until teardown or hand-over
pub struct SandboxGuard {
    runtime: Arc<dyn SandboxRuntime>,
    handle: Option<SandboxHandle>,
    grace: Duration,
}

impl std::fmt::Debug for SandboxGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxGuard")
            .field("handle", &self.handle)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl SandboxGuard {
    /// Guard `handle`
    #[must_use]
    pub fn new(runtime: Arc<dyn SandboxRuntime>, handle: SandboxHandle, grace: Duration) -> Self {
        Self {
            runtime,
            handle: Some(handle),
            grace,
        }
    }

    /// Guarded handle
    #[inline]
    #[must_use]
    pub fn handle(&self) -> Option<&SandboxHandle> {
        self.handle.as_ref()
    }

    /// Tear the sandbox down now
    pub async fn teardown(mut self) -> Result<(), SandboxError> {
        match self.handle.take() {
            Some(handle) => teardown(self.runtime.as_ref(), &handle, self.grace).await,
            None => Ok(()),
        }
    }

    /// Give up ownership without tearing down
    #[must_use]
    pub fn disarm(mut self) -> Option<SandboxHandle> {
        self.handle.take()
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                tracing::warn!(sandbox = %handle.name, "sandbox owner exited early, scheduling teardown");
                let runtime = Arc::clone(&self.runtime);
                let grace = self.grace;
                rt.spawn(async move {
                    if let Err(e) = teardown(runtime.as_ref(), &handle, grace).await {
                        tracing::warn!(sandbox = %handle.name, error = %e, "scheduled teardown failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(sandbox = %handle.name, "sandbox leaked: no runtime to tear it down");
            }
        }
    }
}
