//! Slipway Ports
//!
//! Port Lease Registry for preview and deployment instances:
//! - A fixed, contiguous pool of host ports
//! - Idempotent per-project leases with guarded release
//! - Liveness probing over a bounded, cancellable retry loop
//!
//! The registry is an explicit object injected into the orchestrator; all
//! free-set mutation happens under a single mutex.

pub mod probe;
pub mod registry;
pub mod retry;

pub use probe::{HealthProbe, TcpProbe};
pub use registry::{LeaseError, PoolStats, PortLeaseRegistry};
pub use retry::{retry_until, RetryOutcome, RetryPolicy};
