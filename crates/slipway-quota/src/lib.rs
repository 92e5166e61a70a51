//! Slipway Quota
//!
//! Admission control over per-user quota records:
//! - Monthly token and cost ceilings
//! - Concurrent instance ceiling (deploys)
//! - Daily build ceiling (builds)
//! - Rolling hourly request rate
//!
//! Denials set a sticky `exceeded` flag that only a window rollover or an
//! operator reset clears. The gate fails closed on store errors.

pub mod gate;
pub mod policy;

pub use gate::{Admission, DenyReason, QuotaError, QuotaGate};
pub use policy::{apply_admission, evaluate, roll_windows, Breach};
