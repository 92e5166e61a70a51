//! Slipway Sandbox
//!
//! The untrusted half of the pipeline:
//! - [`IsolatedBuilder`] runs build commands in throwaway, network-less sandboxes
//! - [`HardenedLauncher`] starts runners behind a port health gate
//! - [`SandboxGuard`] guarantees teardown when an owner exits early
//!
//! Everything talks to containers through `slipway_core::SandboxRuntime`.
//! The Docker implementation lives behind the `docker` feature.

pub mod builder;
pub mod guard;
pub mod launcher;
pub mod logs;
pub mod profile;

#[cfg(feature = "docker")]
pub mod docker;

pub use builder::{BuildFailure, BuildOutput, IsolatedBuilder};
pub use guard::{teardown, SandboxGuard};
pub use launcher::HardenedLauncher;
pub use logs::LogBuffer;
pub use profile::{build_spec, run_spec, validate_source_path};

#[cfg(feature = "docker")]
pub use docker::DockerRuntime;
