//! Sandbox specs for the two halves of the pipeline
//!
//! - Builder: no inherited environment, no network, bounded memory/CPU,
//!   the source tree as its only host mount
//! - Runner: non-root, read-only root with a small tmpfs scratch, every
//!   capability dropped, no privilege escalation, its own network segment

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use slipway_core::{
    Artifact, BindMount, BuildConfig, BuildId, Instance, NetworkMode, PortBinding, ProjectId,
    RuntimeConfig, SandboxError, SandboxRole, SandboxSpec, SecurityProfile,
};

/// Label keys attached to every sandbox
pub const LABEL_ROLE: &str = "slipway.role";
pub const LABEL_PROJECT: &str = "slipway.project";
pub const LABEL_BUILD: &str = "slipway.build";
pub const LABEL_INSTANCE: &str = "slipway.instance";

/// Resolve `source` and check it is a directory under `root` (if any).
///
/// Symlinks are resolved before the prefix check.
pub fn validate_source_path(source: &Path, root: Option<&Path>) -> Result<PathBuf, SandboxError> {
    let canonical = source.canonicalize().map_err(|e| {
        SandboxError::InvalidSpec(format!(
            "failed to resolve source dir {}: {e}",
            source.display()
        ))
    })?;

    if !canonical.is_dir() {
        return Err(SandboxError::InvalidSpec(format!(
            "source {} is not a directory",
            canonical.display()
        )));
    }

    if let Some(root) = root {
        let canonical_root = root.canonicalize().map_err(|e| {
            SandboxError::InvalidSpec(format!(
                "failed to resolve source root {}: {e}",
                root.display()
            ))
        })?;
        if !canonical.starts_with(&canonical_root) {
            return Err(SandboxError::InvalidSpec(format!(
                "source dir {} is outside allowed root {}",
                canonical.display(),
                canonical_root.display()
            )));
        }
    }

    Ok(canonical)
}

fn is_root_user(user: &str) -> bool {
    let uid = user.split(':').next().unwrap_or_default();
    uid.is_empty() || uid == "0" || uid == "root"
}

/// Spec for an ephemeral builder
pub fn build_spec(
    config: &BuildConfig,
    build_id: BuildId,
    project: ProjectId,
    source: &Path,
) -> Result<SandboxSpec, SandboxError> {
    if is_root_user(&config.user) {
        return Err(SandboxError::InvalidSpec(format!(
            "builder must not run as root (user {:?})",
            config.user
        )));
    }
    let source = validate_source_path(source, config.source_root.as_deref())?;

    // Nothing from the host environment
    let env = BTreeMap::from([
        ("CI".to_string(), "true".to_string()),
        ("HOME".to_string(), "/tmp".to_string()),
        ("NODE_ENV".to_string(), "production".to_string()),
    ]);

    let labels = BTreeMap::from([
        (LABEL_ROLE.to_string(), "builder".to_string()),
        (LABEL_PROJECT.to_string(), project.to_string()),
        (LABEL_BUILD.to_string(), build_id.to_string()),
    ]);

    Ok(SandboxSpec {
        name: format!("slipway-build-{build_id}"),
        role: SandboxRole::Builder,
        image: config.image.clone(),
        command: config.command.clone(),
        env,
        binds: vec![BindMount {
            source,
            target: config.source_mount.clone(),
            read_only: false,
        }],
        working_dir: Some(config.workdir.clone()),
        network: NetworkMode::from_name(&config.network),
        limits: config.limits(),
        security: SecurityProfile {
            user: config.user.clone(),
            // The build writes into its workdir, which is committed afterwards
            read_only_root: false,
            drop_all_capabilities: true,
            no_new_privileges: true,
            seccomp_profile: None,
            scratch: BTreeMap::new(),
        },
        port: None,
        labels,
    })
}

/// Spec for a hardened runner serving `artifact` on the instance's leased port
pub fn run_spec(
    config: &RuntimeConfig,
    instance: &Instance,
    artifact: &Artifact,
) -> Result<SandboxSpec, SandboxError> {
    let host_port = instance.port().ok_or_else(|| {
        SandboxError::InvalidSpec(format!("instance {} holds no port lease", instance.id))
    })?;
    if is_root_user(&config.user) {
        return Err(SandboxError::InvalidSpec(format!(
            "runner must not run as root (user {:?})",
            config.user
        )));
    }

    let env = BTreeMap::from([
        ("HOST".to_string(), "0.0.0.0".to_string()),
        ("PORT".to_string(), config.container_port.to_string()),
        ("NODE_ENV".to_string(), "production".to_string()),
        ("HOME".to_string(), "/tmp".to_string()),
    ]);

    let labels = BTreeMap::from([
        (LABEL_ROLE.to_string(), "runner".to_string()),
        (LABEL_PROJECT.to_string(), instance.project_id.to_string()),
        (LABEL_BUILD.to_string(), instance.build_id.to_string()),
        (LABEL_INSTANCE.to_string(), instance.id.to_string()),
    ]);

    Ok(SandboxSpec {
        name: format!("slipway-run-{}", instance.id),
        role: SandboxRole::Runner,
        image: artifact.image.clone(),
        command: config.command.clone(),
        env,
        binds: Vec::new(),
        working_dir: None,
        network: NetworkMode::from_name(&config.network),
        limits: instance.limits,
        security: SecurityProfile {
            user: config.user.clone(),
            read_only_root: true,
            drop_all_capabilities: true,
            no_new_privileges: true,
            seccomp_profile: None,
            scratch: BTreeMap::from([("/tmp".to_string(), config.scratch_size_mb)]),
        },
        port: Some(PortBinding {
            container_port: config.container_port,
            host_port,
        }),
        labels,
    })
}
