//! User namespace UID/GID mapping support
//!
//! When using user namespaces, the child process needs UID/GID mappings
//! written to /proc/{pid}/uid_map and /proc/{pid}/gid_map before it drops
//! into its target identity.

use crate::config::{ContainerConfig, IdMap};
use nix::unistd::Pid;
use sandbox_core::{Result, SandboxError};
use std::fs;

/// Render mappings in the kernel's `inside outside count` line format
pub fn format_id_map(mappings: &[IdMap]) -> String {
    mappings
        .iter()
        .map(|m| format!("{} {} {}\n", m.container_id, m.host_id, m.size))
        .collect()
}

/// Write the container's uid/gid mappings for a freshly cloned child.
///
/// An unprivileged caller has to deny setgroups before the kernel accepts a
/// gid_map, so that is done only when not running as root.
pub fn setup_user_namespace(child_pid: Pid, config: &ContainerConfig) -> Result<()> {
    let pid = child_pid.as_raw();

    fs::write(
        format!("/proc/{}/uid_map", pid),
        format_id_map(&config.uid_mappings),
    )
    .map_err(|e| {
        SandboxError::Namespace(format!("Failed to write uid_map for pid {}: {}", pid, e))
    })?;

    if !sandbox_core::util::is_root() {
        fs::write(format!("/proc/{}/setgroups", pid), "deny\n").map_err(|e| {
            SandboxError::Namespace(format!("Failed to write setgroups for pid {}: {}", pid, e))
        })?;
    }

    fs::write(
        format!("/proc/{}/gid_map", pid),
        format_id_map(&config.gid_mappings),
    )
    .map_err(|e| {
        SandboxError::Namespace(format!("Failed to write gid_map for pid {}: {}", pid, e))
    })?;

    Ok(())
}
