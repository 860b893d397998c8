//! Utility functions for sandbox operations

use crate::error::{Result, SandboxError};
use nix::unistd::User;
#[cfg(test)]
use std::cell::Cell;

#[cfg(test)]
thread_local! {
    static ROOT_OVERRIDE: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Check if running as root
pub fn is_root() -> bool {
    #[cfg(test)]
    {
        if let Some(value) = ROOT_OVERRIDE.with(|cell| cell.get()) {
            return value;
        }
    }

    unsafe { libc::geteuid() == 0 }
}

/// Get current UID
pub fn get_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Get current GID
pub fn get_gid() -> u32 {
    unsafe { libc::getegid() }
}

/// Ensure we have root privileges
pub fn require_root() -> Result<()> {
    if !is_root() {
        Err(SandboxError::PermissionDenied(
            "This operation requires root privileges".to_string(),
        ))
    } else {
        Ok(())
    }
}

/// Resolved identity of the user a process will run as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

/// Resolve a user given as a name, `uid` or `uid:gid`.
///
/// Names go through the host user database. Numeric forms are taken as-is,
/// a bare uid reuses itself as the gid.
pub fn lookup_user(spec: &str) -> Result<UserIdentity> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(SandboxError::InvalidConfig("user cannot be empty".to_string()));
    }

    if let Some(identity) = parse_numeric_user(spec)? {
        return Ok(identity);
    }

    match User::from_name(spec) {
        Ok(Some(user)) => Ok(UserIdentity {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        }),
        Ok(None) => Err(SandboxError::InvalidConfig(format!(
            "unknown user: {}",
            spec
        ))),
        Err(e) => Err(SandboxError::syscall("getpwnam", e)),
    }
}

fn parse_numeric_user(spec: &str) -> Result<Option<UserIdentity>> {
    let (uid_part, gid_part) = match spec.split_once(':') {
        Some((uid, gid)) => (uid, Some(gid)),
        None => (spec, None),
    };

    if !uid_part.chars().all(|c| c.is_ascii_digit()) {
        if gid_part.is_some() {
            return Err(SandboxError::InvalidConfig(format!(
                "invalid uid:gid pair: {}",
                spec
            )));
        }
        return Ok(None);
    }

    let parse = |value: &str| {
        value
            .parse::<u32>()
            .map_err(|_| SandboxError::InvalidConfig(format!("invalid id in user: {}", spec)))
    };

    let uid = parse(uid_part)?;
    let gid = match gid_part {
        Some(gid) => parse(gid)?,
        None => uid,
    };

    Ok(Some(UserIdentity {
        name: uid.to_string(),
        uid,
        gid,
    }))
}

#[cfg(test)]
pub(crate) fn set_root_override(value: Option<bool>) {
    ROOT_OVERRIDE.with(|cell| cell.set(value));
}
