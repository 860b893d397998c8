//! Launch parameters for the process started inside a container

use nix::unistd::{access, AccessFlags};
use sandbox_console::{ProcessIo, WinSize};
use sandbox_core::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::container::caps::{CapabilityMask, CapabilityMasks};

/// Default PATH handed to processes that do not set their own
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/local/sbin:/usr/bin:/usr/sbin:/bin:/sbin";

/// Identity the process runs as, in container ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessUser {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
}

/// Capability sets by name, e.g. `CAP_NET_BIND_SERVICE`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxCapabilities {
    pub bounding: Vec<String>,
    pub effective: Vec<String>,
    pub inheritable: Vec<String>,
    pub permitted: Vec<String>,
    pub ambient: Vec<String>,
}

impl LinuxCapabilities {
    /// The same capabilities in every set
    pub fn uniform<S: AsRef<str>>(names: &[S]) -> Self {
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        Self {
            bounding: names.clone(),
            effective: names.clone(),
            inheritable: names.clone(),
            permitted: names.clone(),
            ambient: names,
        }
    }

    pub fn masks(&self) -> Result<CapabilityMasks> {
        Ok(CapabilityMasks {
            bounding: CapabilityMask::from_names(&self.bounding)?,
            effective: CapabilityMask::from_names(&self.effective)?,
            inheritable: CapabilityMask::from_names(&self.inheritable)?,
            permitted: CapabilityMask::from_names(&self.permitted)?,
            ambient: CapabilityMask::from_names(&self.ambient)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSize {
    pub height: u16,
    pub width: u16,
}

/// The process half of a container configuration, as supplied by callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessSpec {
    pub terminal: bool,
    pub console_size: Option<ConsoleSize>,
    pub user: ProcessUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub capabilities: Option<LinuxCapabilities>,
    pub no_new_privileges: bool,
    pub apparmor_profile: Option<String>,
    pub selinux_label: Option<String>,
}

impl Default for ProcessSpec {
    fn default() -> Self {
        Self {
            terminal: true,
            console_size: None,
            user: ProcessUser::default(),
            args: Vec::new(),
            env: vec![format!("PATH={}", DEFAULT_PATH), "TERM=xterm".to_string()],
            cwd: "/tmp".to_string(),
            capabilities: None,
            no_new_privileges: false,
            apparmor_profile: None,
            selinux_label: None,
        }
    }
}

impl ProcessSpec {
    pub fn validate(&self) -> Result<()> {
        if self.args.is_empty() || self.args[0].is_empty() {
            return Err(SandboxError::InvalidConfig(
                "process args must not be empty".to_string(),
            ));
        }
        if !Path::new(&self.cwd).is_absolute() {
            return Err(SandboxError::InvalidConfig(format!(
                "cwd must be an absolute path: {:?}",
                self.cwd
            )));
        }
        for entry in &self.env {
            if !entry.contains('=') {
                return Err(SandboxError::InvalidConfig(format!(
                    "env entry is not KEY=VALUE: {:?}",
                    entry
                )));
            }
        }
        if let Some(caps) = &self.capabilities {
            caps.masks()?;
        }
        Ok(())
    }

    /// Set or replace one environment variable
    pub fn set_env(&mut self, key: &str, value: &str) {
        let prefix = format!("{}=", key);
        let entry = format!("{}{}", prefix, value);
        match self.env.iter_mut().find(|e| e.starts_with(&prefix)) {
            Some(existing) => *existing = entry,
            None => self.env.push(entry),
        }
    }
}

/// Immutable launch parameters, moved into the container when it starts.
///
/// Built once from a [`ProcessSpec`]; the bridge fills [`ProcessIo`] before
/// hand-off and nothing touches the descriptor afterwards.
#[derive(Debug)]
pub struct ProcessDescriptor {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
    pub capabilities: Option<CapabilityMasks>,
    pub label: Option<String>,
    pub apparmor_profile: Option<String>,
    pub no_new_privileges: bool,
    pub console_size: Option<WinSize>,
    pub init: bool,
    pub log_level: Option<String>,
    pub io: ProcessIo,
}

impl ProcessDescriptor {
    pub fn from_spec(spec: &ProcessSpec, init: bool, log_level: Option<&str>) -> Result<Self> {
        spec.validate()?;

        let capabilities = match &spec.capabilities {
            Some(caps) => Some(caps.masks()?),
            None => None,
        };

        Ok(Self {
            args: spec.args.clone(),
            env: spec.env.clone(),
            cwd: spec.cwd.clone(),
            uid: spec.user.uid,
            gid: spec.user.gid,
            additional_gids: spec.user.additional_gids.clone(),
            capabilities,
            label: spec.selinux_label.clone(),
            apparmor_profile: spec.apparmor_profile.clone(),
            no_new_privileges: spec.no_new_privileges,
            console_size: spec.console_size.map(|size| WinSize {
                rows: size.height,
                cols: size.width,
            }),
            init,
            log_level: log_level.map(str::to_string),
            io: ProcessIo::default(),
        })
    }

    /// `uid:gid` as reported in logs
    pub fn user(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        env_value(&self.env, key)
    }
}

fn env_value<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter().find_map(|entry| {
        let (k, v) = entry.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// Resolve a program name to an absolute path using PATH semantics.
pub fn resolve_program_path(program: &str, env: &[String]) -> std::result::Result<String, String> {
    if program.contains('/') {
        return Ok(program.to_string());
    }

    let path_value = env_value(env, "PATH").unwrap_or(DEFAULT_PATH);

    for entry in path_value.split(':') {
        let dir = if entry.is_empty() { "." } else { entry };
        let candidate = Path::new(dir).join(program);

        if access(&candidate, AccessFlags::X_OK).is_ok() && candidate.is_file() {
            return Ok(candidate.to_string_lossy().into_owned());
        }
    }

    Err(format!("exec: {:?}: executable file not found in $PATH", program))
}
