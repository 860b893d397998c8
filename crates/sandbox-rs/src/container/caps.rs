//! Linux capability names and the sets a process is launched with

use sandbox_core::{Result, SandboxError};

const CAPABILITY_NAMES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

/// Highest capability number this table knows about
pub const LAST_CAP: u32 = (CAPABILITY_NAMES.len() - 1) as u32;

/// Capability number for a name; the `CAP_` prefix and case are optional
pub fn capability_from_name(name: &str) -> Result<u32> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    };
    CAPABILITY_NAMES
        .iter()
        .position(|known| *known == full)
        .map(|index| index as u32)
        .ok_or_else(|| SandboxError::InvalidConfig(format!("unknown capability: {}", name)))
}

pub fn capability_name(cap: u32) -> Option<&'static str> {
    CAPABILITY_NAMES.get(cap as usize).copied()
}

/// A set of capabilities as a 64-bit mask, bit N for capability N
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityMask(pub u64);

impl CapabilityMask {
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut mask = 0u64;
        for name in names {
            mask |= 1u64 << capability_from_name(name.as_ref())?;
        }
        Ok(Self(mask))
    }

    pub fn contains(&self, cap: u32) -> bool {
        cap < 64 && self.0 & (1u64 << cap) != 0
    }

    /// Lower and upper 32 bits, the layout capset(2) expects
    pub fn split(&self) -> (u32, u32) {
        (self.0 as u32, (self.0 >> 32) as u32)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..=LAST_CAP).filter(move |cap| self.contains(*cap))
    }
}

/// Resolved masks for every capability set of a process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityMasks {
    pub bounding: CapabilityMask,
    pub effective: CapabilityMask,
    pub inheritable: CapabilityMask,
    pub permitted: CapabilityMask,
    pub ambient: CapabilityMask,
}
