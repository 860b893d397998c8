//! Finding a container's processes through /proc

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::MetadataExt;

use nix::unistd::{getpid, Pid};
use sandbox_core::{Result, SandboxError};

use crate::config::NamespaceType;

/// Get namespace inode for a process (`None` for the caller)
pub fn namespace_inode(ns_type: NamespaceType, pid: Option<Pid>) -> Result<u64> {
    let pid_str = match pid {
        Some(p) => p.as_raw().to_string(),
        None => "self".to_string(),
    };
    let path = format!("/proc/{}/ns/{}", pid_str, ns_type.proc_name());
    let stat = fs::metadata(&path).map_err(|e| {
        SandboxError::Namespace(format!(
            "Failed to get namespace info for pid={} ns={}: {}",
            pid_str,
            ns_type.proc_name(),
            e
        ))
    })?;
    Ok(stat.ino())
}

/// The fields of `/proc/<pid>/stat` needed to walk the process tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: Pid,
    pub ppid: Pid,
    /// Clock ticks after boot
    pub start_time: u64,
}

impl ProcStat {
    pub fn read(pid: Pid) -> Result<Self> {
        let path = format!("/proc/{}/stat", pid);
        let contents = fs::read_to_string(&path)?;
        Self::parse(&contents)
            .ok_or_else(|| SandboxError::Namespace(format!("malformed {}", path)))
    }

    /// Parse one stat line. The command name may itself contain spaces and
    /// parentheses, so fields are counted from the last `)`.
    pub fn parse(contents: &str) -> Option<Self> {
        let open = contents.find('(')?;
        let close = contents.rfind(')')?;
        let pid = contents[..open].trim().parse().ok()?;
        let fields: Vec<&str> = contents.get(close + 1..)?.split_whitespace().collect();

        // fields[0] is the state (stat field 3)
        let ppid = fields.get(1)?.parse().ok()?;
        let start_time = fields.get(19)?.parse().ok()?;

        Some(Self {
            pid: Pid::from_raw(pid),
            ppid: Pid::from_raw(ppid),
            start_time,
        })
    }
}

fn pids() -> Result<Vec<Pid>> {
    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        if let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            pids.push(Pid::from_raw(pid));
        }
    }
    Ok(pids)
}

/// Snapshot of every visible process; ones that exit mid-scan are skipped
pub fn processes() -> Result<Vec<ProcStat>> {
    Ok(pids()?
        .into_iter()
        .filter_map(|pid| ProcStat::read(pid).ok())
        .collect())
}

/// Every other process whose `ns_type` namespace has inode `inode`
pub fn namespace_members(ns_type: NamespaceType, inode: u64) -> Result<Vec<Pid>> {
    let me = getpid();
    Ok(pids()?
        .into_iter()
        .filter(|pid| *pid != me)
        .filter(|pid| matches!(namespace_inode(ns_type, Some(*pid)), Ok(ino) if ino == inode))
        .collect())
}

/// Descendants of `root` in `table`.
///
/// With `adopted = Some((adopter, since))`, children of `adopter` that started
/// at or after `since` count as descendants too, along with their own
/// subtrees: they are orphans of `root` that a subreaper picked up. `root`
/// itself is never part of the result.
pub fn descendants(table: &[ProcStat], root: Pid, adopted: Option<(Pid, u64)>) -> Vec<Pid> {
    let mut seen = HashSet::new();
    let mut members = Vec::new();
    let mut frontier = vec![root];

    if let Some((adopter, since)) = adopted {
        for stat in table {
            if stat.ppid == adopter
                && stat.pid != root
                && stat.start_time >= since
                && seen.insert(stat.pid)
            {
                members.push(stat.pid);
                frontier.push(stat.pid);
            }
        }
    }

    while let Some(parent) = frontier.pop() {
        for stat in table.iter().filter(|stat| stat.ppid == parent) {
            if stat.pid != root && seen.insert(stat.pid) {
                members.push(stat.pid);
                frontier.push(stat.pid);
            }
        }
    }
    members
}
