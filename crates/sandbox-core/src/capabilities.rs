//! Runtime detection of host features the supervisor relies on
//!
//! Checks the running kernel and the calling terminal so the CLI can report
//! what will work before a launch is attempted.

use std::os::fd::AsRawFd;
use std::path::Path;

/// Detected host capabilities for launching and supervising a process
#[derive(Debug, Clone)]
pub struct SystemCapabilities {
    /// Running as root (euid == 0)
    pub has_root: bool,
    /// Unprivileged user namespaces are available
    pub has_user_namespaces: bool,
    /// PR_SET_CHILD_SUBREAPER is accepted by the kernel
    pub has_subreaper: bool,
    /// /dev/ptmx exists, so pseudo-terminals can be allocated
    pub has_ptmx: bool,
    /// One of stdin, stdout or stderr is a terminal
    pub has_terminal: bool,
}

impl SystemCapabilities {
    /// Detect all available capabilities on the current system
    pub fn detect() -> Self {
        Self {
            has_root: detect_root(),
            has_user_namespaces: detect_user_namespaces(),
            has_subreaper: detect_subreaper(),
            has_ptmx: detect_ptmx(),
            has_terminal: detect_terminal(),
        }
    }

    /// Check if a process can be launched without root
    pub fn can_launch_unprivileged(&self) -> bool {
        self.has_user_namespaces
    }

    /// Check if an interactive console can be attached
    pub fn can_attach_console(&self) -> bool {
        self.has_ptmx
    }

    /// Get a human-readable summary of capabilities
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        let check = |available: bool| if available { "[ok]" } else { "[--]" };

        lines.push(format!("{} Root privileges", check(self.has_root)));
        lines.push(format!(
            "{} User namespaces",
            check(self.has_user_namespaces)
        ));
        lines.push(format!("{} Child subreaper", check(self.has_subreaper)));
        lines.push(format!("{} Pseudo-terminals", check(self.has_ptmx)));
        lines.push(format!("{} Attached terminal", check(self.has_terminal)));

        lines.join("\n")
    }
}

fn detect_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn detect_user_namespaces() -> bool {
    // Debian-style knob, absent on most kernels
    if let Ok(content) = std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone") {
        if content.trim() == "0" {
            return false;
        }
    }

    if let Ok(content) = std::fs::read_to_string("/proc/sys/user/max_user_namespaces") {
        if let Ok(max) = content.trim().parse::<u64>() {
            return max > 0;
        }
    }

    true
}

fn detect_subreaper() -> bool {
    // Reading the flag is harmless and fails with EINVAL on kernels older than 3.4
    let mut flag: libc::c_int = 0;
    let ret = unsafe {
        libc::prctl(
            libc::PR_GET_CHILD_SUBREAPER,
            &mut flag as *mut libc::c_int as libc::c_ulong,
            0,
            0,
            0,
        )
    };
    ret == 0
}

fn detect_ptmx() -> bool {
    Path::new("/dev/ptmx").exists()
}

fn detect_terminal() -> bool {
    let fds = [
        std::io::stderr().as_raw_fd(),
        std::io::stdout().as_raw_fd(),
        std::io::stdin().as_raw_fd(),
    ];
    fds.iter().any(|&fd| unsafe { libc::isatty(fd) == 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_returns_valid_capabilities() {
        let caps = SystemCapabilities::detect();
        let _ = caps.has_root;
        let _ = caps.has_user_namespaces;
        let _ = caps.has_subreaper;
        let _ = caps.has_terminal;
        assert_eq!(caps.can_attach_console(), caps.has_ptmx);
    }

    #[test]
    fn summary_produces_output() {
        let caps = SystemCapabilities::detect();
        let summary = caps.summary();
        assert!(summary.contains("Root privileges"));
        assert!(summary.contains("Child subreaper"));
        assert_eq!(summary.lines().count(), 5);
    }

    #[test]
    fn subreaper_check_does_not_change_state() {
        let before = detect_subreaper();
        let after = detect_subreaper();
        assert_eq!(before, after);
    }

    #[test]
    fn root_detection_matches_euid() {
        let detected = detect_root();
        let actual = unsafe { libc::geteuid() == 0 };
        assert_eq!(detected, actual);
    }
}
