//! Endpoints handed to a process and the host streams they are bridged to

use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;

/// Descriptors the container's init installs as the process's stdio.
///
/// Unset fields leave the corresponding stream inherited from the
/// supervisor. `console_socket`, when set, is where init sends the master
/// of the pseudo-terminal it allocates.
#[derive(Debug, Default)]
pub struct ProcessIo {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
    pub console_socket: Option<OwnedFd>,
}

impl ProcessIo {
    pub fn is_inherited(&self) -> bool {
        self.stdin.is_none()
            && self.stdout.is_none()
            && self.stderr.is_none()
            && self.console_socket.is_none()
    }

    pub fn wants_console(&self) -> bool {
        self.console_socket.is_some()
    }
}

/// The supervisor-side streams a bridge copies to and from
pub struct HostStreams {
    pub input: Box<dyn Read + Send>,
    pub output: Box<dyn Write + Send>,
    pub error: Box<dyn Write + Send>,
}

impl HostStreams {
    /// This process's own stdin, stdout and stderr
    pub fn std() -> Self {
        Self {
            input: Box::new(io::stdin()),
            output: Box::new(io::stdout()),
            error: Box::new(io::stderr()),
        }
    }
}

impl Default for HostStreams {
    fn default() -> Self {
        Self::std()
    }
}
