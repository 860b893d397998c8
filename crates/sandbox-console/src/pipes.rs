//! Plain pipe plumbing for processes that run without a terminal

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::unistd::{fchown, pipe2, Gid, Uid};
use sandbox_core::{util, Result, SandboxError};

use crate::io::{HostStreams, ProcessIo};

fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| SandboxError::syscall("pipe2", e))
}

/// Hand ownership of a pipe end to the container's root user
fn chown_to(fd: &OwnedFd, uid: u32, gid: u32) -> Result<()> {
    fchown(fd.as_raw_fd(), Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .map_err(|e| SandboxError::syscall("fchown", e))
}

fn spawn_copy<R, W>(name: &'static str, mut reader: R, mut writer: W) -> Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::Builder::new()
        .name(format!("copy-{}", name))
        .spawn(move || {
            match io::copy(&mut reader, &mut writer) {
                Ok(bytes) => debug!("{} copy finished after {} bytes", name, bytes),
                Err(e) => debug!("{} copy stopped: {}", name, e),
            }
            let _ = writer.flush();
        })
        .map_err(SandboxError::Io)
}

/// Three pipes between the host's standard streams and the process.
///
/// The stdin copy runs detached. The stdout and stderr copies are joined by
/// [`PipeBridge::close`] so nothing the process printed is lost.
pub struct PipeBridge {
    copies: Vec<JoinHandle<()>>,
}

impl PipeBridge {
    pub fn attach(io: &mut ProcessIo, root_uid: u32, root_gid: u32) -> Result<Self> {
        Self::attach_with(io, root_uid, root_gid, HostStreams::std())
    }

    /// Like [`PipeBridge::attach`], copying to and from `host` instead of this process's stdio
    pub fn attach_with(
        io: &mut ProcessIo,
        root_uid: u32,
        root_gid: u32,
        host: HostStreams,
    ) -> Result<Self> {
        let (stdin_read, stdin_write) = cloexec_pipe()?;
        let (stdout_read, stdout_write) = cloexec_pipe()?;
        let (stderr_read, stderr_write) = cloexec_pipe()?;

        if root_uid != util::get_uid() || root_gid != util::get_gid() {
            for fd in [&stdin_read, &stdout_write, &stderr_write] {
                chown_to(fd, root_uid, root_gid)?;
            }
        }

        let HostStreams {
            input,
            output,
            error,
        } = host;

        // detached: it blocks on host input long after the process is gone
        spawn_copy("stdin", input, File::from(stdin_write))?;

        let copies = vec![
            spawn_copy("stdout", File::from(stdout_read), output)?,
            spawn_copy("stderr", File::from(stderr_read), error)?,
        ];

        io.stdin = Some(stdin_read);
        io.stdout = Some(stdout_write);
        io.stderr = Some(stderr_write);

        Ok(Self { copies })
    }

    /// Wait for the output copies to drain
    pub fn close(self) -> Result<()> {
        for handle in self.copies {
            if handle.join().is_err() {
                warn!("pipe copy thread panicked");
            }
        }
        Ok(())
    }
}
