//! Terminal handles: the host's own terminal and pseudo-terminal masters

use std::fs::File;
use std::io::{self, IsTerminal, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::pty::{openpty, Winsize};
use nix::sys::termios::{self, OutputFlags, SetArg, Termios};
use sandbox_core::{Result, SandboxError};

nix::ioctl_read_bad!(get_winsize, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(set_winsize, libc::TIOCSWINSZ, libc::winsize);
nix::ioctl_write_int_bad!(set_controlling_terminal, libc::TIOCSCTTY);

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WinSize {
    pub rows: u16,
    pub cols: u16,
}

impl From<libc::winsize> for WinSize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
        }
    }
}

impl From<WinSize> for libc::winsize {
    fn from(size: WinSize) -> Self {
        libc::winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

/// An open terminal device.
///
/// Remembers the mode it had before [`Console::set_raw`] so that
/// [`Console::reset`] can put it back.
pub struct Console {
    file: File,
    saved: Option<Termios>,
}

impl Console {
    /// Wrap a descriptor, failing with [`SandboxError::NotAConsole`] if it is not a terminal
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        if !fd.is_terminal() {
            return Err(SandboxError::NotAConsole);
        }
        Ok(Self {
            file: File::from(fd),
            saved: None,
        })
    }

    /// Duplicate a borrowed descriptor into a console of its own
    pub fn from_borrowed(fd: BorrowedFd<'_>) -> Result<Self> {
        if !fd.is_terminal() {
            return Err(SandboxError::NotAConsole);
        }
        Self::from_fd(fd.try_clone_to_owned()?)
    }

    /// The terminal this process is attached to.
    ///
    /// Any of the standard streams may be redirected, so stderr, stdout and
    /// stdin are tried in that order. When none of them is a terminal a fresh
    /// pseudo-terminal is allocated and its master is used instead.
    pub fn current() -> Result<Self> {
        let stderr = io::stderr();
        let stdout = io::stdout();
        let stdin = io::stdin();

        for fd in [stderr.as_fd(), stdout.as_fd(), stdin.as_fd()] {
            match Self::from_borrowed(fd) {
                Ok(console) => return Ok(console),
                Err(SandboxError::NotAConsole) => continue,
                Err(e) => return Err(SandboxError::Console(format!("unable to get console: {}", e))),
            }
        }

        let (master, _slave) = Self::new_pty()?;
        Ok(master)
    }

    /// Allocate a pseudo-terminal, returning the master as a console and the slave end
    pub fn new_pty() -> Result<(Self, OwnedFd)> {
        let pty = openpty(None::<&Winsize>, None::<&Termios>)
            .map_err(|e| SandboxError::syscall("openpty", e))?;
        let master = Self::from_fd(pty.master)?;
        Ok((master, pty.slave))
    }

    pub fn size(&self) -> Result<WinSize> {
        size_of(self.file.as_raw_fd())
    }

    pub fn resize(&self, size: WinSize) -> Result<()> {
        resize_fd(self.file.as_raw_fd(), size)
            .map_err(|e| SandboxError::syscall("TIOCSWINSZ", e))
    }

    /// Copy the window size of `other` onto this console
    pub fn resize_from(&self, other: &Console) -> Result<()> {
        self.resize(other.size()?)
    }

    /// Put the terminal in raw mode, saving the current mode first
    pub fn set_raw(&mut self) -> Result<()> {
        let current =
            termios::tcgetattr(&self.file).map_err(|e| SandboxError::syscall("tcgetattr", e))?;
        let mut raw = current.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&self.file, SetArg::TCSANOW, &raw)
            .map_err(|e| SandboxError::syscall("tcsetattr", e))?;
        if self.saved.is_none() {
            self.saved = Some(current);
        }
        Ok(())
    }

    /// Restore the mode saved by [`Console::set_raw`]; a no-op if it was never called
    pub fn reset(&mut self) -> Result<()> {
        if let Some(saved) = self.saved.take() {
            termios::tcsetattr(&self.file, SetArg::TCSANOW, &saved)
                .map_err(|e| SandboxError::syscall("tcsetattr", e))?;
        }
        Ok(())
    }

    pub fn is_raw(&self) -> bool {
        self.saved.is_some()
    }

    /// Stop the line discipline from turning `\n` into `\r\n` on output
    pub fn clear_onlcr(&self) -> Result<()> {
        let mut attrs =
            termios::tcgetattr(&self.file).map_err(|e| SandboxError::syscall("tcgetattr", e))?;
        attrs.output_flags.remove(OutputFlags::ONLCR);
        termios::tcsetattr(&self.file, SetArg::TCSANOW, &attrs)
            .map_err(|e| SandboxError::syscall("tcsetattr", e))
    }

    /// Give up the terminal mode bookkeeping and keep only the descriptor
    pub(crate) fn into_file(self) -> File {
        self.file
    }
}

impl AsFd for Console {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for Console {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Read for Console {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for Console {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Window size of any terminal descriptor
pub fn size_of(fd: RawFd) -> Result<WinSize> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe { get_winsize(fd, &mut ws) }.map_err(|e| SandboxError::syscall("TIOCGWINSZ", e))?;
    Ok(ws.into())
}

/// Set the window size of any terminal descriptor.
///
/// Returns the bare errno so it can run in a freshly cloned child.
pub fn resize_fd(fd: RawFd, size: WinSize) -> nix::Result<()> {
    let ws: libc::winsize = size.into();
    unsafe { set_winsize(fd, &ws) }.map(drop)
}

/// Make `fd` the controlling terminal of the calling session leader
pub fn make_controlling_terminal(fd: RawFd) -> nix::Result<()> {
    unsafe { set_controlling_terminal(fd, 0) }.map(drop)
}
