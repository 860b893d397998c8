//! Edge-triggered epoll multiplexing for consoles.
//!
//! A pseudo-terminal master returns `EIO` whenever no slave is open, which
//! happens briefly while a container's init is still setting up and again
//! once the process exits. [`EpollConsole`] turns those hangups (and
//! `EAGAIN`) into waits that the [`Epoller`] wakes up on the next edge, and
//! only reports end of file after [`EpollConsole::shutdown`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::debug;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use sandbox_core::{Result, SandboxError};

use crate::console::{resize_fd, Console, WinSize};

const MAX_EVENTS: usize = 128;
const WAKE_TOKEN: u64 = u64::MAX;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn is_hangup(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EIO))
}

fn set_nonblocking(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| SandboxError::syscall("fcntl(F_GETFL)", e))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| SandboxError::syscall("fcntl(F_SETFL)", e))?;
    Ok(())
}

/// Owns an epoll instance and dispatches readiness edges to registered consoles
pub struct Epoller {
    epoll: Epoll,
    wake: EventFd,
    consoles: Mutex<HashMap<RawFd, Arc<EpollConsole>>>,
}

impl Epoller {
    pub fn new() -> Result<Arc<Self>> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| SandboxError::syscall("epoll_create1", e))?;
        let wake = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(|e| SandboxError::syscall("eventfd", e))?;
        epoll
            .add(&wake, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))
            .map_err(|e| SandboxError::syscall("epoll_ctl", e))?;

        Ok(Arc::new(Self {
            epoll,
            wake,
            consoles: Mutex::new(HashMap::new()),
        }))
    }

    /// Register a console, switching it to non-blocking mode.
    ///
    /// Only the descriptor is kept; terminal modes stay with whoever owns the
    /// host side.
    pub fn add(&self, console: Console) -> Result<Arc<EpollConsole>> {
        let file = console.into_file();
        set_nonblocking(&file)?;

        let fd = file.as_raw_fd();
        let events =
            EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLET;
        self.epoll
            .add(&file, EpollEvent::new(events, fd as u64))
            .map_err(|e| SandboxError::syscall("epoll_ctl", e))?;

        let console = Arc::new(EpollConsole {
            fd,
            state: Mutex::new(ConsoleState {
                file: Some(file),
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        });
        lock(&self.consoles).insert(fd, Arc::clone(&console));
        Ok(console)
    }

    /// Deregister a console; used as the close hook for [`EpollConsole::shutdown`]
    pub fn close_console(&self, fd: BorrowedFd<'_>) -> Result<()> {
        lock(&self.consoles).remove(&fd.as_raw_fd());
        self.epoll
            .delete(fd)
            .map_err(|e| SandboxError::syscall("epoll_ctl", e))
    }

    /// Dispatch events until [`Epoller::close`] is called
    pub fn wait(&self) -> Result<()> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        loop {
            let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(SandboxError::syscall("epoll_wait", e)),
            };

            for event in &events[..n] {
                let flags = event.events();
                if event.data() == WAKE_TOKEN {
                    debug!("epoller woken for close");
                    return Ok(());
                }

                let console = match lock(&self.consoles).get(&(event.data() as RawFd)) {
                    Some(console) => Arc::clone(console),
                    None => continue,
                };
                if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                    console.signal_read();
                }
                if flags.intersects(EpollFlags::EPOLLOUT | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                    console.signal_write();
                }
            }
        }
    }

    /// Stop the wait loop. The epoll descriptor itself is released on drop.
    pub fn close(&self) -> Result<()> {
        match self.wake.write(1) {
            // counter already non-zero: a previous close is still pending
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(SandboxError::syscall("eventfd write", e)),
        }
    }
}

struct ConsoleState {
    file: Option<File>,
    closed: bool,
}

/// A console descriptor registered with an [`Epoller`].
///
/// `Read` and `Write` are implemented for `&EpollConsole` so one copy thread
/// can read while another writes. Once [`EpollConsole::release`] drops the
/// descriptor, reads report end of file and writes fail with `EIO`.
pub struct EpollConsole {
    fd: RawFd,
    state: Mutex<ConsoleState>,
    readable: Condvar,
    writable: Condvar,
}

impl EpollConsole {
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Whether the descriptor is still held
    pub fn is_open(&self) -> bool {
        lock(&self.state).file.is_some()
    }

    pub fn resize(&self, size: WinSize) -> Result<()> {
        match &lock(&self.state).file {
            Some(file) => resize_fd(file.as_raw_fd(), size)
                .map_err(|e| SandboxError::syscall("TIOCSWINSZ", e)),
            None => Ok(()),
        }
    }

    /// Mark the console closed, wake every blocked reader and writer, then
    /// run `close` on the descriptor. The descriptor stays open so buffered
    /// output can still be drained.
    pub fn shutdown<F>(&self, close: F) -> Result<()>
    where
        F: FnOnce(BorrowedFd<'_>) -> Result<()>,
    {
        let mut state = lock(&self.state);
        state.closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
        match &state.file {
            Some(file) => close(file.as_fd()),
            None => Ok(()),
        }
    }

    /// Close the descriptor for good
    pub fn release(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        if state.file.take().is_some() {
            debug!("console {} released", self.fd);
        }
        self.readable.notify_all();
        self.writable.notify_all();
    }

    fn signal_read(&self) {
        let _guard = lock(&self.state);
        self.readable.notify_one();
    }

    fn signal_write(&self) {
        let _guard = lock(&self.state);
        self.writable.notify_one();
    }
}

impl Read for &EpollConsole {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = lock(&self.state);
        loop {
            let result = match &state.file {
                Some(file) => (&*file).read(buf),
                None => return Ok(0),
            };
            match result {
                Ok(n) => {
                    self.readable.notify_one();
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_hangup(&e) => {
                    if state.closed {
                        return Ok(0);
                    }
                    state = self
                        .readable
                        .wait(state)
                        .unwrap_or_else(|poison| poison.into_inner());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Write for &EpollConsole {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        let mut state = lock(&self.state);
        while written < buf.len() {
            let result = match &state.file {
                Some(file) => (&*file).write(&buf[written..]),
                None => Err(io::Error::from_raw_os_error(libc::EIO)),
            };
            match result {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_hangup(&e) && state.file.is_some() => {
                    if state.closed {
                        return Err(io::Error::from_raw_os_error(libc::EIO));
                    }
                    state = self
                        .writable
                        .wait(state)
                        .unwrap_or_else(|poison| poison.into_inner());
                }
                Err(e) if written > 0 => {
                    debug!("console write stopped after {} bytes: {}", written, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.writable.notify_one();
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
