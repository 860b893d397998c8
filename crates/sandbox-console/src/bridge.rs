//! Wiring a process's standard streams to the supervisor.
//!
//! [`IoBridge`] is chosen once per launch and fixes how the process talks to
//! the host: inherited stdio, pipes, or a pseudo-terminal the container's init
//! allocates and sends back over a socket.

use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use sandbox_core::{Result, SandboxError};

use crate::console::Console;
use crate::epoll::{EpollConsole, Epoller};
use crate::interrupt::InterruptListener;
use crate::io::{HostStreams, ProcessIo};
use crate::pipes::PipeBridge;
use crate::socket::recv_fd;

/// How a process's stdio is connected, decided before the process starts
pub enum IoBridge {
    /// The process shares the supervisor's stdin, stdout and stderr
    Inherit,
    Pipes(PipeBridge),
    Console(ConsoleBridge),
}

impl IoBridge {
    pub fn inherit(io: &mut ProcessIo) -> Self {
        io.stdin = None;
        io.stdout = None;
        io.stderr = None;
        io.console_socket = None;
        IoBridge::Inherit
    }

    pub fn pipes(io: &mut ProcessIo, root_uid: u32, root_gid: u32) -> Result<Self> {
        Ok(IoBridge::Pipes(PipeBridge::attach(io, root_uid, root_gid)?))
    }

    pub fn console(io: &mut ProcessIo, detach: bool, socket_path: Option<&Path>) -> Result<Self> {
        Ok(IoBridge::Console(ConsoleBridge::attach(
            io,
            detach,
            socket_path,
        )?))
    }

    /// Block until the process's console is connected; immediate unless a
    /// console is expected back from the container.
    pub fn wait_console(&mut self) -> Result<()> {
        match self {
            IoBridge::Console(console) => console.wait_console(),
            _ => Ok(()),
        }
    }

    /// Release descriptors only needed while the process was starting
    pub fn close_post_start(&mut self) -> Result<()> {
        match self {
            IoBridge::Console(console) => console.close_post_start(),
            _ => Ok(()),
        }
    }

    /// Copy the host terminal size to the process console, if there is one yet
    pub fn resize(&self) -> Result<()> {
        match self {
            IoBridge::Console(console) => console.resize(),
            _ => Ok(()),
        }
    }

    /// Fires when the user interrupts an interactive session
    pub fn interrupts(&self) -> Receiver<()> {
        match self {
            IoBridge::Console(console) => console.interrupts(),
            _ => crossbeam_channel::never(),
        }
    }

    pub fn is_console(&self) -> bool {
        matches!(self, IoBridge::Console(_))
    }

    /// Tear everything down once the process has been released
    pub fn close(self) -> Result<()> {
        match self {
            IoBridge::Inherit => Ok(()),
            IoBridge::Pipes(pipes) => pipes.close(),
            IoBridge::Console(console) => console.close(),
        }
    }
}

/// Everything that exists once the process console has been received
struct ConsoleSession {
    console: Arc<EpollConsole>,
    epoller: Arc<Epoller>,
    waiter: JoinHandle<()>,
    copies: Vec<JoinHandle<()>>,
    interrupt: Option<InterruptListener>,
}

/// Pseudo-terminal bridging.
///
/// Not detached: the host console is opened locally and a socket pair is
/// created; init gets one end and sends the pty master back on the other.
/// Detached: the caller's socket is dialed and handed to init, so the console
/// goes to whoever listens there and nothing is opened locally.
pub struct ConsoleBridge {
    host: Option<Console>,
    streams: Option<HostStreams>,
    post_start: Vec<UnixStream>,
    pending: Option<Receiver<Result<OwnedFd>>>,
    listener: Option<JoinHandle<()>>,
    session: Option<ConsoleSession>,
    watch_interrupts: bool,
    received: bool,
}

impl ConsoleBridge {
    pub fn attach(io: &mut ProcessIo, detach: bool, socket_path: Option<&Path>) -> Result<Self> {
        if detach {
            let path = socket_path.ok_or_else(|| {
                SandboxError::InvalidConfig(
                    "a detached console needs a console socket path".to_string(),
                )
            })?;
            return Self::dial(io, path);
        }
        Self::attach_host(io, Console::current()?, HostStreams::std())
    }

    /// Bridge to an explicit host console and host streams
    pub fn attach_host(io: &mut ProcessIo, host: Console, streams: HostStreams) -> Result<Self> {
        let (parent, child) = UnixStream::pair()?;
        let listen_end = parent.try_clone()?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        let listener = thread::Builder::new()
            .name("console-recv".to_string())
            .spawn(move || {
                let received = recv_fd(&listen_end).map(|(fd, name)| {
                    debug!("received console descriptor {:?}", name);
                    fd
                });
                let _ = tx.send(received);
            })
            .map_err(SandboxError::Io)?;

        io.console_socket = Some(OwnedFd::from(child));

        Ok(Self {
            host: Some(host),
            streams: Some(streams),
            post_start: vec![parent],
            pending: Some(rx),
            listener: Some(listener),
            session: None,
            watch_interrupts: true,
            received: false,
        })
    }

    fn dial(io: &mut ProcessIo, path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| {
            SandboxError::Console(format!(
                "unable to connect to console socket {}: {}",
                path.display(),
                e
            ))
        })?;
        io.console_socket = Some(OwnedFd::from(stream.try_clone()?));
        info!("console will be delivered to {}", path.display());

        Ok(Self {
            host: None,
            streams: None,
            post_start: vec![stream],
            pending: None,
            listener: None,
            session: None,
            watch_interrupts: false,
            received: false,
        })
    }

    /// Skip SIGINT handling; used when the caller owns signal dispositions
    pub fn without_interrupts(mut self) -> Self {
        self.watch_interrupts = false;
        self
    }

    pub fn is_received(&self) -> bool {
        self.received
    }

    pub fn is_detached(&self) -> bool {
        self.host.is_none()
    }

    pub fn host(&self) -> Option<&Console> {
        self.host.as_ref()
    }

    pub fn wait_console(&mut self) -> Result<()> {
        let rx = match self.pending.take() {
            Some(rx) => rx,
            None => return Ok(()),
        };
        let fd = rx.recv().map_err(|_| {
            SandboxError::Console("console listener exited without a result".to_string())
        })??;
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
        self.receive_console(fd)
    }

    /// Take over the process console: bridge it to the host streams and put
    /// the host terminal in raw mode.
    pub fn receive_console(&mut self, fd: OwnedFd) -> Result<()> {
        let console = Console::from_fd(fd)?;
        console.clear_onlcr()?;

        let epoller = Epoller::new()?;
        let console = epoller.add(console)?;

        let waiter = {
            let epoller = Arc::clone(&epoller);
            thread::Builder::new()
                .name("console-epoll".to_string())
                .spawn(move || {
                    if let Err(e) = epoller.wait() {
                        warn!("console epoll loop failed: {}", e);
                    }
                })
                .map_err(SandboxError::Io)?
        };

        let mut session = ConsoleSession {
            console,
            epoller,
            waiter,
            copies: Vec::new(),
            interrupt: None,
        };

        if let Err(e) = self.start_session(&mut session) {
            session.abort();
            return Err(e);
        }

        self.session = Some(session);
        self.received = true;
        Ok(())
    }

    fn start_session(&mut self, session: &mut ConsoleSession) -> Result<()> {
        let HostStreams {
            mut input,
            mut output,
            error: _,
        } = self.streams.take().unwrap_or_default();

        // detached: blocks on host input until the supervisor exits
        let writer = Arc::clone(&session.console);
        thread::Builder::new()
            .name("console-stdin".to_string())
            .spawn(move || {
                let _ = io::copy(&mut input, &mut &*writer);
            })
            .map_err(SandboxError::Io)?;

        let reader = Arc::clone(&session.console);
        let output_copy = thread::Builder::new()
            .name("console-stdout".to_string())
            .spawn(move || {
                if let Err(e) = io::copy(&mut &*reader, &mut output) {
                    debug!("console output copy stopped: {}", e);
                }
                let _ = output.flush();
            })
            .map_err(SandboxError::Io)?;
        session.copies.push(output_copy);

        if let Some(host) = self.host.as_mut() {
            host.set_raw().map_err(|e| {
                SandboxError::Console(format!("failed to set the host terminal raw: {}", e))
            })?;
        }

        if self.watch_interrupts {
            session.interrupt = Some(InterruptListener::start()?);
        }
        Ok(())
    }

    pub fn resize(&self) -> Result<()> {
        match (&self.session, &self.host) {
            (Some(session), Some(host)) => session.console.resize(host.size()?),
            _ => Ok(()),
        }
    }

    pub fn interrupts(&self) -> Receiver<()> {
        self.session
            .as_ref()
            .and_then(|session| session.interrupt.as_ref())
            .map(InterruptListener::receiver)
            .unwrap_or_else(crossbeam_channel::never)
    }

    pub fn close_post_start(&mut self) -> Result<()> {
        for socket in self.post_start.drain(..) {
            if let Err(e) = socket.shutdown(std::net::Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    debug!("console socket shutdown: {}", e);
                }
            }
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.close_post_start()?;

        if let Some(session) = &self.session {
            let epoller = Arc::clone(&session.epoller);
            if let Err(e) = session
                .console
                .shutdown(|fd| epoller.close_console(fd))
            {
                debug!("console shutdown: {}", e);
            }
        }

        if !self.received {
            if let Some(listener) = self.listener.take() {
                let _ = listener.join();
            }
            self.host = None;
            return Ok(());
        }

        if let Some(session) = self.session.take() {
            session.finish();
        }
        if let Some(host) = self.host.as_mut() {
            host.reset()?;
        }
        Ok(())
    }
}

impl ConsoleSession {
    fn finish(self) {
        for copy in self.copies {
            if copy.join().is_err() {
                warn!("console copy thread panicked");
            }
        }
        // the stdin copy may still be blocked on host input; dropping the
        // master makes its next write fail instead of keeping the pty alive
        self.console.release();
        if let Err(e) = self.epoller.close() {
            warn!("closing console epoller: {}", e);
        }
        if self.waiter.join().is_err() {
            warn!("console epoll thread panicked");
        }
        if let Some(interrupt) = self.interrupt {
            interrupt.stop();
        }
    }

    fn abort(self) {
        let epoller = Arc::clone(&self.epoller);
        let _ = self.console.shutdown(|fd| epoller.close_console(fd));
        self.finish();
    }
}
