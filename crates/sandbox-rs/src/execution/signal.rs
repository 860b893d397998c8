//! Signal forwarding and child reaping for a supervised process.
//!
//! Every catchable signal the supervisor receives is queued by a pump thread
//! and handled one at a time by [`SignalCoordinator::forward`]:
//! - `SIGWINCH` resizes the process console
//! - `SIGCHLD` triggers a reap pass; the loop ends once the primary process
//!   is among the reaped
//! - anything else is relayed to the primary process

use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, Receiver, Sender, TrySendError};
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use sandbox_console::{DefaultActions, IoBridge};
use sandbox_core::{Result, SandboxError};
use signal_hook::consts::{FORBIDDEN, SIGCHLD, SIGWINCH};
use signal_hook::iterator::{Handle, Signals};

use crate::container::ContainerProcess;

/// Capacity of the queue between the pump thread and the forwarding loop
pub const SIGNAL_QUEUE_SIZE: usize = 2048;

/// One child collected by a reap pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    pub pid: Pid,
    /// Exit code, or 128 + signal number for signal deaths
    pub status: i32,
}

/// How a forwarding loop ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Exited(i32),
    /// Supervision was handed to whoever holds the console
    Detached,
}

enum Event {
    Signal(i32),
    Interrupted,
    QueueClosed,
    InterruptsClosed,
}

/// Exit code for a terminal wait status; `None` for stops and continues
pub fn exit_status(status: WaitStatus) -> Option<(Pid, i32)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid, code)),
        WaitStatus::Signaled(pid, signal, _) => Some((pid, 128 + signal as i32)),
        _ => None,
    }
}

/// Collect every child that has already exited, without blocking
pub fn reap_children() -> Result<Vec<ExitRecord>> {
    let mut exits = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some((pid, status)) = exit_status(status) {
                    exits.push(ExitRecord { pid, status });
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => return Err(SandboxError::syscall("waitpid", e)),
        }
    }
    Ok(exits)
}

/// Every signal `signal-hook` lets us register, realtime ones included
fn catchable_signals() -> Vec<i32> {
    (1..=31)
        .chain(libc::SIGRTMIN()..=libc::SIGRTMAX())
        .filter(|sig| !FORBIDDEN.contains(sig))
        .collect()
}

fn enable_subreaper() {
    // SAFETY: integer-only prctl
    let res = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    if res != 0 {
        warn!(
            "failed to become a child subreaper: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Owns the signal subscription and its queue for one supervised launch
pub struct SignalCoordinator {
    signals: Receiver<i32>,
    pump: Option<(Handle, JoinHandle<()>)>,
    // released after the pump stops; the signals act as before again
    _defaults: Option<DefaultActions>,
}

impl SignalCoordinator {
    /// Subscribe to all catchable signals, optionally becoming the subreaper
    /// for orphaned descendants first.
    pub fn start(subreaper: bool) -> Result<Self> {
        if subreaper {
            enable_subreaper();
        }

        let catchable = catchable_signals();
        let defaults = DefaultActions::hold(&catchable)?;
        let mut signals = Signals::new(catchable)
            .map_err(|e| SandboxError::Signal(format!("failed to register handlers: {}", e)))?;
        let handle = signals.handle();
        let (tx, rx) = crossbeam_channel::bounded(SIGNAL_QUEUE_SIZE);

        let pump = thread::Builder::new()
            .name("signal-pump".to_string())
            .spawn(move || pump(&mut signals, tx))
            .map_err(SandboxError::Io)?;

        Ok(Self {
            signals: rx,
            pump: Some((handle, pump)),
            _defaults: Some(defaults),
        })
    }

    /// Forward signals from a caller-owned queue instead of the host
    pub fn from_channel(signals: Receiver<i32>) -> Self {
        Self {
            signals,
            pump: None,
            _defaults: None,
        }
    }

    pub fn reap(&self) -> Result<Vec<ExitRecord>> {
        reap_children()
    }

    /// Run the forwarding loop until the primary process exits.
    ///
    /// Returns `Detached` straight away for detached launches. Errors end the
    /// loop with the process possibly still running; the caller terminates it.
    pub fn forward<P: ContainerProcess>(
        &self,
        process: &mut P,
        bridge: &IoBridge,
        detach: bool,
    ) -> Result<ForwardOutcome> {
        if detach {
            return Ok(ForwardOutcome::Detached);
        }

        let pid1 = process.pid()?;

        if let Err(e) = bridge.resize() {
            debug!("initial console resize: {}", e);
        }

        let mut interrupts = bridge.interrupts();
        loop {
            let event = select! {
                recv(self.signals) -> msg => match msg {
                    Ok(sig) => Event::Signal(sig),
                    Err(_) => Event::QueueClosed,
                },
                recv(interrupts) -> msg => match msg {
                    Ok(()) => Event::Interrupted,
                    Err(_) => Event::InterruptsClosed,
                },
            };

            match event {
                Event::Signal(SIGWINCH) => {
                    if let Err(e) = bridge.resize() {
                        debug!("console resize: {}", e);
                    }
                }
                Event::Signal(SIGCHLD) => {
                    let exits = self.reap()?;
                    for exit in &exits {
                        debug!("process exited: pid={} status={}", exit.pid, exit.status);
                    }
                    if let Some(exit) = exits.iter().find(|exit| exit.pid == pid1) {
                        // the status is already known; this only lets the
                        // process's own bookkeeping settle
                        let _ = process.wait();
                        return Ok(ForwardOutcome::Exited(exit.status));
                    }
                }
                Event::Signal(sig) => {
                    debug!("forwarding signal {} to {}", sig, pid1);
                    if let Err(e) = process.signal(sig) {
                        error!("failed to forward signal {} to {}: {}", sig, pid1, e);
                    }
                }
                Event::Interrupted => return Err(SandboxError::Interrupted),
                Event::InterruptsClosed => interrupts = crossbeam_channel::never(),
                Event::QueueClosed => {
                    return Err(SandboxError::Signal(
                        "signal queue closed before the process exited".to_string(),
                    ))
                }
            }
        }
    }
}

impl Drop for SignalCoordinator {
    fn drop(&mut self) {
        if let Some((handle, pump)) = self.pump.take() {
            handle.close();
            if pump.join().is_err() {
                warn!("signal pump thread panicked");
            }
        }
    }
}

fn pump(signals: &mut Signals, tx: Sender<i32>) {
    for sig in signals.forever() {
        match tx.try_send(sig) {
            Ok(()) => {}
            Err(TrySendError::Full(sig)) => warn!("signal queue full, dropping signal {}", sig),
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
}
