//! SIGINT listener active while the host terminal is in raw mode

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use sandbox_core::{Result, SandboxError};
use signal_hook::consts::SIGINT;
use signal_hook::iterator::{Handle, Signals};

use crate::dispositions::DefaultActions;

/// Turns SIGINT into a message on a channel.
///
/// Whoever supervises the process selects on [`InterruptListener::receiver`]
/// and runs its normal teardown, which restores the host terminal.
pub struct InterruptListener {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
    rx: Receiver<()>,
    // dropped after the pump thread so SIGINT terminates again
    _defaults: DefaultActions,
}

impl InterruptListener {
    pub fn start() -> Result<Self> {
        let defaults = DefaultActions::hold(&[SIGINT])?;
        let mut signals = Signals::new([SIGINT])
            .map_err(|e| SandboxError::Signal(format!("unable to watch SIGINT: {}", e)))?;
        let handle = signals.handle();
        let (tx, rx): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(1);

        let thread = thread::Builder::new()
            .name("console-interrupt".to_string())
            .spawn(move || {
                for _ in signals.forever() {
                    debug!("interrupt received");
                    // one pending interrupt is enough
                    let _ = tx.try_send(());
                }
            })
            .map_err(SandboxError::Io)?;

        Ok(Self {
            handle,
            thread: Some(thread),
            rx,
            _defaults: defaults,
        })
    }

    pub fn receiver(&self) -> Receiver<()> {
        self.rx.clone()
    }

    /// Unsubscribe and wait for the listener thread to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("interrupt listener panicked");
            }
        }
    }
}

impl Drop for InterruptListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}
