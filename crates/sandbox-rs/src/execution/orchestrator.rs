//! End-to-end launch of one process: I/O wiring, start, supervision and
//! teardown.

use std::path::PathBuf;

use log::{debug, error, info, warn};
use sandbox_console::{HostStreams, IoBridge, PipeBridge, ProcessIo};
use sandbox_core::{Result, SandboxError};

use super::process::{ProcessDescriptor, ProcessSpec};
use super::signal::{ForwardOutcome, SignalCoordinator};
use crate::container::{Container, ContainerProcess};

/// Per-launch knobs that are not part of the process itself
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Become the subreaper for orphaned descendants
    pub subreaper: bool,
    /// Hand the console to `console_socket` and return once started
    pub detach: bool,
    pub console_socket: Option<PathBuf>,
    /// Passed through to the process descriptor
    pub log_level: Option<String>,
    /// Without a terminal, share our stdio instead of copying through pipes
    pub inherit_stdio: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            subreaper: true,
            detach: false,
            console_socket: None,
            log_level: None,
            inherit_stdio: false,
        }
    }
}

/// How a launch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(i32),
    Detached,
}

impl RunOutcome {
    /// Status for the supervisor's own exit; 0 for detached launches
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Exited(code) => *code,
            RunOutcome::Detached => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Idle,
    Built,
    ConsoleAttaching,
    Running,
    ConsoleConfirmed,
    ForwardingSignals,
    Exited,
    Detached,
    Failed,
    Destroyed,
}

/// Drives a single launch from process spec to destroyed container
pub struct ExecutionOrchestrator {
    options: RunOptions,
    signals: Option<SignalCoordinator>,
    host_streams: Option<HostStreams>,
    state: LaunchState,
}

impl ExecutionOrchestrator {
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            signals: None,
            host_streams: None,
            state: LaunchState::Idle,
        }
    }

    /// Use an existing coordinator instead of subscribing to host signals
    pub fn with_signals(mut self, signals: SignalCoordinator) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Copy pipe-mode output to `streams` instead of this process's stdio
    pub fn with_host_streams(mut self, streams: HostStreams) -> Self {
        self.host_streams = Some(streams);
        self
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Launch `spec` in `container` and supervise it until it exits.
    ///
    /// The container is destroyed on every path except a detached launch,
    /// where supervision belongs to whoever holds the console.
    pub fn run<C: Container>(
        &mut self,
        spec: &ProcessSpec,
        container: &mut C,
    ) -> Result<RunOutcome> {
        if self.state != LaunchState::Idle {
            return Err(SandboxError::AlreadyRunning);
        }
        if self.options.detach && !spec.terminal {
            return Err(SandboxError::InvalidConfig(
                "detached launches need a terminal".to_string(),
            ));
        }

        let mut descriptor =
            ProcessDescriptor::from_spec(spec, true, self.options.log_level.as_deref())?;
        self.transition(LaunchState::Built);

        let root_uid = container.config().host_root_uid()?;
        let root_gid = container.config().host_root_gid()?;

        let coordinator = match self.signals.take() {
            Some(coordinator) => coordinator,
            None => SignalCoordinator::start(self.options.subreaper)?,
        };

        self.transition(LaunchState::ConsoleAttaching);
        let mut bridge = match self.attach(spec.terminal, &mut descriptor.io, root_uid, root_gid) {
            Ok(bridge) => bridge,
            Err(e) => {
                self.transition(LaunchState::Failed);
                self.destroy(container);
                return Err(e);
            }
        };

        let mut process = match container.run(descriptor) {
            Ok(process) => process,
            Err(e) => {
                error!("container {}: failed to start process: {}", container.id(), e);
                self.fail(container, None::<&mut C::Process>, bridge);
                return Err(e);
            }
        };
        self.transition(LaunchState::Running);

        if let Err(e) = bridge.wait_console() {
            self.fail(container, Some(&mut process), bridge);
            return Err(e);
        }
        if let Err(e) = bridge.close_post_start() {
            self.fail(container, Some(&mut process), bridge);
            return Err(e);
        }
        self.transition(LaunchState::ConsoleConfirmed);

        self.transition(LaunchState::ForwardingSignals);
        let outcome = coordinator.forward(&mut process, &bridge, self.options.detach);
        drop(coordinator);

        match outcome {
            Ok(ForwardOutcome::Exited(status)) => {
                self.transition(LaunchState::Exited);
                info!("container {}: process exited with {}", container.id(), status);
                self.destroy(container);
                self.close(bridge);
                Ok(RunOutcome::Exited(status))
            }
            Ok(ForwardOutcome::Detached) => {
                self.transition(LaunchState::Detached);
                self.close(bridge);
                Ok(RunOutcome::Detached)
            }
            Err(e) => {
                self.fail(container, Some(&mut process), bridge);
                Err(e)
            }
        }
    }

    fn attach(
        &mut self,
        terminal: bool,
        io: &mut ProcessIo,
        root_uid: u32,
        root_gid: u32,
    ) -> Result<IoBridge> {
        if terminal {
            return IoBridge::console(
                io,
                self.options.detach,
                self.options.console_socket.as_deref(),
            );
        }
        if self.options.inherit_stdio {
            return Ok(IoBridge::inherit(io));
        }

        match self.host_streams.take() {
            Some(streams) => Ok(IoBridge::Pipes(PipeBridge::attach_with(
                io, root_uid, root_gid, streams,
            )?)),
            None => IoBridge::pipes(io, root_uid, root_gid),
        }
    }

    /// Kill the process if there is one, then tear everything down
    fn fail<C: Container>(
        &mut self,
        container: &mut C,
        process: Option<&mut C::Process>,
        bridge: IoBridge,
    ) {
        self.transition(LaunchState::Failed);
        if let Some(process) = process {
            terminate(process);
        }
        self.destroy(container);
        self.close(bridge);
    }

    fn destroy<C: Container>(&mut self, container: &mut C) {
        if let Err(e) = container.destroy() {
            error!("container {}: destroy failed: {}", container.id(), e);
        }
        self.transition(LaunchState::Destroyed);
    }

    fn close(&mut self, bridge: IoBridge) {
        if let Err(e) = bridge.close() {
            warn!("closing process i/o: {}", e);
        }
    }

    fn transition(&mut self, next: LaunchState) {
        debug!("launch: {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// SIGKILL then wait, with no timeout
fn terminate<P: ContainerProcess>(process: &mut P) {
    if let Err(e) = process.signal(libc::SIGKILL) {
        debug!("terminate: {}", e);
    }
    if let Err(e) = process.wait() {
        debug!("terminate: wait: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_options_default_enables_subreaper() {
        let options = RunOptions::default();
        assert!(options.subreaper);
        assert!(!options.detach);
        assert!(!options.inherit_stdio);
        assert!(options.console_socket.is_none());
    }

    #[test]
    fn run_outcome_exit_code() {
        assert_eq!(RunOutcome::Exited(7).exit_code(), 7);
        assert_eq!(RunOutcome::Detached.exit_code(), 0);
    }

    #[test]
    fn new_orchestrator_is_idle() {
        let orchestrator = ExecutionOrchestrator::new(RunOptions::default());
        assert_eq!(orchestrator.state(), LaunchState::Idle);
        assert!(orchestrator.options().subreaper);
    }
}
