//! Supervision tests: reaping, signal forwarding and launch teardown.
//!
//! Reap passes collect every child of the test process, so each test holds
//! the serial guard while it has children.

use std::io::{self, Write};
use std::os::unix::net::UnixListener;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use sandbox_console::{send_fd, Console, ConsoleBridge, HostStreams, IoBridge, ProcessIo};
use sandbox_rs::execution::signal::{exit_status, reap_children, SIGNAL_QUEUE_SIZE};
use sandbox_rs::execution::LaunchState;
use sandbox_rs::test_support::serial_guard;
use sandbox_rs::{
    Container, ContainerConfig, ContainerProcess, ExecutionOrchestrator, ForwardOutcome,
    NamespaceConfig, NamespaceContainer, ProcessDescriptor, ProcessSpec, Result, RunOptions,
    RunOutcome, SandboxError, SignalCoordinator,
};

/// A plain child process standing in for a container's init
struct ForkedProcess {
    pid: Pid,
}

impl ForkedProcess {
    fn spawn(script: &str) -> Self {
        let child = Command::new("/bin/sh")
            .args(["-c", script])
            .spawn()
            .unwrap();
        Self {
            pid: Pid::from_raw(child.id() as i32),
        }
    }
}

impl ContainerProcess for ForkedProcess {
    fn pid(&self) -> Result<Pid> {
        Ok(self.pid)
    }

    fn signal(&self, sig: libc::c_int) -> Result<()> {
        if unsafe { libc::kill(self.pid.as_raw(), sig) } != 0 {
            return Err(SandboxError::syscall("kill", Errno::last()));
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<Option<i32>> {
        match waitpid(self.pid, None) {
            Ok(status) => Ok(exit_status(status).map(|(_, code)| code)),
            Err(Errno::ECHILD) => Ok(None),
            Err(e) => Err(SandboxError::syscall("waitpid", e)),
        }
    }
}

fn kill_and_wait(process: &mut ForkedProcess) {
    let _ = process.signal(libc::SIGKILL);
    let _ = process.wait();
}

/// Keep delivering SIGCHLD until the forwarding loop goes away
fn pump_sigchld(tx: Sender<i32>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while tx.send(libc::SIGCHLD).is_ok() {
            thread::sleep(Duration::from_millis(20));
        }
    })
}

fn queue() -> (Sender<i32>, Receiver<i32>) {
    crossbeam_channel::bounded(SIGNAL_QUEUE_SIZE)
}

#[test]
fn reap_without_children_is_empty() {
    let _guard = serial_guard();
    let coordinator = SignalCoordinator::from_channel(crossbeam_channel::never());
    assert!(coordinator.reap().unwrap().is_empty());
}

#[test]
fn forward_returns_primary_exit_status() {
    let _guard = serial_guard();
    let mut process = ForkedProcess::spawn("exit 7");
    let (tx, rx) = queue();
    let coordinator = SignalCoordinator::from_channel(rx);
    let pump = pump_sigchld(tx);

    let outcome = coordinator.forward(&mut process, &IoBridge::Inherit, false);
    drop(coordinator);
    pump.join().unwrap();

    assert_eq!(outcome.unwrap(), ForwardOutcome::Exited(7));
}

#[test]
fn unrelated_child_is_reaped_before_primary_matches() {
    let _guard = serial_guard();
    let unrelated = ForkedProcess::spawn("exit 1");
    let mut primary = ForkedProcess::spawn("sleep 0.3; exit 5");
    let (tx, rx) = queue();
    let coordinator = SignalCoordinator::from_channel(rx);
    let pump = pump_sigchld(tx);

    let outcome = coordinator.forward(&mut primary, &IoBridge::Inherit, false);
    drop(coordinator);
    pump.join().unwrap();

    assert_eq!(outcome.unwrap(), ForwardOutcome::Exited(5));
    assert_eq!(
        waitpid(unrelated.pid, Some(WaitPidFlag::WNOHANG)),
        Err(Errno::ECHILD)
    );
}

#[test]
fn forward_never_succeeds_while_primary_runs() {
    let _guard = serial_guard();
    let mut process = ForkedProcess::spawn("sleep 30");
    let (tx, rx) = queue();
    let coordinator = SignalCoordinator::from_channel(rx);

    for _ in 0..3 {
        tx.send(libc::SIGCHLD).unwrap();
    }
    drop(tx);

    let err = coordinator
        .forward(&mut process, &IoBridge::Inherit, false)
        .unwrap_err();
    assert!(matches!(err, SandboxError::Signal(_)));

    kill_and_wait(&mut process);
}

#[test]
fn other_signals_are_relayed_to_primary() {
    let _guard = serial_guard();
    let mut process =
        ForkedProcess::spawn("trap 'exit 42' TERM; while true; do sleep 0.1; done");
    let (tx, rx) = queue();
    let coordinator = SignalCoordinator::from_channel(rx);

    let sender = thread::spawn(move || {
        // give the shell time to install its trap
        thread::sleep(Duration::from_millis(300));
        if tx.send(libc::SIGTERM).is_err() {
            return;
        }
        while tx.send(libc::SIGCHLD).is_ok() {
            thread::sleep(Duration::from_millis(20));
        }
    });

    let outcome = coordinator.forward(&mut process, &IoBridge::Inherit, false);
    drop(coordinator);
    sender.join().unwrap();

    assert_eq!(outcome.unwrap(), ForwardOutcome::Exited(42));
}

#[test]
fn detached_forward_returns_immediately() {
    let _guard = serial_guard();
    let mut process = ForkedProcess::spawn("sleep 30");
    let coordinator = SignalCoordinator::from_channel(crossbeam_channel::never());

    let outcome = coordinator
        .forward(&mut process, &IoBridge::Inherit, true)
        .unwrap();
    assert_eq!(outcome, ForwardOutcome::Detached);

    kill_and_wait(&mut process);
}

#[test]
fn interrupt_ends_forwarding() {
    let _guard = serial_guard();
    let (host, _host_slave) = Console::new_pty().unwrap();
    let mut process_io = ProcessIo::default();
    let streams = HostStreams {
        input: Box::new(io::empty()),
        output: Box::new(io::sink()),
        error: Box::new(io::sink()),
    };
    let mut console = ConsoleBridge::attach_host(&mut process_io, host, streams).unwrap();
    let socket = process_io.console_socket.take().unwrap();
    let (pty_master, pty_slave) = Console::new_pty().unwrap();
    send_fd(&socket, "console", &pty_master).unwrap();
    console.wait_console().unwrap();
    let bridge = IoBridge::Console(console);

    let mut process = ForkedProcess::spawn("sleep 30");
    let (_tx, rx) = queue();
    let coordinator = SignalCoordinator::from_channel(rx);

    unsafe { libc::raise(libc::SIGINT) };
    let err = coordinator
        .forward(&mut process, &bridge, false)
        .unwrap_err();
    assert!(matches!(err, SandboxError::Interrupted));

    kill_and_wait(&mut process);
    drop(pty_master);
    drop(pty_slave);
    bridge.close().unwrap();
}

/// Container double that starts plain children and records teardown
struct FakeContainer {
    config: ContainerConfig,
    script: Option<&'static str>,
    destroyed: usize,
}

impl FakeContainer {
    fn new(script: Option<&'static str>) -> Self {
        Self {
            config: ContainerConfig::new(NamespaceConfig::none()),
            script,
            destroyed: 0,
        }
    }
}

impl Container for FakeContainer {
    type Process = ForkedProcess;

    fn id(&self) -> &str {
        "fake"
    }

    fn config(&self) -> &ContainerConfig {
        &self.config
    }

    fn run(&mut self, process: ProcessDescriptor) -> Result<ForkedProcess> {
        drop(process);
        match self.script {
            Some(script) => Ok(ForkedProcess::spawn(script)),
            None => Err(SandboxError::Container("refusing to start".to_string())),
        }
    }

    fn destroy(&mut self) -> Result<()> {
        self.destroyed += 1;
        Ok(())
    }
}

fn spec(args: &[&str], terminal: bool) -> ProcessSpec {
    ProcessSpec {
        args: args.iter().map(|s| s.to_string()).collect(),
        terminal,
        ..Default::default()
    }
}

fn inherit_options() -> RunOptions {
    RunOptions {
        inherit_stdio: true,
        subreaper: false,
        ..Default::default()
    }
}

#[test]
fn failed_start_still_destroys_container() {
    let _guard = serial_guard();
    let mut container = FakeContainer::new(None);
    let mut orchestrator = ExecutionOrchestrator::new(inherit_options())
        .with_signals(SignalCoordinator::from_channel(crossbeam_channel::never()));

    let err = orchestrator
        .run(&spec(&["/bin/true"], false), &mut container)
        .unwrap_err();
    assert!(matches!(err, SandboxError::Container(_)));
    assert_eq!(container.destroyed, 1);
    assert_eq!(orchestrator.state(), LaunchState::Destroyed);
}

#[test]
fn successful_run_destroys_container_once() {
    let _guard = serial_guard();
    let mut container = FakeContainer::new(Some("exit 9"));
    let (tx, rx) = queue();
    let pump = pump_sigchld(tx);
    let mut orchestrator = ExecutionOrchestrator::new(inherit_options())
        .with_signals(SignalCoordinator::from_channel(rx));

    let outcome = orchestrator
        .run(&spec(&["/bin/true"], false), &mut container)
        .unwrap();
    pump.join().unwrap();

    assert_eq!(outcome, RunOutcome::Exited(9));
    assert_eq!(container.destroyed, 1);
    assert_eq!(orchestrator.state(), LaunchState::Destroyed);

    let err = orchestrator
        .run(&spec(&["/bin/true"], false), &mut container)
        .unwrap_err();
    assert!(matches!(err, SandboxError::AlreadyRunning));
}

#[test]
fn detached_run_leaves_container_alone() {
    let _guard = serial_guard();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("console.sock");
    let _listener = UnixListener::bind(&path).unwrap();

    let mut container = FakeContainer::new(Some("exit 0"));
    let options = RunOptions {
        detach: true,
        console_socket: Some(path),
        subreaper: false,
        ..Default::default()
    };
    let mut orchestrator = ExecutionOrchestrator::new(options)
        .with_signals(SignalCoordinator::from_channel(crossbeam_channel::never()));

    let outcome = orchestrator
        .run(&spec(&["/bin/true"], true), &mut container)
        .unwrap();
    assert_eq!(outcome, RunOutcome::Detached);
    assert_eq!(container.destroyed, 0);
    assert_eq!(orchestrator.state(), LaunchState::Detached);

    // collect the child the fake container started
    while reap_children().unwrap().is_empty() {
        thread::sleep(Duration::from_millis(20));
    }
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn pipe_mode_launch_in_namespace_container() {
    if !sandbox_rs::util::is_root() {
        eprintln!("SKIP: launching without a user namespace requires root");
        return;
    }
    let _guard = serial_guard();

    let output = SharedBuffer::default();
    let mut container =
        NamespaceContainer::create("pipes", ContainerConfig::new(NamespaceConfig::none()))
            .unwrap();
    let mut orchestrator = ExecutionOrchestrator::new(RunOptions {
        subreaper: false,
        ..Default::default()
    })
    .with_signals(SignalCoordinator::start(false).unwrap())
    .with_host_streams(HostStreams {
        input: Box::new(io::empty()),
        output: Box::new(output.clone()),
        error: Box::new(io::sink()),
    });

    let outcome = orchestrator
        .run(&spec(&["/bin/sh", "-c", "echo hi; exit 3"], false), &mut container)
        .unwrap();

    assert_eq!(outcome, RunOutcome::Exited(3));
    assert!(String::from_utf8_lossy(&output.0.lock().unwrap()).contains("hi"));
    assert!(container.init_pid().is_none());
}

#[test]
fn namespace_container_reports_exec_failure() {
    if !sandbox_rs::util::is_root() {
        eprintln!("SKIP: launching without a user namespace requires root");
        return;
    }
    let _guard = serial_guard();

    let mut container =
        NamespaceContainer::create("bad-cwd", ContainerConfig::new(NamespaceConfig::none()))
            .unwrap();
    let mut process_spec = spec(&["/bin/true"], false);
    process_spec.cwd = "/definitely/not/here".to_string();
    let descriptor = ProcessDescriptor::from_spec(&process_spec, true, None).unwrap();

    let err = container.run(descriptor).unwrap_err();
    assert!(err.to_string().contains("chdir"));
    assert!(container.init_pid().is_none());
}

/// `setsid` leaves init's session and process group, so only a membership
/// scan finds it. If it survived, it would hold the stdout pipe open and
/// closing the bridge would wait the full 30 seconds.
fn run_with_session_escapee(namespaces: NamespaceConfig, subreaper: bool) {
    let mut container =
        NamespaceContainer::create("escapee", ContainerConfig::new(namespaces)).unwrap();
    let mut orchestrator = ExecutionOrchestrator::new(RunOptions {
        subreaper,
        ..Default::default()
    })
    .with_signals(SignalCoordinator::start(subreaper).unwrap())
    .with_host_streams(HostStreams {
        input: Box::new(io::empty()),
        output: Box::new(io::sink()),
        error: Box::new(io::sink()),
    });

    let started = Instant::now();
    let outcome = orchestrator
        .run(
            &spec(&["/bin/sh", "-c", "setsid sleep 30 & exit 3"], false),
            &mut container,
        )
        .unwrap();

    assert_eq!(outcome, RunOutcome::Exited(3));
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "teardown waited on a detached descendant"
    );
}

#[test]
fn destroy_kills_descendants_that_left_the_session() {
    if !sandbox_rs::util::is_root() {
        eprintln!("SKIP: launching without a user namespace requires root");
        return;
    }
    let _guard = serial_guard();
    run_with_session_escapee(NamespaceConfig::none(), true);
}

#[test]
fn destroy_kills_everything_in_the_mount_namespace() {
    if !sandbox_rs::util::is_root() {
        eprintln!("SKIP: launching without a user namespace requires root");
        return;
    }
    let _guard = serial_guard();
    run_with_session_escapee(NamespaceConfig::default(), false);
}
