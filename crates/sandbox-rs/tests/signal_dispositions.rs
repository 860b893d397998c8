//! Signals regain their default action once supervision ends.
//!
//! Each case re-runs this test binary filtered to itself, so the signal that
//! is expected to terminate the process only ever hits the child copy.

use std::env;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::thread;
use std::time::Duration;

use sandbox_console::interrupt::InterruptListener;
use sandbox_rs::SignalCoordinator;

const CHILD_ENV: &str = "SANDBOX_RS_DISPOSITION_CHILD";

/// Run `test_name` in a fresh copy of this binary and return the signal that killed it
fn run_in_child(test_name: &str) -> Option<i32> {
    let status = Command::new(env::current_exe().unwrap())
        .args(["--exact", test_name, "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, test_name)
        .status()
        .unwrap();
    status.signal()
}

fn is_child(test_name: &str) -> bool {
    env::var(CHILD_ENV).map(|v| v == test_name).unwrap_or(false)
}

fn raise_and_linger(signal: i32) -> ! {
    unsafe { libc::raise(signal) };
    thread::sleep(Duration::from_secs(2));
    std::process::exit(0);
}

#[test]
fn coordinator_drop_restores_terminating_signals() {
    const NAME: &str = "coordinator_drop_restores_terminating_signals";
    if is_child(NAME) {
        for _ in 0..2 {
            let coordinator = SignalCoordinator::start(false).unwrap();
            drop(coordinator);
        }
        raise_and_linger(libc::SIGUSR1);
    }
    assert_eq!(run_in_child(NAME), Some(libc::SIGUSR1));
}

#[test]
fn coordinator_swallows_signals_while_alive() {
    const NAME: &str = "coordinator_swallows_signals_while_alive";
    if is_child(NAME) {
        let coordinator = SignalCoordinator::start(false).unwrap();
        unsafe { libc::raise(libc::SIGTERM) };
        thread::sleep(Duration::from_millis(200));
        drop(coordinator);
        std::process::exit(0);
    }
    assert_eq!(run_in_child(NAME), None);
}

#[test]
fn interrupt_listener_drop_restores_sigint() {
    const NAME: &str = "interrupt_listener_drop_restores_sigint";
    if is_child(NAME) {
        let listener = InterruptListener::start().unwrap();
        listener.stop();
        raise_and_linger(libc::SIGINT);
    }
    assert_eq!(run_in_child(NAME), Some(libc::SIGINT));
}
