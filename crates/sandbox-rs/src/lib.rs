//! sandbox-rs: launch a process inside Linux namespaces and supervise it
//!
//! One launch wires the process's stdio to the host (a pseudo-terminal,
//! pipes, or the host's own streams), starts it in a container, relays
//! signals and window-size changes to it, reaps children, and tears the
//! container down once the process exits.
//!
//! # Example
//!
//! ```ignore
//! use sandbox_rs::{NamespaceConfig, SandboxBuilder};
//!
//! let mut sandbox = SandboxBuilder::new("my-sandbox")
//!     .command("/bin/sh", &["-c", "echo hello"])
//!     .namespaces(NamespaceConfig::default())
//!     .terminal(false)
//!     .build()?;
//!
//! let outcome = sandbox.run()?;
//! println!("Exit code: {}", outcome.exit_code());
//! ```

pub mod container;
pub mod controller;
pub mod execution;

pub use sandbox_console::{ConsoleBridge, HostStreams, IoBridge, ProcessIo};
pub use sandbox_core::{self as core, capabilities::SystemCapabilities, util, Result, SandboxError};
pub use sandbox_namespace::{ContainerConfig, IdMap, NamespaceConfig, NamespaceType};

pub use container::{Container, ContainerProcess, NamespaceContainer, NamespaceProcess};
pub use controller::{Sandbox, SandboxBuilder, SandboxConfig};
pub use execution::{
    ExecutionOrchestrator, ForwardOutcome, LinuxCapabilities, ProcessDescriptor, ProcessSpec,
    RunOptions, RunOutcome, SignalCoordinator,
};

/// Helpers for tests that reap children or change process-wide signal state
#[doc(hidden)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static SERIAL: Mutex<()> = Mutex::new(());

    /// Serialize tests that would otherwise reap each other's children
    pub fn serial_guard() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
