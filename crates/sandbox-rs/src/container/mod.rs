//! The boundary between supervision and the thing that actually isolates a
//! process.
//!
//! The supervisor only needs to start one process, signal it, wait for it and
//! tear the container down again. [`NamespaceContainer`] is the built-in
//! implementation; anything else that can do those four things plugs in the
//! same way.

pub mod caps;
pub mod namespace;

use nix::unistd::Pid;
use sandbox_core::Result;
use sandbox_namespace::ContainerConfig;

use crate::execution::ProcessDescriptor;

pub use namespace::{NamespaceContainer, NamespaceProcess};

/// An isolated execution context able to host one supervised process
pub trait Container {
    type Process: ContainerProcess;

    fn id(&self) -> &str;

    fn config(&self) -> &ContainerConfig;

    /// Start `process` inside the container. The descriptor is consumed.
    fn run(&mut self, process: ProcessDescriptor) -> Result<Self::Process>;

    /// Kill everything left in the container and release it. Safe to call
    /// more than once.
    fn destroy(&mut self) -> Result<()>;
}

/// Handle to a process started by [`Container::run`]
pub trait ContainerProcess {
    fn pid(&self) -> Result<Pid>;

    fn signal(&self, sig: libc::c_int) -> Result<()>;

    /// Block until the process exits. `None` if it was already collected
    /// elsewhere, e.g. by a reap pass.
    fn wait(&mut self) -> Result<Option<i32>>;
}
