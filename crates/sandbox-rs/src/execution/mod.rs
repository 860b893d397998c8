//! Execution layer: launching and supervising the container process
//!
//! - [`process`]: what to run and as whom
//! - [`signal`]: signal forwarding and reaping while the process runs
//! - [`orchestrator`]: one launch from start to teardown

pub mod orchestrator;
pub mod process;
pub mod signal;

pub use orchestrator::{ExecutionOrchestrator, LaunchState, RunOptions, RunOutcome};
pub use process::{
    ConsoleSize, LinuxCapabilities, ProcessDescriptor, ProcessSpec, ProcessUser,
};
pub use signal::{ExitRecord, ForwardOutcome, SignalCoordinator};
