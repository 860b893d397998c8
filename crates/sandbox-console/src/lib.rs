//! sandbox-console: stdio plumbing between the host and a sandboxed process
//!
//! - [`console`]: terminal handles, window size and raw mode
//! - [`epoll`]: edge-triggered multiplexing that survives pty hangups
//! - [`dispositions`]: default signal actions once listeners are gone
//! - [`socket`]: passing a pty master over a UNIX socket
//! - [`pipes`] and [`bridge`]: the per-launch choice between inherited
//!   stdio, pipes and a pseudo-terminal

pub mod bridge;
pub mod console;
pub mod dispositions;
pub mod epoll;
pub mod interrupt;
pub mod io;
pub mod pipes;
pub mod socket;

pub use bridge::{ConsoleBridge, IoBridge};
pub use console::{Console, WinSize};
pub use dispositions::DefaultActions;
pub use io::{HostStreams, ProcessIo};
pub use pipes::PipeBridge;
pub use socket::{recv_fd, send_fd, send_raw_fd};
