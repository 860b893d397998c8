//! Error types for sandbox operations

use std::io;
use thiserror::Error;

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur while launching and supervising a sandboxed process
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Console error: {0}")]
    Console(String),

    #[error("Not a console")]
    NotAConsole,

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Interrupted by user")]
    Interrupted,

    #[error("Sandbox already running")]
    AlreadyRunning,

    #[error("Sandbox not running")]
    NotRunning,

    #[error("Feature not available: {0}")]
    FeatureNotAvailable(String),
}

impl SandboxError {
    /// Wrap a failed system call together with the operation that issued it
    pub fn syscall(op: &str, err: impl std::fmt::Display) -> Self {
        SandboxError::Syscall(format!("{}: {}", op, err))
    }
}
