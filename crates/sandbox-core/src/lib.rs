//! sandbox-core: shared types, errors, and host probing for sandbox-rs
//!
//! This crate provides the foundational types used by all sandbox-rs sub-crates:
//! - Error types and Result alias
//! - Utility functions (UID/GID queries, user lookup)
//! - Runtime capability detection (user namespaces, subreaper, pseudo-terminals)

pub mod capabilities;
pub mod error;
pub mod util;

pub use error::{Result, SandboxError};
