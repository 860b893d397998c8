//! sandbox-namespace: Linux namespace selection with user namespace support
//!
//! Provides the container-side configuration the supervisor consults
//! (which namespaces to unshare, how container ids map to host ids) and
//! writes user namespace mappings for a cloned child. [`procfs`] finds the
//! processes that belong to a running container.

pub mod config;
pub mod procfs;
pub mod user_ns;

pub use config::{ContainerConfig, IdMap, NamespaceConfig, NamespaceType};
