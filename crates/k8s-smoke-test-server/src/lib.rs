//! Components deployed by the k8s-smoke-test chart
//!
//! - [`server`] - Deployment and statefulset HTTP routers
//! - [`job`] - Test file seeding job
//! - [`volume`] - Path-safe access to volume mounts
//! - [`error`] - Error types and their HTTP mapping

#![deny(missing_docs)]

pub mod error;
pub mod job;
pub mod server;
pub mod volume;

pub use error::{Error, Result};

/// Default mount point of the shared (ReadWriteMany) volume
pub const DEFAULT_RWX_MOUNT: &str = "/var/lib/k8s-smoke-test/rwx";

/// Default mount point of the per-instance (ReadWriteOnce) volume
pub const DEFAULT_RWO_MOUNT: &str = "/var/lib/k8s-smoke-test/rwo";

/// Default listen address of both servers
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
