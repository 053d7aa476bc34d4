//! k8s-smoke-test - post-install connectivity verifier for the smoke-test release
//!
//! After the release is installed, the verifier proves that the shared test
//! file is served through every path a client can take into the cluster:
//! a port-forward tunnel to one deployment pod, the ingress route, the
//! statefulset node port, and every load balancer ingress point. The
//! load balancer stage also writes and reads back a per-instance file.
//!
//! # Modules
//!
//! - [`config`] - Merged release values and run configuration
//! - [`cluster`] - Control-plane access (services, pods, port-forward, logs)
//! - [`resolver`] - Service and pod resolution, NodePort/LoadBalancer endpoints
//! - [`probe`] - HTTP probes with status and body checks
//! - [`tunnel`] - Scoped port-forward sessions
//! - [`diagnostics`] - Pod log collection
//! - [`verify`] - The stage sequence and run report
//! - [`http`] - HTTP client construction
//! - [`error`] - Error types for the verifier

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod http;
pub mod probe;
pub mod resolver;
pub mod tunnel;
pub mod verify;

pub use error::{Error, ErrorKind, Result};

/// Chart name, used to derive the release's resolved name
pub const PRODUCT_NAME: &str = "k8s-smoke-test";

/// Port the test servers listen on inside their pods
pub const SERVER_PORT: u16 = 8080;

/// URL path prefix for the shared (ReadWriteMany) volume
pub const RWX_PATH_PREFIX: &str = "rwx";

/// URL path prefix for the per-instance (ReadWriteOnce) volume
pub const RWO_PATH_PREFIX: &str = "rwo";
