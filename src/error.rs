//! Error types for the connectivity verifier
//!
//! Every failure a run can hit maps onto one [`ErrorKind`] so callers can tell
//! a missing object apart from a half-provisioned one, and both apart from a
//! network or content failure at the same stage.

use thiserror::Error;

use crate::probe::{ProbeError, ProbeFailure};

/// Result type alias using the verifier's [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A named object or selector match is absent
    Resolution,
    /// Infrastructure exists but lacks a field the verifier requires
    Provisioning,
    /// Transport-level failure reaching a probe URL
    Connectivity,
    /// Non-200 status or unexpected response body
    ContentMismatch,
    /// The run was aborted by the caller
    Cancellation,
    /// Log streaming failed
    Diagnostics,
    /// Configuration, serialization or client construction failures
    Internal,
}

/// Lookup failures while resolving release objects
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The named Service does not exist
    #[error("service {namespace}/{name} not found")]
    ServiceNotFound {
        /// Namespace that was searched
        namespace: String,
        /// Name of the missing Service
        name: String,
    },

    /// The Service exists but declares no pod selector
    #[error("service {namespace}/{name} has no pod selector")]
    NoSelector {
        /// Namespace of the Service
        namespace: String,
        /// Name of the Service
        name: String,
    },

    /// The selector matched zero pods
    #[error("no pods in {namespace} match selector {selector}")]
    NoInstances {
        /// Namespace that was searched
        namespace: String,
        /// Rendered label selector
        selector: String,
    },

    /// A returned pod does not actually carry the selector's labels
    #[error("pod {pod} does not carry the labels of selector {selector}")]
    SelectorMismatch {
        /// Name of the offending pod
        pod: String,
        /// Rendered label selector
        selector: String,
    },
}

/// Main error type for verifier operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Named object or selector match absent
    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// Object exists but lacks a required field
    #[error("{}", provisioning_message(.message, .ingress_index))]
    Provisioning {
        /// Description of the missing or malformed field
        message: String,
        /// Load balancer ingress entry the fault was found on, if any
        ingress_index: Option<usize>,
    },

    /// A probe failed to connect or returned unexpected content
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// Port-forward tunnel failure
    #[error("tunnel error: {message}")]
    Tunnel {
        /// Description of what failed
        message: String,
    },

    /// The run-scoped cancellation token fired
    #[error("run cancelled")]
    Cancelled,

    /// Log streaming failed
    #[error("diagnostics error: {message}")]
    Diagnostics {
        /// Description of what failed
        message: String,
    },

    /// Invalid run configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client construction error
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

fn provisioning_message(message: &str, ingress_index: &Option<usize>) -> String {
    match ingress_index {
        Some(ix) => format!(
            "provisioning fault at load balancer ingress index {}: {}",
            ix, message
        ),
        None => format!("provisioning fault: {}", message),
    }
}

impl Error {
    /// Create a provisioning fault that is not tied to a load balancer ingress entry
    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
            ingress_index: None,
        }
    }

    /// Create a provisioning fault for a specific load balancer ingress entry
    pub fn provisioning_at(ingress_index: usize, message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
            ingress_index: Some(ingress_index),
        }
    }

    /// Create a tunnel error
    pub fn tunnel(message: impl Into<String>) -> Self {
        Self::Tunnel {
            message: message.into(),
        }
    }

    /// Create a diagnostics error
    pub fn diagnostics(message: impl Into<String>) -> Self {
        Self::Diagnostics {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Resolution(_) => ErrorKind::Resolution,
            Error::Provisioning { .. } => ErrorKind::Provisioning,
            Error::Probe(probe) => match probe.failure {
                ProbeFailure::Connect { .. } => ErrorKind::Connectivity,
                ProbeFailure::BadStatus { .. } | ProbeFailure::BodyMismatch { .. } => {
                    ErrorKind::ContentMismatch
                }
            },
            Error::Tunnel { .. } => ErrorKind::Connectivity,
            Error::Cancelled => ErrorKind::Cancellation,
            Error::Diagnostics { .. } => ErrorKind::Diagnostics,
            Error::Kube { .. }
            | Error::Config { .. }
            | Error::Io(_)
            | Error::Json(_)
            | Error::Http(_) => ErrorKind::Internal,
        }
    }
}
