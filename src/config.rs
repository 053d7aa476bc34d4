//! Run configuration
//!
//! A run is described by the merged helm values of the release under test
//! (`helm get values --all -o json`) plus a handful of runner-side overrides.
//! Both are folded into one immutable [`RunConfig`] before the engine starts.

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result, PRODUCT_NAME};

/// Location and contents of the file written and read back on every path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFile {
    /// File name relative to the volume mount
    pub name: String,
    /// Exact contents; compared byte-for-byte
    pub contents: String,
}

/// Subset of the merged helm values the runner needs
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedValues {
    /// `fullnameOverride`
    #[serde(default)]
    pub fullname_override: Option<String>,
    /// `testFile`
    pub test_file: TestFile,
    /// `deployment`
    #[serde(default)]
    pub deployment: DeploymentValues,
    /// `statefulset`
    #[serde(default)]
    pub statefulset: StatefulSetValues,
}

/// `deployment:` values
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentValues {
    /// `deployment.ingress`
    #[serde(default)]
    pub ingress: IngressValues,
}

/// `deployment.ingress:` values
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngressValues {
    /// Hostname the ingress routes on
    #[serde(default)]
    pub hostname: String,
    /// TLS blocks; only their presence matters
    #[serde(default)]
    pub tls: Vec<serde_json::Value>,
}

/// `statefulset:` values
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatefulSetValues {
    /// Hostname or IP of a node to reach NodePort services on
    #[serde(default)]
    pub node_port_hostname: String,
}

impl MergedValues {
    /// Decode merged values from a JSON reader
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Decode merged values from `path`, or from stdin when `path` is `-`
    pub fn load(path: &Path) -> Result<Self> {
        if path == Path::new("-") {
            return Self::from_reader(std::io::stdin().lock());
        }
        let file = std::fs::File::open(path).map_err(|e| {
            Error::config(format!("failed to open {}: {}", path.display(), e))
        })?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// [`MergedValues::load`] on the blocking pool, for use from async code
    pub async fn load_blocking(path: PathBuf) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::load(&path))
            .await
            .map_err(|e| Error::config(format!("merged values reader failed: {}", e)))?
    }
}

/// Runner-side settings that are not part of the helm values
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    /// Namespace the release was installed into
    pub release_namespace: String,
    /// Name of the helm release
    pub release_name: String,
    /// Connect to the ingress through this host instead of the values hostname.
    /// The values hostname is then sent as the `Host` header. Useful when DNS
    /// for the ingress is not configured.
    pub ingress_hostname: Option<String>,
    /// Force HTTPS for the ingress probe regardless of the values
    pub ingress_tls: bool,
    /// Local port for the tunnel; 0 lets the OS choose
    pub tunnel_local_port: u16,
}

/// How to reach the ingress route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressTarget {
    /// Hostname the ingress routes on
    pub hostname: String,
    /// Host to open the connection to, when different from `hostname`
    pub connect_hostname: Option<String>,
    /// Use HTTPS
    pub tls: bool,
}

impl IngressTarget {
    /// URL scheme for the ingress probe
    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    /// Host placed in the probe URL
    pub fn url_host(&self) -> &str {
        self.connect_hostname.as_deref().unwrap_or(&self.hostname)
    }

    /// `Host` header to send, if the URL host is an override
    pub fn host_header(&self) -> Option<&str> {
        self.connect_hostname.as_ref().map(|_| self.hostname.as_str())
    }
}

/// Immutable description of one verification run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Namespace the release was installed into
    pub release_namespace: String,
    /// Name of the helm release
    pub release_name: String,
    /// `fullnameOverride` from the values, if set
    pub fullname_override: Option<String>,
    /// Ingress route to probe
    pub ingress: IngressTarget,
    /// Hostname or IP of a node to reach NodePort services on
    pub node_port_hostname: String,
    /// Local port for the tunnel; 0 lets the OS choose
    pub tunnel_local_port: u16,
    /// File written and read back on every path
    pub test_file: TestFile,
}

impl RunConfig {
    /// Fold merged values and runner overrides into a validated config
    pub fn new(values: MergedValues, overrides: RunOverrides) -> Result<Self> {
        let ingress_tls = overrides.ingress_tls || !values.deployment.ingress.tls.is_empty();
        let config = Self {
            release_namespace: overrides.release_namespace,
            release_name: overrides.release_name,
            fullname_override: values.fullname_override.filter(|name| !name.is_empty()),
            ingress: IngressTarget {
                hostname: values.deployment.ingress.hostname,
                connect_hostname: overrides.ingress_hostname.filter(|host| !host.is_empty()),
                tls: ingress_tls,
            },
            node_port_hostname: values.statefulset.node_port_hostname,
            tunnel_local_port: overrides.tunnel_local_port,
            test_file: values.test_file,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.release_name.is_empty() {
            return Err(Error::config("release name must not be empty"));
        }
        if self.release_namespace.is_empty() {
            return Err(Error::config("release namespace must not be empty"));
        }
        let name = &self.test_file.name;
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(Error::config(format!(
                "testFile.name must be a single path segment, got {:?}",
                name
            )));
        }
        if self.ingress.hostname.is_empty() {
            return Err(Error::config("deployment.ingress.hostname must be set"));
        }
        if self.node_port_hostname.is_empty() {
            return Err(Error::config("statefulset.nodePortHostname must be set"));
        }
        Ok(())
    }

    /// Name prefix of every object the chart creates.
    ///
    /// `fullnameOverride` wins; otherwise the release name is used as-is when it
    /// already mentions the product, and suffixed with it when it does not.
    pub fn resolved_name(&self) -> String {
        if let Some(fullname) = &self.fullname_override {
            return fullname.clone();
        }
        if self.release_name.contains(PRODUCT_NAME) {
            return self.release_name.clone();
        }
        format!("{}-{}", self.release_name, PRODUCT_NAME)
    }
}
