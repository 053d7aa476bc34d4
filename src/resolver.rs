//! Endpoint resolution
//!
//! Maps the release's resolved name onto concrete cluster objects and pulls
//! the NodePort and LoadBalancer endpoints out of Service objects. Lookups go
//! through [`ClusterApi`]; extraction is pure data access so the provisioning
//! rules can be tested without a cluster.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{LoadBalancerIngress, Pod, Service};
use tracing::debug;

use crate::cluster::{ClusterApi, WorkloadInstance};
use crate::error::ResolutionError;
use crate::{Error, Result};

/// Suffix of the Service fronting the deployment component
pub const DEPLOYMENT_SERVICE_SUFFIX: &str = "deployment";

/// Suffix of the Service fronting the statefulset component
pub const STATEFULSET_SERVICE_SUFFIX: &str = "statefulset";

/// Exposure mechanism an endpoint was discovered through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureKind {
    /// Static port opened on every node
    NodePort,
    /// Externally provisioned load balancer ingress point
    LoadBalancer,
}

/// A concrete host and port to probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureEndpoint {
    /// How the endpoint was exposed
    pub kind: ExposureKind,
    /// Hostname or IP
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl ExposureEndpoint {
    /// `http://host:port/<path>`
    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}/{}", self.host, self.port, path)
    }
}

impl fmt::Display for ExposureEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Name of a component Service, e.g. `demo-k8s-smoke-test-deployment`
pub fn service_name(fullname: &str, suffix: &str) -> String {
    format!("{}-{}", fullname, suffix)
}

/// Render a selector map as a label selector string (`k1=v1,k2=v2`)
pub fn format_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn matches_selector(pod: &Pod, selector: &BTreeMap<String, String>) -> bool {
    let labels = pod.metadata.labels.as_ref();
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// Get a Service, failing with [`ResolutionError::ServiceNotFound`] if absent
pub async fn resolve_service(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
) -> Result<Service> {
    cluster
        .get_service(namespace, name)
        .await?
        .ok_or_else(|| {
            ResolutionError::ServiceNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
            .into()
        })
}

/// Pick the first pod selected by the deployment Service
pub async fn resolve_instance(
    cluster: &dyn ClusterApi,
    namespace: &str,
    fullname: &str,
) -> Result<WorkloadInstance> {
    let name = service_name(fullname, DEPLOYMENT_SERVICE_SUFFIX);
    let service = resolve_service(cluster, namespace, &name).await?;

    let selector = service
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.clone())
        .filter(|selector| !selector.is_empty())
        .ok_or_else(|| ResolutionError::NoSelector {
            namespace: namespace.to_string(),
            name: name.clone(),
        })?;
    let rendered = format_selector(&selector);

    let pods = cluster.list_pods(namespace, &rendered).await?;
    debug!(service = %name, selector = %rendered, count = pods.len(), "Listed deployment pods");

    let pod = pods
        .into_iter()
        .next()
        .ok_or_else(|| ResolutionError::NoInstances {
            namespace: namespace.to_string(),
            selector: rendered.clone(),
        })?;

    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    if !matches_selector(&pod, &selector) {
        return Err(ResolutionError::SelectorMismatch {
            pod: pod_name,
            selector: rendered,
        }
        .into());
    }

    Ok(WorkloadInstance {
        name: pod_name,
        namespace: pod
            .metadata
            .namespace
            .unwrap_or_else(|| namespace.to_string()),
    })
}

/// The NodePort endpoint of `service`, reached through `host`.
///
/// Only the first declared port is considered.
pub fn node_port_endpoint(service: &Service, host: &str) -> Result<ExposureEndpoint> {
    let node_port = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .and_then(|port| port.node_port)
        .unwrap_or(0);

    if node_port == 0 {
        return Err(Error::provisioning(
            "service does not have a nodePort assigned",
        ));
    }
    let port = u16::try_from(node_port)
        .map_err(|_| Error::provisioning(format!("nodePort {} is out of range", node_port)))?;

    Ok(ExposureEndpoint {
        kind: ExposureKind::NodePort,
        host: host.to_string(),
        port,
    })
}

/// Load balancer ingress entries on the Service status, in control-plane order
pub fn load_balancer_ingresses(service: &Service) -> Result<&[LoadBalancerIngress]> {
    let ingresses = service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_deref())
        .unwrap_or_default();

    if ingresses.is_empty() {
        return Err(Error::provisioning(
            "LoadBalancer service has no ingresses",
        ));
    }
    Ok(ingresses)
}

/// Number of ports the Service declares in its spec
pub fn declared_port_count(service: &Service) -> usize {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map_or(0, Vec::len)
}

/// Validate one load balancer ingress entry and turn it into an endpoint.
///
/// The entry needs a hostname or IP, exactly one port status per declared
/// port, and its first port status must carry no error and a nonzero port.
/// Only the first port status is inspected even for multi-port services.
pub fn load_balancer_endpoint(
    index: usize,
    ingress: &LoadBalancerIngress,
    declared_ports: usize,
) -> Result<ExposureEndpoint> {
    let host = ingress
        .hostname
        .as_deref()
        .filter(|h| !h.is_empty())
        .or_else(|| ingress.ip.as_deref().filter(|ip| !ip.is_empty()))
        .ok_or_else(|| Error::provisioning_at(index, "has neither a hostname nor an IP"))?;

    let statuses = ingress.ports.as_deref().unwrap_or_default();
    if statuses.len() != declared_ports {
        return Err(Error::provisioning_at(
            index,
            format!(
                "has {} port statuses instead of the expected {}",
                statuses.len(),
                declared_ports
            ),
        ));
    }

    let first = statuses
        .first()
        .ok_or_else(|| Error::provisioning_at(index, "has no port statuses"))?;
    if let Some(error) = first.error.as_deref() {
        return Err(Error::provisioning_at(
            index,
            format!("reports error: {}", error),
        ));
    }
    let port = u16::try_from(first.port)
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| Error::provisioning_at(index, "has no port assigned"))?;

    Ok(ExposureEndpoint {
        kind: ExposureKind::LoadBalancer,
        host: host.to_string(),
        port,
    })
}
