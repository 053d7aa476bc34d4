//! Control-plane access
//!
//! The verifier only needs four things from the cluster: fetch a Service,
//! list pods by label selector, forward a local port to a pod, and stream a
//! pod's logs. [`ClusterApi`] captures exactly that so the orchestrator can be
//! driven by an in-memory cluster in tests; [`KubeCluster`] is the kube-rs
//! implementation used against a real API server.

use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams, LogParams};
use kube::Client;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// One running pod selected for tunneling and log collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadInstance {
    /// Pod name
    pub name: String,
    /// Pod namespace
    pub namespace: String,
}

impl fmt::Display for WorkloadInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Trait abstracting the control-plane operations the verifier consumes
///
/// This trait allows driving the orchestrator against a fake cluster in tests
/// while using the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Get a Service by namespace and name, `None` if it does not exist
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// List pods in `namespace` matching a rendered label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Forward `local_port` on the loopback interface to `remote_port` on `instance`.
    ///
    /// Sends the bound local address on `ready` once the listener is bound and
    /// the remote stream is established, then forwards connections until
    /// `stop` is cancelled. Must release the listener and every in-flight
    /// connection before returning.
    async fn forward_port(
        &self,
        instance: &WorkloadInstance,
        local_port: u16,
        remote_port: u16,
        ready: oneshot::Sender<SocketAddr>,
        stop: CancellationToken,
    ) -> Result<()>;

    /// Stream the pod's log lines into `lines` until the log ends.
    ///
    /// Returns early without error if the receiver is dropped.
    async fn stream_logs(
        &self,
        instance: &WorkloadInstance,
        lines: mpsc::Sender<String>,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Create a new KubeCluster wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(svc) => Ok(Some(svc)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn forward_port(
        &self,
        instance: &WorkloadInstance,
        local_port: u16,
        remote_port: u16,
        ready: oneshot::Sender<SocketAddr>,
        stop: CancellationToken,
    ) -> Result<()> {
        let pods = self.pods(&instance.namespace);

        // Each accepted connection gets its own upgraded stream. The first one
        // is opened up front so readiness implies the API server accepted us.
        let first = unless_stopped(&stop, pods.portforward(&instance.name, &[remote_port])).await;
        let mut pending = match first {
            Some(forwarder) => Some(forwarder?),
            None => {
                debug!(pod = %instance, "Stopped during port-forward handshake");
                return Ok(());
            }
        };

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port)).await?;
        let addr = listener.local_addr()?;
        info!(pod = %instance, local = %addr, remote_port, "Port-forward ready");
        if ready.send(addr).is_err() {
            debug!(pod = %instance, "Tunnel owner went away before ready");
            return Ok(());
        }

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,

                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    debug!(pod = %instance, %peer, "Forwarding connection");
                    let ready_forwarder = pending.take();
                    let pods = pods.clone();
                    let name = instance.name.clone();
                    let stop = stop.clone();
                    connections.spawn(async move {
                        let forwarder = match ready_forwarder {
                            Some(forwarder) => forwarder,
                            None => {
                                let ports = [remote_port];
                                let handshake = pods.portforward(&name, &ports);
                                match unless_stopped(&stop, handshake).await {
                                    Some(forwarder) => forwarder?,
                                    None => return Ok(()),
                                }
                            }
                        };
                        bridge(forwarder, socket, remote_port).await
                    });
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    match joined {
                        Ok(Err(e)) => warn!(pod = %instance, error = %e, "Forwarded connection failed"),
                        Err(e) => warn!(pod = %instance, error = %e, "Forwarded connection panicked"),
                        Ok(Ok(())) => {}
                    }
                }
            }
        }

        drop(listener);
        connections.shutdown().await;
        if let Some(forwarder) = pending {
            forwarder.abort();
        }
        info!(pod = %instance, "Port-forward stopped");
        Ok(())
    }

    async fn stream_logs(
        &self,
        instance: &WorkloadInstance,
        lines: mpsc::Sender<String>,
    ) -> Result<()> {
        let pods = self.pods(&instance.namespace);
        let mut logs = pods
            .log_stream(&instance.name, &LogParams::default())
            .await?
            .lines();

        while let Some(line) = logs.try_next().await? {
            if lines.send(line).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Run `fut` to completion unless `stop` fires first
async fn unless_stopped<T>(stop: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = stop.cancelled() => None,
        output = fut => Some(output),
    }
}

/// Copy bytes between an accepted local connection and one pod stream
async fn bridge(
    mut forwarder: kube::api::Portforwarder,
    mut socket: TcpStream,
    remote_port: u16,
) -> Result<()> {
    let mut upstream = forwarder
        .take_stream(remote_port)
        .ok_or_else(|| Error::tunnel(format!("no stream for port {}", remote_port)))?;

    let copied = tokio::io::copy_bidirectional(&mut socket, &mut upstream).await;
    drop(upstream);

    forwarder
        .join()
        .await
        .map_err(|e| Error::tunnel(format!("port-forward stream failed: {}", e)))?;
    let (to_pod, from_pod) = copied?;
    debug!(to_pod, from_pod, "Forwarded connection closed");
    Ok(())
}
