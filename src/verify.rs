//! Path verifier
//!
//! Drives the stage sequence of one run:
//!
//! 1. **Resolve** the release name and pick one deployment pod
//! 2. **PortForward** to that pod and read the shared file through the tunnel
//! 3. **Ingress** read of the shared file through the ingress route
//! 4. **NodePortLookup** of the statefulset Service's node port
//! 5. **NodePort** read of the shared file through that node port
//! 6. **LoadBalancer** validation of every ingress entry, then per entry a
//!    shared read, a per-instance write and a per-instance read
//!
//! The first failure ends the run. Pod logs are streamed afterwards whatever
//! the verdict, and a logging failure never replaces the verdict.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::{ClusterApi, WorkloadInstance};
use crate::config::RunConfig;
use crate::probe::{Probe, Prober};
use crate::resolver::{self, ExposureEndpoint};
use crate::{diagnostics, tunnel, Error, Result, RWO_PATH_PREFIX, RWX_PATH_PREFIX, SERVER_PORT};

/// One step of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Resolve the release's objects
    Resolve,
    /// Read through a tunnel to one pod
    PortForward,
    /// Read through the ingress route
    Ingress,
    /// Look up the statefulset node port
    NodePortLookup,
    /// Read through the node port
    NodePort,
    /// Validate and exercise every load balancer ingress point
    LoadBalancer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolve => "Resolve",
            Stage::PortForward => "PortForward",
            Stage::Ingress => "Ingress",
            Stage::NodePortLookup => "NodePortLookup",
            Stage::NodePort => "NodePort",
            Stage::LoadBalancer => "LoadBalancer",
        };
        f.write_str(name)
    }
}

/// The error that ended a run, and where it happened
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed{}: {error}", ingress_suffix(.ingress_index))]
pub struct StageFailure {
    /// Stage that failed
    pub stage: Stage,
    /// Load balancer ingress entry being checked, if any
    pub ingress_index: Option<usize>,
    /// Underlying cause
    #[source]
    pub error: Error,
}

fn ingress_suffix(ingress_index: &Option<usize>) -> String {
    ingress_index
        .map(|ix| format!(" at load balancer ingress index {}", ix))
        .unwrap_or_default()
}

impl StageFailure {
    fn new(stage: Stage, error: Error) -> Self {
        let ingress_index = match &error {
            Error::Provisioning { ingress_index, .. } => *ingress_index,
            _ => None,
        };
        Self {
            stage,
            ingress_index,
            error,
        }
    }

    fn at_ingress(stage: Stage, index: usize, error: Error) -> Self {
        Self {
            stage,
            ingress_index: Some(index),
            error,
        }
    }
}

/// Terminal result of the stage sequence
#[derive(Debug)]
pub enum Verdict {
    /// Every path served the test file
    Pass,
    /// The first failing stage
    Fail(StageFailure),
}

impl Verdict {
    /// Whether the run passed
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// What happened when collecting pod logs
#[derive(Debug)]
pub enum DiagnosticsOutcome {
    /// Logs were written to the sink
    Streamed {
        /// Number of log lines written
        lines: usize,
    },
    /// No pod was resolved, so there were no logs to collect
    Skipped,
    /// Log streaming failed; reported separately from the verdict
    Failed(Error),
}

/// Everything a run produced
#[derive(Debug)]
pub struct RunReport {
    /// Verdict of the stage sequence
    pub verdict: Verdict,
    /// Outcome of the closing log collection
    pub diagnostics: DiagnosticsOutcome,
}

impl RunReport {
    /// Collapse the report into the verdict, dropping diagnostics
    pub fn into_result(self) -> std::result::Result<(), StageFailure> {
        match self.verdict {
            Verdict::Pass => Ok(()),
            Verdict::Fail(failure) => Err(failure),
        }
    }
}

type StageResult<T> = std::result::Result<T, StageFailure>;

/// Runs the stage sequence for one [`RunConfig`]
pub struct Verifier {
    cluster: Arc<dyn ClusterApi>,
    prober: Prober,
    config: RunConfig,
}

impl Verifier {
    /// Create a verifier for one run
    pub fn new(cluster: Arc<dyn ClusterApi>, prober: Prober, config: RunConfig) -> Self {
        Self {
            cluster,
            prober,
            config,
        }
    }

    /// Run every stage, then stream the tested pod's logs into `log_sink`
    pub async fn run<W>(&self, cancel: &CancellationToken, log_sink: &mut W) -> RunReport
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut instance = None;
        let verdict = match self.run_stages(cancel, &mut instance).await {
            Ok(()) => Verdict::Pass,
            Err(failure) => Verdict::Fail(failure),
        };

        let diagnostics = match &instance {
            None => DiagnosticsOutcome::Skipped,
            Some(instance) => {
                info!(pod = %instance, "Streaming pod logs...");
                match diagnostics::emit_logs(self.cluster.as_ref(), instance, log_sink).await {
                    Ok(lines) => DiagnosticsOutcome::Streamed { lines },
                    Err(e) => {
                        warn!(error = %e, "Failed to collect pod logs");
                        DiagnosticsOutcome::Failed(e)
                    }
                }
            }
        };

        RunReport {
            verdict,
            diagnostics,
        }
    }

    async fn run_stages(
        &self,
        cancel: &CancellationToken,
        resolved: &mut Option<WorkloadInstance>,
    ) -> StageResult<()> {
        let fullname = self.config.resolved_name();
        let namespace = &self.config.release_namespace;

        info!(release = %fullname, namespace = %namespace, "Finding pod to port-forward...");
        let instance = stage(Stage::Resolve, cancel, async {
            resolver::resolve_instance(self.cluster.as_ref(), namespace, &fullname).await
        })
        .await?;
        info!(pod = %instance, "Found pod to port-forward");
        *resolved = Some(instance.clone());

        info!("Testing Port-Forwarding...");
        stage(Stage::PortForward, cancel, self.check_port_forward(&instance, cancel)).await?;

        info!("Testing Ingress...");
        stage(Stage::Ingress, cancel, self.check_ingress()).await?;

        info!("Getting StatefulSet Service...");
        let statefulset = stage(Stage::NodePortLookup, cancel, async {
            let name = resolver::service_name(&fullname, resolver::STATEFULSET_SERVICE_SUFFIX);
            resolver::resolve_service(self.cluster.as_ref(), namespace, &name).await
        })
        .await?;
        let node_port = resolver::node_port_endpoint(&statefulset, &self.config.node_port_hostname)
            .map_err(|e| StageFailure::new(Stage::NodePortLookup, e))?;

        info!(endpoint = %node_port, "Testing NodePort...");
        stage(Stage::NodePort, cancel, self.check_node_port(&node_port)).await?;

        info!("Testing LoadBalancer...");
        self.check_load_balancer(&statefulset, cancel).await
    }

    fn rwx_path(&self) -> String {
        format!("{}/{}", RWX_PATH_PREFIX, self.config.test_file.name)
    }

    fn rwo_path(&self) -> String {
        format!("{}/{}", RWO_PATH_PREFIX, self.config.test_file.name)
    }

    fn contents(&self) -> &str {
        &self.config.test_file.contents
    }

    async fn check_port_forward(
        &self,
        instance: &WorkloadInstance,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tunnel::with_tunnel(
            self.cluster.clone(),
            instance,
            self.config.tunnel_local_port,
            SERVER_PORT,
            cancel,
            |addr| async move {
                let url = format!("http://{}/{}", addr, self.rwx_path());
                let probe = Probe::get("GET RWX Port-Forward", url).expect_body(self.contents());
                Ok(self.prober.run(&probe).await?)
            },
        )
        .await
    }

    async fn check_ingress(&self) -> Result<()> {
        let ingress = &self.config.ingress;
        let url = format!(
            "{}://{}/{}",
            ingress.scheme(),
            ingress.url_host(),
            self.rwx_path()
        );
        let mut probe = Probe::get("GET RWX Ingress", url).expect_body(self.contents());
        if let Some(host) = ingress.host_header() {
            probe = probe.host_header(host);
        }
        Ok(self.prober.run(&probe).await?)
    }

    async fn check_node_port(&self, endpoint: &ExposureEndpoint) -> Result<()> {
        let probe = Probe::get("GET RWX NodePort", endpoint.url(&self.rwx_path()))
            .expect_body(self.contents());
        Ok(self.prober.run(&probe).await?)
    }

    async fn check_load_balancer(
        &self,
        service: &Service,
        cancel: &CancellationToken,
    ) -> StageResult<()> {
        let ingresses = resolver::load_balancer_ingresses(service)
            .map_err(|e| StageFailure::new(Stage::LoadBalancer, e))?;
        let declared_ports = resolver::declared_port_count(service);

        for (index, ingress) in ingresses.iter().enumerate() {
            let endpoint = resolver::load_balancer_endpoint(index, ingress, declared_ports)
                .map_err(|e| StageFailure::new(Stage::LoadBalancer, e))?;

            info!(index, endpoint = %endpoint, "Testing LoadBalancer ingress...");
            cancellable(cancel, self.check_load_balancer_endpoint(index, &endpoint))
                .await
                .map_err(|e| StageFailure::at_ingress(Stage::LoadBalancer, index, e))?;
        }
        Ok(())
    }

    /// Shared read, per-instance write, per-instance read against one ingress point
    async fn check_load_balancer_endpoint(
        &self,
        index: usize,
        endpoint: &ExposureEndpoint,
    ) -> Result<()> {
        let rwx = Probe::get(
            format!("GET RWX LoadBalancer ingress index {}", index),
            endpoint.url(&self.rwx_path()),
        )
        .expect_body(self.contents());
        self.prober.run(&rwx).await?;

        let rwo_url = endpoint.url(&self.rwo_path());
        let write = Probe::post(
            format!("POST RWO LoadBalancer ingress index {}", index),
            rwo_url.clone(),
            self.contents(),
        );
        self.prober.run(&write).await?;

        let read = Probe::get(
            format!("GET RWO LoadBalancer ingress index {}", index),
            rwo_url,
        )
        .expect_body(self.contents());
        self.prober.run(&read).await?;
        Ok(())
    }
}

/// Race `fut` against run cancellation
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Run one stage, tagging its error with the stage
async fn stage<T>(
    stage: Stage,
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> StageResult<T> {
    cancellable(cancel, fut)
        .await
        .map_err(|e| StageFailure::new(stage, e))
}
