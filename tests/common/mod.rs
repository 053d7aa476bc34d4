//! Shared fixtures: an in-memory cluster and the real component servers on loopback

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Pod, PortStatus, Service, ServicePort, ServiceSpec,
    ServiceStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use k8s_smoke_test::cluster::{ClusterApi, WorkloadInstance};
use k8s_smoke_test::config::{MergedValues, RunConfig, RunOverrides};
use k8s_smoke_test::http::{build_client, HttpOptions};
use k8s_smoke_test::probe::Prober;
use k8s_smoke_test::verify::Verifier;
use k8s_smoke_test::{Error, Result};
use k8s_smoke_test_server::job::write_test_file;
use k8s_smoke_test_server::server::{deployment_router, statefulset_router, PeerGate};
use k8s_smoke_test_server::volume::Volume;

pub const NAMESPACE: &str = "smoke";
pub const RELEASE: &str = "demo";
pub const FULLNAME: &str = "demo-k8s-smoke-test";
pub const TEST_FILE: &str = "test-file";
pub const CONTENTS: &str = "This is a test file";

// ===== Component servers =====

async fn serve(listener: TcpListener, router: Router) {
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
}

/// The deployment and statefulset servers with their volumes, seeded by the job
pub struct Release {
    pub rwx: TempDir,
    pub rwo: TempDir,
    pub deployment: SocketAddr,
    pub statefulset: SocketAddr,
}

impl Release {
    pub async fn start() -> Self {
        let rwx = tempfile::tempdir().unwrap();
        let rwo = tempfile::tempdir().unwrap();
        write_test_file(&Volume::new(rwx.path()), TEST_FILE, CONTENTS)
            .await
            .unwrap();

        let deployment_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let statefulset_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let deployment = deployment_listener.local_addr().unwrap();
        let statefulset = statefulset_listener.local_addr().unwrap();

        let client = reqwest::Client::new();
        serve(
            deployment_listener,
            deployment_router(
                Volume::new(rwx.path()),
                PeerGate::new(client.clone(), format!("http://{}/health", statefulset)),
            ),
        )
        .await;
        serve(
            statefulset_listener,
            statefulset_router(
                Volume::new(rwx.path()),
                Volume::new(rwo.path()),
                PeerGate::new(client, format!("http://{}/health", deployment)),
            ),
        )
        .await;

        Self {
            rwx,
            rwo,
            deployment,
            statefulset,
        }
    }
}

/// A server that answers every GET with `body`
pub async fn static_server(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new().fallback(move || async move { body });
    serve(listener, router).await;
    addr
}

// ===== Cluster objects =====

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/instance".to_string(), RELEASE.to_string()),
        ("app.kubernetes.io/component".to_string(), "deployment".to_string()),
    ])
}

pub fn deployment_service() -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(format!("{}-deployment", FULLNAME)),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn deployment_pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Load balancer ingress entry pointing at `port` on loopback
pub fn lb_ingress(port: u16, error: Option<&str>) -> LoadBalancerIngress {
    LoadBalancerIngress {
        ip: Some("127.0.0.1".to_string()),
        ports: Some(vec![PortStatus {
            port: i32::from(port),
            protocol: "TCP".to_string(),
            error: error.map(str::to_string),
        }]),
        ..Default::default()
    }
}

pub fn statefulset_service(node_port: u16, ingresses: Vec<LoadBalancerIngress>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(format!("{}-statefulset", FULLNAME)),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ports: Some(vec![ServicePort {
                port: 8080,
                node_port: Some(i32::from(node_port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(ingresses),
            }),
            ..Default::default()
        }),
    }
}

// ===== Fake cluster =====

/// In-memory control plane whose port-forward relays to a loopback server
pub struct FakeCluster {
    services: HashMap<String, Service>,
    pods: Vec<Pod>,
    forward_to: SocketAddr,
    logs: Vec<String>,
    log_failure: Option<&'static str>,
    pub forwards: AtomicUsize,
    pub log_streams: AtomicUsize,
}

impl FakeCluster {
    pub fn new(forward_to: SocketAddr) -> Self {
        Self {
            services: HashMap::new(),
            pods: Vec::new(),
            forward_to,
            logs: vec!["GET /health".to_string(), "GET /rwx/test-file".to_string()],
            log_failure: None,
            forwards: AtomicUsize::new(0),
            log_streams: AtomicUsize::new(0),
        }
    }

    pub fn with_service(mut self, service: Service) -> Self {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.services.insert(name, service);
        self
    }

    pub fn with_pod(mut self, pod: Pod) -> Self {
        self.pods.push(pod);
        self
    }

    /// Make every log stream fail with `message`
    pub fn with_log_failure(mut self, message: &'static str) -> Self {
        self.log_failure = Some(message);
        self
    }

    /// The healthy release: both services, one pod, node port and one LB entry
    /// pointing at the statefulset server
    pub fn healthy(release: &Release) -> Self {
        Self::new(release.deployment)
            .with_service(deployment_service())
            .with_pod(deployment_pod("demo-k8s-smoke-test-deployment-abc12"))
            .with_service(statefulset_service(
                release.statefulset.port(),
                vec![lb_ingress(release.statefulset.port(), None)],
            ))
    }
}

fn selects(pod: &Pod, label_selector: &str) -> bool {
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    label_selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v))
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        if namespace != NAMESPACE {
            return Ok(None);
        }
        Ok(self.services.get(name).cloned())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        if namespace != NAMESPACE {
            return Ok(vec![]);
        }
        Ok(self
            .pods
            .iter()
            .filter(|pod| selects(pod, label_selector))
            .cloned()
            .collect())
    }

    async fn forward_port(
        &self,
        _instance: &WorkloadInstance,
        local_port: u16,
        _remote_port: u16,
        ready: oneshot::Sender<SocketAddr>,
        stop: CancellationToken,
    ) -> Result<()> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port)).await?;
        let _ = ready.send(listener.local_addr()?);

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => {
                    let (mut socket, _) = accepted?;
                    let target = self.forward_to;
                    connections.spawn(async move {
                        let mut upstream = TcpStream::connect(target).await?;
                        tokio::io::copy_bidirectional(&mut socket, &mut upstream).await?;
                        Ok::<_, std::io::Error>(())
                    });
                }
            }
        }
        connections.shutdown().await;
        Ok(())
    }

    async fn stream_logs(
        &self,
        _instance: &WorkloadInstance,
        lines: mpsc::Sender<String>,
    ) -> Result<()> {
        self.log_streams.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.log_failure {
            return Err(Error::tunnel(message));
        }
        for line in &self.logs {
            if lines.send(line.clone()).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

// ===== Run configuration =====

/// Run config whose ingress connects to `ingress` with the chart hostname as `Host`
pub fn run_config(ingress: SocketAddr) -> RunConfig {
    let values = format!(
        r#"{{
            "testFile": {{"name": "{}", "contents": "{}"}},
            "deployment": {{"ingress": {{"hostname": "k8s-smoke-test.example.com", "tls": []}}}},
            "statefulset": {{"nodePortHostname": "127.0.0.1"}}
        }}"#,
        TEST_FILE, CONTENTS
    );
    RunConfig::new(
        MergedValues::from_reader(values.as_bytes()).unwrap(),
        RunOverrides {
            release_namespace: NAMESPACE.to_string(),
            release_name: RELEASE.to_string(),
            ingress_hostname: Some(ingress.to_string()),
            ingress_tls: false,
            tunnel_local_port: 0,
        },
    )
    .unwrap()
}

pub fn verifier(cluster: Arc<FakeCluster>, config: RunConfig) -> Verifier {
    let client = build_client(&HttpOptions::default()).unwrap();
    Verifier::new(cluster, Prober::new(client), config)
}
