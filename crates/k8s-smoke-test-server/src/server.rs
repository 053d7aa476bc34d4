//! HTTP routers for the deployment and statefulset components
//!
//! Both components serve `GET /health` and read files from the shared RWX
//! volume under `/rwx/`. The statefulset additionally reads and writes its
//! own RWO volume under `/rwo/`. Every volume request first checks the peer
//! component's health endpoint, so a file is only served while both sides of
//! the release are up.

use std::future::Future;
use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{Error, Result};
use crate::volume::Volume;

/// Health endpoint of the peer component, checked before each volume request
#[derive(Debug, Clone)]
pub struct PeerGate {
    client: reqwest::Client,
    health_url: String,
}

impl PeerGate {
    /// Gate on `health_url` answering 200
    pub fn new(client: reqwest::Client, health_url: impl Into<String>) -> Self {
        Self {
            client,
            health_url: health_url.into(),
        }
    }

    /// Fail with [`Error::PeerUnhealthy`] unless the peer answers 200
    pub async fn check(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.health_url)
            .send()
            .await
            .map_err(|e| Error::PeerUnhealthy(format!("{}: {}", self.health_url, e)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::PeerUnhealthy(format!(
                "{} returned {}",
                self.health_url, status
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
struct Mount {
    volume: Volume,
    peer: PeerGate,
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn read_file(State(mount): State<Mount>, Path(path): Path<String>) -> Result<Vec<u8>> {
    mount.peer.check().await?;
    mount.volume.read(&path).await
}

async fn write_file(
    State(mount): State<Mount>,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<StatusCode> {
    mount.peer.check().await?;
    mount.volume.write(&path, &body).await?;
    Ok(StatusCode::OK)
}

async fn log_request(request: Request, next: Next) -> Response {
    info!(method = %request.method(), uri = %request.uri(), "Request");
    next.run(request).await
}

fn read_only(prefix: &str, mount: Mount) -> Router {
    Router::new()
        .route(&format!("/{}/{{*path}}", prefix), get(read_file))
        .with_state(mount)
}

fn read_write(prefix: &str, mount: Mount) -> Router {
    Router::new()
        .route(
            &format!("/{}/{{*path}}", prefix),
            get(read_file).post(write_file),
        )
        .with_state(mount)
}

/// Router for the deployment component: `/health` and read-only `/rwx/`
pub fn deployment_router(rwx: Volume, statefulset: PeerGate) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(read_only(
            "rwx",
            Mount {
                volume: rwx,
                peer: statefulset,
            },
        ))
        .layer(middleware::from_fn(log_request))
}

/// Router for the statefulset component: `/health`, read-only `/rwx/` and
/// read-write `/rwo/`
pub fn statefulset_router(rwx: Volume, rwo: Volume, deployment: PeerGate) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(read_only(
            "rwx",
            Mount {
                volume: rwx,
                peer: deployment.clone(),
            },
        ))
        .merge(read_write(
            "rwo",
            Mount {
                volume: rwo,
                peer: deployment,
            },
        ))
        .layer(middleware::from_fn(log_request))
}

/// Serve `router` on `listen` until `shutdown` completes
pub async fn serve<F>(listen: SocketAddr, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
