//! Tunnel session
//!
//! Runs a body while a port-forward tunnel to one pod is live. The forwarding
//! loop runs as a background task; the caller waits on a race between that
//! task failing, the run being cancelled, and the tunnel reporting ready.
//! Whatever happens, the forwarding task is stopped and joined before
//! [`with_tunnel`] returns, so no listener outlives the call.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, WorkloadInstance};
use crate::{Error, Result};

enum Startup {
    Ready(SocketAddr),
    ReadyDropped,
    Exited(std::result::Result<Result<()>, JoinError>),
    Cancelled,
}

/// Error for a forwarding task that ended before the tunnel became ready
fn early_exit(joined: std::result::Result<Result<()>, JoinError>) -> Error {
    match joined {
        Ok(Ok(())) => Error::tunnel("forwarding loop exited before the tunnel became ready"),
        Ok(Err(e)) => e,
        Err(e) => Error::tunnel(format!("forwarding task failed: {}", e)),
    }
}

/// Stop the forwarding task and wait for it to finish
async fn teardown(
    instance: &WorkloadInstance,
    stop: &CancellationToken,
    forwarder: JoinHandle<Result<()>>,
) {
    stop.cancel();
    match forwarder.await {
        Ok(Ok(())) => debug!(pod = %instance, "Tunnel closed"),
        Ok(Err(e)) => warn!(pod = %instance, error = %e, "Tunnel closed with error"),
        Err(e) => warn!(pod = %instance, error = %e, "Tunnel task failed"),
    }
}

/// Run `body` while `local_port` is forwarded to `remote_port` on `instance`.
///
/// `body` receives the bound local address (useful when `local_port` is 0)
/// and never runs before the tunnel is ready. Its result is returned
/// unchanged. A forwarding failure before readiness is returned as-is;
/// cancellation of `cancel` at any point yields [`Error::Cancelled`].
pub async fn with_tunnel<T, F, Fut>(
    cluster: Arc<dyn ClusterApi>,
    instance: &WorkloadInstance,
    local_port: u16,
    remote_port: u16,
    cancel: &CancellationToken,
    body: F,
) -> Result<T>
where
    F: FnOnce(SocketAddr) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    let stop = cancel.child_token();

    info!(pod = %instance, local_port, remote_port, "Opening tunnel");
    let mut forwarder = tokio::spawn({
        let instance = instance.clone();
        let stop = stop.clone();
        async move {
            cluster
                .forward_port(&instance, local_port, remote_port, ready_tx, stop)
                .await
        }
    });

    let startup = tokio::select! {
        biased;
        _ = cancel.cancelled() => Startup::Cancelled,
        joined = &mut forwarder => Startup::Exited(joined),
        ready = ready_rx => match ready {
            Ok(addr) => Startup::Ready(addr),
            Err(_) => Startup::ReadyDropped,
        },
    };

    let addr = match startup {
        Startup::Ready(addr) => addr,
        // The forwarder dropped its ready sender without sending, so it is on
        // its way out; its result explains why.
        Startup::ReadyDropped => {
            stop.cancel();
            return Err(early_exit(forwarder.await));
        }
        Startup::Exited(joined) => return Err(early_exit(joined)),
        Startup::Cancelled => {
            teardown(instance, &stop, forwarder).await;
            return Err(Error::Cancelled);
        }
    };

    debug!(pod = %instance, local = %addr, "Tunnel ready");
    let result = tokio::select! {
        result = body(addr) => result,
        _ = cancel.cancelled() => Err(Error::Cancelled),
    };

    teardown(instance, &stop, forwarder).await;
    result
}
