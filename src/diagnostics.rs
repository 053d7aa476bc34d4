//! Diagnostics emitter
//!
//! Copies the tested pod's logs to an output sink once the run is over, for
//! post-mortem. The producer (`ClusterApi::stream_logs`) and the writer run
//! concurrently over a bounded channel.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cluster::{ClusterApi, WorkloadInstance};
use crate::{Error, Result};

/// Lines buffered between the log stream and the sink
const LOG_CHANNEL_CAPACITY: usize = 256;

/// Stream the logs of `instance` into `sink`, returning the number of lines written
pub async fn emit_logs<W>(
    cluster: &dyn ClusterApi,
    instance: &WorkloadInstance,
    sink: &mut W,
) -> Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let (tx, mut rx) = mpsc::channel::<String>(LOG_CHANNEL_CAPACITY);

    let produce = async {
        cluster
            .stream_logs(instance, tx)
            .await
            .map_err(|e| Error::diagnostics(format!("failed to stream logs of {}: {}", instance, e)))
    };

    // The writer owns the receiver so a failed sink closes the channel and
    // unblocks the producer.
    let write = async move {
        let mut written = 0usize;
        while let Some(line) = rx.recv().await {
            sink.write_all(line.as_bytes()).await?;
            sink.write_all(b"\n").await?;
            written += 1;
        }
        sink.flush().await?;
        Ok::<_, std::io::Error>(written)
    };

    let (produced, written) = tokio::join!(produce, write);
    let written = written
        .map_err(|e| Error::diagnostics(format!("failed to write logs of {}: {}", instance, e)))?;
    produced?;

    debug!(pod = %instance, lines = written, "Streamed pod logs");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Pod, Service};
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    use crate::cluster::{ClusterApi, MockClusterApi};
    use crate::error::ErrorKind;

    // ===== Test Fixtures =====

    /// Sink whose every write fails, like stdout piped into a closed reader
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Producer that awaits channel capacity for every line, like a real log stream
    struct ChattyPod {
        lines: usize,
    }

    #[async_trait]
    impl ClusterApi for ChattyPod {
        async fn get_service(&self, _: &str, _: &str) -> Result<Option<Service>> {
            Ok(None)
        }

        async fn list_pods(&self, _: &str, _: &str) -> Result<Vec<Pod>> {
            Ok(vec![])
        }

        async fn forward_port(
            &self,
            _: &WorkloadInstance,
            _: u16,
            _: u16,
            _: oneshot::Sender<SocketAddr>,
            _: CancellationToken,
        ) -> Result<()> {
            Ok(())
        }

        async fn stream_logs(
            &self,
            _: &WorkloadInstance,
            lines: mpsc::Sender<String>,
        ) -> Result<()> {
            for i in 0..self.lines {
                if lines.send(format!("line {}", i)).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
    }

    fn instance() -> WorkloadInstance {
        WorkloadInstance {
            name: "demo-deployment-0".to_string(),
            namespace: "smoke".to_string(),
        }
    }

    #[tokio::test]
    async fn copies_every_line_to_the_sink() {
        let mut mock = MockClusterApi::new();
        mock.expect_stream_logs().returning(|_, lines| {
            // Bounded channel has room for these without a reader
            lines.try_send("GET /health".to_string()).unwrap();
            lines.try_send("GET /rwx/test-file".to_string()).unwrap();
            Ok(())
        });

        let mut sink = Vec::new();
        let written = emit_logs(&mock, &instance(), &mut sink).await.unwrap();

        assert_eq!(written, 2);
        assert_eq!(
            String::from_utf8(sink).unwrap(),
            "GET /health\nGET /rwx/test-file\n"
        );
    }

    #[tokio::test]
    async fn stream_failure_is_a_diagnostics_error() {
        let mut mock = MockClusterApi::new();
        mock.expect_stream_logs()
            .returning(|_, _| Err(Error::tunnel("container not started")));

        let mut sink = Vec::new();
        let err = emit_logs(&mock, &instance(), &mut sink).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Diagnostics);
        assert!(err.to_string().contains("container not started"));
        assert!(err.to_string().contains("smoke/demo-deployment-0"));
    }

    #[tokio::test]
    async fn failing_sink_does_not_stall_a_long_log_stream() {
        let pod = ChattyPod {
            lines: LOG_CHANNEL_CAPACITY * 4,
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            emit_logs(&pod, &instance(), &mut BrokenPipe),
        )
        .await
        .expect("emit_logs hung after the sink failed");

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Diagnostics);
        assert!(err.to_string().contains("failed to write logs"));
    }
}
