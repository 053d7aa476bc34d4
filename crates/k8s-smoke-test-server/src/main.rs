//! k8s-smoke-test-server - file-serving components of the smoke-test chart

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use k8s_smoke_test_server::job::write_test_file;
use k8s_smoke_test_server::server::{deployment_router, serve, statefulset_router, PeerGate};
use k8s_smoke_test_server::volume::Volume;
use k8s_smoke_test_server::{DEFAULT_LISTEN, DEFAULT_RWO_MOUNT, DEFAULT_RWX_MOUNT};

/// File-serving components deployed by the k8s-smoke-test chart
#[derive(Parser, Debug)]
#[command(name = "k8s-smoke-test-server", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the shared volume, gated on the statefulset's health
    Deployment {
        /// Path the RWX volume was mounted to
        #[arg(long, default_value = DEFAULT_RWX_MOUNT)]
        rwx_volume_mount: PathBuf,

        /// Address to listen on
        #[arg(long, default_value = DEFAULT_LISTEN)]
        listen: SocketAddr,

        /// Health URL of the statefulset
        #[arg(
            long,
            default_value = "http://k8s-smoke-test-0.k8s-smoke-test-statefulset:8080/health"
        )]
        statefulset_url: String,
    },

    /// Serve the shared volume and the per-instance volume, gated on the deployment's health
    Statefulset {
        /// Path the RWX volume was mounted to
        #[arg(long, default_value = DEFAULT_RWX_MOUNT)]
        rwx_volume_mount: PathBuf,

        /// Path the RWO volume was mounted to
        #[arg(long, default_value = DEFAULT_RWO_MOUNT)]
        rwo_volume_mount: PathBuf,

        /// Address to listen on
        #[arg(long, default_value = DEFAULT_LISTEN)]
        listen: SocketAddr,

        /// Health URL of the deployment
        #[arg(long, default_value = "http://k8s-smoke-test-deployment/health")]
        deployment_url: String,
    },

    /// Write the test file to the shared volume and exit
    Job {
        /// Path the RWX volume was mounted to
        #[arg(long, default_value = DEFAULT_RWX_MOUNT)]
        rwx_volume_mount: PathBuf,

        /// Name of the file to write
        #[arg(long, default_value = "test-file")]
        file_name: String,

        /// Contents of the test file
        #[arg(long, default_value = "This is a test file")]
        file_contents: String,
    },
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Deployment {
            rwx_volume_mount,
            listen,
            statefulset_url,
        } => {
            let router = deployment_router(
                Volume::new(rwx_volume_mount),
                PeerGate::new(client, statefulset_url),
            );
            serve(listen, router, shutdown_signal()).await?;
        }
        Commands::Statefulset {
            rwx_volume_mount,
            rwo_volume_mount,
            listen,
            deployment_url,
        } => {
            let router = statefulset_router(
                Volume::new(rwx_volume_mount),
                Volume::new(rwo_volume_mount),
                PeerGate::new(client, deployment_url),
            );
            serve(listen, router, shutdown_signal()).await?;
        }
        Commands::Job {
            rwx_volume_mount,
            file_name,
            file_contents,
        } => {
            write_test_file(&Volume::new(rwx_volume_mount), &file_name, &file_contents).await?;
        }
    }
    Ok(())
}
