//! k8s-smoke-test - verify an installed smoke-test release end to end

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use k8s_smoke_test::cluster::KubeCluster;
use k8s_smoke_test::config::{MergedValues, RunConfig, RunOverrides};
use k8s_smoke_test::http::{build_client, HttpOptions};
use k8s_smoke_test::probe::Prober;
use k8s_smoke_test::verify::{DiagnosticsOutcome, Verifier};

/// Verify that an installed k8s-smoke-test release serves its test file on every path
#[derive(Parser, Debug)]
#[command(name = "k8s-smoke-test", version, about, long_about = None)]
struct Cli {
    /// Name of the helm release under test
    #[arg(long, default_value = "k8s-smoke-test")]
    release_name: String,

    /// Merged helm values as JSON; `-` reads stdin
    #[arg(long, default_value = "-")]
    merged_values_json: PathBuf,

    /// Path to the kubeconfig file
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long)]
    context: Option<String>,

    /// Namespace the release was installed into (defaults to the context namespace)
    #[arg(short = 'n', long)]
    namespace: Option<String>,

    /// Connect to this host for the ingress probe, sending the values hostname as `Host`
    #[arg(long)]
    ingress_hostname: Option<String>,

    /// Use HTTPS for the ingress probe
    #[arg(long)]
    ingress_tls: bool,

    /// Local port for the port-forward tunnel (0 picks a free port)
    #[arg(long, default_value_t = 0)]
    port_forward_local_port: u16,

    /// Proxy URL for every probe
    #[arg(long)]
    proxy: Option<String>,

    /// Accept any certificate on HTTPS probes
    #[arg(long)]
    insecure_skip_tls_verify: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    run(cli).await
}

/// Load the kube client config from an explicit kubeconfig, or the usual defaults
async fn kube_config(cli: &Cli) -> anyhow::Result<Config> {
    let options = KubeConfigOptions {
        context: cli.context.clone(),
        ..Default::default()
    };

    let config = match &cli.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                anyhow::anyhow!("Failed to read kubeconfig {}: {}", path.display(), e)
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
        None if cli.context.is_some() => Config::from_kubeconfig(&options).await?,
        None => Config::infer().await?,
    };
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let values = MergedValues::load_blocking(cli.merged_values_json.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load merged values: {}", e))?;

    let kube_config = kube_config(&cli).await?;
    let namespace = cli
        .namespace
        .clone()
        .unwrap_or_else(|| kube_config.default_namespace.clone());
    let client = Client::try_from(kube_config)?;

    let config = RunConfig::new(
        values,
        RunOverrides {
            release_namespace: namespace,
            release_name: cli.release_name.clone(),
            ingress_hostname: cli.ingress_hostname.clone(),
            ingress_tls: cli.ingress_tls,
            tunnel_local_port: cli.port_forward_local_port,
        },
    )?;

    let http = build_client(&HttpOptions {
        proxy: cli.proxy.clone(),
        insecure_skip_tls_verify: cli.insecure_skip_tls_verify,
    })?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling run");
                cancel.cancel();
            }
        }
    });

    info!(
        release = %config.release_name,
        namespace = %config.release_namespace,
        "Verifying release"
    );
    let verifier = Verifier::new(
        Arc::new(KubeCluster::new(client)),
        Prober::new(http),
        config,
    );
    let mut stdout = tokio::io::stdout();
    let report = verifier.run(&cancel, &mut stdout).await;

    match &report.diagnostics {
        DiagnosticsOutcome::Streamed { lines } => info!(lines, "Pod logs collected"),
        DiagnosticsOutcome::Skipped => info!("No pod resolved, skipping pod logs"),
        DiagnosticsOutcome::Failed(e) => error!(error = %e, "Pod logs unavailable"),
    }

    report.into_result()?;
    info!("PASSED");
    Ok(())
}
