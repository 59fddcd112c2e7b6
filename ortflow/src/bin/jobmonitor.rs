//! Kubernetes job monitor: reports the outcome of worker Jobs to the
//! orchestrator.

use std::sync::Arc;

use clap::Parser;
use ortflow::monitor::{JobMonitor, KubeWorkloadApi};
use ortflow::transport::OrchestratorEndpoint;
use ortflow::{MonitorConfig, ShutdownToken, TransportConfig, TransportRegistry};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ortflow-jobmonitor", version, about = "Watch ORT worker Jobs")]
struct Cli {
    /// Namespace to watch; overrides `MONITOR_NAMESPACE`.
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    #[cfg(feature = "metrics")]
    ortflow::metrics::init_metrics()?;

    let mut config = MonitorConfig::from_env()?;
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }

    let api = KubeWorkloadApi::try_default(&config.namespace).await?;
    let registry = TransportRegistry::builtin();
    let sender = registry
        .message_sender::<OrchestratorEndpoint>(&TransportConfig::from_env())
        .await?;

    let monitor = Arc::new(JobMonitor::new(Arc::new(api), sender, config));
    let shutdown = ShutdownToken::new();

    let task = {
        let monitor = Arc::clone(&monitor);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { monitor.run(shutdown).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();
    task.await?
}
