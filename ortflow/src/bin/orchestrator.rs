//! Orchestrator service: consumes the orchestrator endpoint and drives ORT
//! runs stored in PostgreSQL.

use std::sync::Arc;

use clap::Parser;
use ortflow::persistence::PostgresRunStore;
use ortflow::{
    OrchestratorConfig, OrchestratorRuntimeBuilder, PersistenceConfig, TransportConfig,
    TransportRegistry,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ortflow-orchestrator", version, about = "Run the ORT run orchestrator")]
struct Cli {
    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Maximum number of pooled database connections.
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,

    /// Do not apply schema migrations on startup.
    #[arg(long, env = "ORTFLOW_SKIP_MIGRATIONS")]
    skip_migrations: bool,
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

    let mut persistence = PersistenceConfig::new(cli.database_url);
    persistence.max_connections = cli.max_connections;
    let store = PostgresRunStore::connect(&persistence).await?;
    if !cli.skip_migrations {
        store.migrate().await?;
    }

    let config = OrchestratorConfig::from_env()?;
    let transport = TransportConfig::from_env();
    let registry = TransportRegistry::builtin();

    let runtime = OrchestratorRuntimeBuilder::new(config)
        .with_store(Arc::new(store))
        .with_transport(&registry, &transport)
        .await?
        .build()?;

    runtime.start().await?;
    info!("orchestrator running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    runtime.shutdown().await
}
