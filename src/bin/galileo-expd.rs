//! galileo-expd - consumes the experiment queue and executes experiments

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use galileo::experiment::{ExperimentDaemon, ExperimentStore, SqliteExperimentStore};
use galileo::{Runtime, RuntimeConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "galileo-expd", about = "Galileo experiment daemon", version)]
struct Args {
    /// Redis host backing the coordination substrate
    #[arg(long)]
    redis_host: Option<String>,

    /// Path of the sqlite database holding experiments and traces
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("galileo=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = RuntimeConfig::from_env()?;
    if let Some(host) = args.redis_host {
        config.redis_host = host;
    }
    if let Some(db) = args.db {
        config.sqlite_path = db;
    }

    info!(redis = %config.redis_host, db = %config.sqlite_path, "starting experiment daemon");

    let runtime = Runtime::connect(config).await.inspect_err(|e| {
        error!(error = %e, "cannot reach the coordination substrate");
    })?;

    let store: Arc<dyn ExperimentStore> = Arc::new(
        SqliteExperimentStore::open(&runtime.config().sqlite_path).await?,
    );
    let daemon = ExperimentDaemon::new(&runtime.bus(), runtime.cluster(), store);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    daemon.run(shutdown).await?;
    info!("experiment daemon stopped");
    Ok(())
}
