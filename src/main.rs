//! galileo-worker - runs one worker daemon until interrupted

use anyhow::Result;
use clap::Parser;
use galileo::worker::WorkerDaemon;
use galileo::{Runtime, RuntimeConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "galileo-worker", about = "Galileo worker daemon", version)]
struct Args {
    /// Worker name; defaults to GALILEO_WORKER_NAME or the hostname
    #[arg(long)]
    name: Option<String>,

    /// Redis host backing the coordination substrate
    #[arg(long)]
    redis_host: Option<String>,
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
    if let Some(name) = args.name {
        config.worker_name = name;
    }
    if let Some(host) = args.redis_host {
        config.redis_host = host;
    }

    info!(worker = %config.worker_name, redis = %config.redis_host, "starting galileo worker");

    let runtime = Arc::new(Runtime::connect(config).await.inspect_err(|e| {
        error!(error = %e, "cannot reach the coordination substrate");
    })?);

    let context = runtime.worker_context().await?;
    let daemon = WorkerDaemon::new(context);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    daemon.run(shutdown).await?;
    info!("galileo worker stopped");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
