//! galileo - operator CLI for the cluster
//!
//! Lists workers and clients, spawns client groups, sets workload rates,
//! and edits routing records. Exits non-zero when the substrate is
//! unreachable.

use anyhow::Result;
use clap::{Parser, Subcommand};
use galileo::routing::{RoutingRecord, RoutingTable};
use galileo::worker::api::ClientConfig;
use galileo::{Runtime, RuntimeConfig};

#[derive(Parser, Debug)]
#[command(name = "galileo", about = "Galileo cluster controller", version)]
struct Args {
    /// Redis host backing the coordination substrate
    #[arg(long)]
    redis_host: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List registered workers, optionally filtered by an anchored regex
    Workers {
        pattern: Option<String>,
        /// Include worker labels
        #[arg(long)]
        info: bool,
    },
    /// List clients, of one worker or of the whole cluster
    Clients { worker: Option<String> },
    /// Ping all live workers
    Ping,
    /// Reset membership and ask workers to re-register
    Discover,
    /// Spawn clients for a service
    Spawn {
        service: String,
        /// Number of clients to place across the cluster
        #[arg(long, default_value_t = 1)]
        num: usize,
        /// App the clients run; defaults to the built-in http app
        #[arg(long)]
        client: Option<String>,
    },
    /// Set a constant request rate on a client
    Rps { client_id: String, rps: f64 },
    /// Pause a client's workload
    Stop { client_id: String },
    /// Close a client
    Close { client_id: String },
    /// Start trace logging on all workers
    StartTracing,
    /// Pause trace logging on all workers
    StopTracing,
    /// Show or edit the routing table
    #[command(subcommand)]
    Routing(RoutingCmd),
}

#[derive(Subcommand, Debug)]
enum RoutingCmd {
    /// Print all routing records
    List,
    /// Set the record of a service: host=weight pairs
    Set {
        service: String,
        /// host=weight entries, e.g. 10.0.0.1:8080=2
        entries: Vec<String>,
    },
    /// Remove the record of a service
    Remove { service: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = RuntimeConfig::from_env()?;
    if let Some(host) = args.redis_host {
        config.redis_host = host;
    }

    let runtime = Runtime::connect(config).await?;
    let cluster = runtime.cluster();

    match args.command {
        Cmd::Workers { pattern, info } => {
            if info {
                for (worker, labels) in cluster.list_workers_info(pattern.as_deref()).await? {
                    println!("{worker} {labels:?}");
                }
            } else {
                for worker in cluster.list_workers(pattern.as_deref()).await? {
                    println!("{worker}");
                }
            }
        }
        Cmd::Clients { worker } => {
            for client in cluster.list_clients(worker.as_deref()).await? {
                println!("{} ({})", client.client_id, client.config.service);
            }
        }
        Cmd::Ping => {
            for worker in cluster.ping().await? {
                println!("{worker}");
            }
        }
        Cmd::Discover => {
            cluster.discover().await?;
            println!("discovery triggered");
        }
        Cmd::Spawn {
            service,
            num,
            client,
        } => {
            let mut config = ClientConfig::new(service);
            config.client = client;
            for description in cluster.create_clients(&config, num).await? {
                println!("{}", description.client_id);
            }
        }
        Cmd::Rps { client_id, rps } => {
            if rps <= 0.0 {
                cluster.stop_workload(&client_id).await?;
            } else {
                cluster.set_rps(&client_id, rps).await?;
            }
        }
        Cmd::Stop { client_id } => cluster.stop_workload(&client_id).await?,
        Cmd::Close { client_id } => cluster.close_client(&client_id).await?,
        Cmd::StartTracing => cluster.start_tracing().await?,
        Cmd::StopTracing => cluster.stop_tracing().await?,
        Cmd::Routing(command) => {
            let table = runtime.routing_table();
            match command {
                RoutingCmd::List => {
                    for record in table.get_routes().await? {
                        let pairs: Vec<String> = record
                            .hosts
                            .iter()
                            .zip(&record.weights)
                            .map(|(host, weight)| format!("{host}={weight}"))
                            .collect();
                        println!("{}: {}", record.service, pairs.join(" "));
                    }
                }
                RoutingCmd::Set { service, entries } => {
                    let mut hosts = Vec::new();
                    let mut weights = Vec::new();
                    for entry in entries {
                        let (host, weight) = entry.split_once('=').unwrap_or((entry.as_str(), "1"));
                        hosts.push(host.to_string());
                        weights.push(weight.parse()?);
                    }
                    table
                        .set_routing(RoutingRecord::new(service, hosts, weights)?)
                        .await?;
                }
                RoutingCmd::Remove { service } => table.remove_service(&service).await?,
            }
        }
    }

    Ok(())
}
