//! Workload schedule execution
//!
//! Translates an [`ExperimentConfiguration`] into client groups and per-tick
//! workload commands against the cluster controller.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::controller::ClusterController;
use crate::error::Result;
use crate::experiment::model::{ExperimentConfiguration, WorkloadConfiguration};
use crate::worker::api::{ClientConfig, ClientDescription, WorkloadSpec};

/// Splits a per-tick service rate across workers as evenly as integers
/// allow; the sum always equals the service rate.
pub fn split_rate(service_rate: u64, workers: usize) -> Vec<u64> {
    let mut rates = vec![0u64; workers];
    if workers == 0 {
        return rates;
    }
    for i in 0..service_rate {
        rates[(i % workers as u64) as usize] += 1;
    }
    rates
}

fn client_config(workload: &WorkloadConfiguration) -> ClientConfig {
    ClientConfig {
        service: workload.service.clone(),
        client: workload.client.clone(),
        parameters: workload.client_parameters.clone(),
        worker_labels: HashMap::new(),
    }
}

/// The per-client workload spec for one tick: the worker's share of the
/// service rate divided by the clients it hosts, rendered in the workload's
/// arrival pattern.
fn tick_spec(
    workload: &WorkloadConfiguration,
    client_id: &str,
    per_client_rate: f64,
) -> WorkloadSpec {
    match workload.arrival_pattern.as_str() {
        // expovariate(rate) has mean interarrival 1/rate
        "expovariate" => WorkloadSpec::distribution(
            client_id,
            "expovariate",
            vec![per_client_rate],
            None,
        ),
        _ => WorkloadSpec::constant(client_id, 1.0 / per_client_rate, None),
    }
}

struct WorkloadGroup<'a> {
    workload: &'a WorkloadConfiguration,
    /// Clients per worker, in `list_workers()` order.
    clients: Vec<Vec<ClientDescription>>,
}

/// Runs the configured schedule: spawns client groups, applies per-tick
/// rates, then winds everything down.
pub async fn run_experiment(
    controller: &dyn ClusterController,
    configuration: &ExperimentConfiguration,
) -> Result<()> {
    let ticks = configuration.ticks()?;
    let workers = controller.list_workers(None).await?;
    info!(ticks, workers = workers.len(), "starting workload schedule");

    let mut groups = Vec::new();
    for workload in &configuration.workloads {
        let config = client_config(workload);
        let mut clients = Vec::with_capacity(workers.len());
        for worker in &workers {
            let created = controller
                .create_client(worker, &config, workload.clients_per_host as usize)
                .await?;
            clients.push(created);
        }
        groups.push(WorkloadGroup { workload, clients });
    }

    for tick in 0..ticks {
        for group in &groups {
            let service_rate = group.workload.ticks[tick];
            let rates = split_rate(service_rate, workers.len());
            debug!(tick, service = %group.workload.service, ?rates, "applying tick rates");

            for (worker_index, clients) in group.clients.iter().enumerate() {
                let worker_rate = rates[worker_index];
                if worker_rate == 0 {
                    for client in clients {
                        controller.stop_workload(&client.client_id).await?;
                    }
                    continue;
                }

                let per_client_rate =
                    worker_rate as f64 / group.workload.clients_per_host as f64;
                for client in clients {
                    let spec = tick_spec(group.workload, &client.client_id, per_client_rate);
                    controller.set_workload(spec).await?;
                }
            }
        }

        tokio::time::sleep(Duration::from_secs_f64(configuration.interval)).await;
    }

    // Wind down: zero all rates, then close the groups
    for group in &groups {
        for client in group.clients.iter().flatten() {
            controller.stop_workload(&client.client_id).await?;
        }
    }
    for group in &groups {
        for client in group.clients.iter().flatten() {
            controller.close_client(&client.client_id).await?;
        }
    }

    info!("workload schedule complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_rate_sums_to_service_rate() {
        let rates = split_rate(5, 3);
        assert_eq!(rates, vec![2, 2, 1]);
        assert_eq!(rates.iter().sum::<u64>(), 5);

        assert_eq!(split_rate(0, 3), vec![0, 0, 0]);
        assert_eq!(split_rate(9, 3), vec![3, 3, 3]);
        assert_eq!(split_rate(1, 4), vec![1, 0, 0, 0]);
    }

    #[test]
    fn tick_spec_converts_rate_per_pattern() {
        let workload = WorkloadConfiguration {
            service: "svc".to_string(),
            ticks: vec![10],
            clients_per_host: 2,
            arrival_pattern: "constant".to_string(),
            client: None,
            client_parameters: HashMap::new(),
        };

        let spec = tick_spec(&workload, "c1", 4.0);
        assert_eq!(spec.distribution, "constant");
        assert_eq!(spec.parameters, vec![0.25]);

        let mut workload = workload;
        workload.arrival_pattern = "expovariate".to_string();
        let spec = tick_spec(&workload, "c1", 4.0);
        assert_eq!(spec.distribution, "expovariate");
        assert_eq!(spec.parameters, vec![4.0]);
    }
}
