//! End-to-end experiment execution: queue -> daemon -> workload schedule ->
//! terminal status, with a live worker serving the clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use galileo::Runtime;
use galileo::controller::{ClusterController, ExperimentController};
use galileo::experiment::{
    Experiment, ExperimentConfiguration, ExperimentDaemon, ExperimentStatus, ExperimentStore,
    InMemoryExperimentStore, WorkloadConfiguration,
};
use galileo::routing::DebugRouter;
use galileo::runtime::RuntimeConfig;
use galileo::substrate::InMemorySubstrate;
use galileo::worker::{
    FixedRouterFactory, SubstrateTraceWriter, TRACES_KEY, WorkerDaemon, WorkerState,
};
use tokio_util::sync::CancellationToken;

fn workload(service: &str, ticks: Vec<u64>) -> WorkloadConfiguration {
    WorkloadConfiguration {
        service: service.to_string(),
        ticks,
        clients_per_host: 2,
        arrival_pattern: "constant".to_string(),
        client: None,
        client_parameters: HashMap::new(),
    }
}

#[test_log::test(tokio::test)]
async fn queued_experiment_runs_to_finished() {
    let substrate = Arc::new(InMemorySubstrate::new());

    let worker_runtime = Arc::new(Runtime::with_substrate(
        RuntimeConfig {
            worker_name: "w1".to_string(),
            ..Default::default()
        },
        substrate.clone(),
    ));
    let mut context = worker_runtime.worker_context().await.unwrap();
    context.trace_writer = Arc::new(SubstrateTraceWriter::new(substrate.clone()));
    // Dry-run routing: every request resolves and succeeds locally
    context.routers = Arc::new(FixedRouterFactory::new(Arc::new(DebugRouter::new(None))));
    let worker = WorkerDaemon::new(context);

    let shutdown = CancellationToken::new();
    let worker_task = tokio::spawn({
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    let mut states = worker.state();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *states.borrow() != WorkerState::Running {
            states.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let runtime = Runtime::with_substrate(RuntimeConfig::default(), substrate.clone());
    let bus = runtime.bus();
    let cluster = runtime.cluster();
    let store = Arc::new(InMemoryExperimentStore::new());

    let daemon = Arc::new(ExperimentDaemon::new(&bus, cluster.clone(), store.clone()));
    let daemon_task = tokio::spawn({
        let daemon = daemon.clone();
        let shutdown = shutdown.clone();
        async move { daemon.run(shutdown).await }
    });

    let controller = ExperimentController::new(&bus, cluster.clone());
    controller
        .queue(
            ExperimentConfiguration {
                duration: 0.3,
                interval: 0.15,
                workloads: vec![workload("myservice", vec![10, 10])],
            },
            Some(Experiment {
                id: Some("exp-e2e".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

    // Wait until the daemon finalizes the experiment
    let experiment = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if let Some(experiment) = store.find_experiment("exp-e2e").await.unwrap() {
                if experiment.status.is_terminal() {
                    return experiment;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("experiment never finished");

    assert_eq!(experiment.status, ExperimentStatus::Finished);
    assert!(experiment.start.is_some());
    assert!(experiment.end.is_some());
    assert!(experiment.end.unwrap() >= experiment.start.unwrap());
    assert_eq!(experiment.name.as_deref(), Some("exp-e2e"));

    // The schedule ran requests: traces landed in the sink after the
    // final pause flushed the logger
    tokio::time::timeout(Duration::from_secs(5), async {
        while substrate.scored_members(TRACES_KEY).is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no traces reached the sink");

    // The run closed its client groups
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cluster.list_clients(None).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("experiment clients were not closed");

    daemon.close().await.unwrap();
    daemon_task.await.unwrap().unwrap();

    shutdown.cancel();
    worker_task.await.unwrap().unwrap();
}

#[test_log::test(tokio::test)]
async fn queue_refuses_without_workers() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let runtime = Runtime::with_substrate(RuntimeConfig::default(), substrate);
    let controller = ExperimentController::new(&runtime.bus(), runtime.cluster());

    let result = controller
        .queue(
            ExperimentConfiguration {
                duration: 1.0,
                interval: 1.0,
                workloads: vec![workload("svc", vec![1])],
            },
            None,
        )
        .await;

    assert!(matches!(
        result,
        Err(galileo::GalileoError::InvalidArgument(_))
    ));
}
