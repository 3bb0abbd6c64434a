//! Experiment daemon
//!
//! Single consumer of the experiment queue. For each queued experiment it
//! fills in missing metadata, flips the status to IN_PROGRESS, starts
//! tracing, executes the workload schedule, and always leaves the experiment
//! in a terminal state with tracing paused, whatever the run did.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bus::EventBus;
use crate::controller::{ClusterController, ExperimentQueue};
use crate::error::{GalileoError, Result};
use crate::experiment::model::{
    Experiment, ExperimentConfiguration, ExperimentStatus, QueuedExperiment,
    generate_experiment_id,
};
use crate::experiment::runner;
use crate::experiment::store::ExperimentStore;
use crate::util;

pub struct ExperimentDaemon {
    queue: ExperimentQueue,
    controller: Arc<dyn ClusterController>,
    store: Arc<dyn ExperimentStore>,
}

impl ExperimentDaemon {
    pub fn new(
        bus: &EventBus,
        controller: Arc<dyn ClusterController>,
        store: Arc<dyn ExperimentStore>,
    ) -> Self {
        Self {
            queue: ExperimentQueue::new(bus),
            controller,
            store,
        }
    }

    /// Asks a running daemon to exit once it finishes the current item.
    pub async fn close(&self) -> Result<()> {
        self.queue.put_poison().await
    }

    /// Consumes the queue until poisoned or cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("listening for incoming experiments");

        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => break,
                item = self.queue.get() => item,
            };

            let queued = match item {
                Ok(Some(queued)) => queued,
                Ok(None) => {
                    info!("poison received");
                    break;
                }
                Err(GalileoError::Shutdown) => break,
                Err(e) => return Err(e),
            };

            self.process(queued).await;
        }

        info!("exiting experiment daemon loop");
        Ok(())
    }

    async fn process(&self, queued: QueuedExperiment) {
        let configuration = queued.configuration.clone();
        let mut experiment = match self.materialize(queued).await {
            Ok(experiment) => experiment,
            Err(e) => {
                error!(error = %e, "error while loading experiment from queue");
                return;
            }
        };
        let id = experiment.id.clone().unwrap_or_default();

        info!(experiment = %id, "starting experiment");
        let outcome = self.execute(&mut experiment, &configuration).await;

        // Whatever happened: tracing off, status terminal
        if let Err(e) = self.controller.stop_tracing().await {
            error!(experiment = %id, error = %e, "failed to pause tracing");
        }

        let terminal = match outcome {
            Ok(()) => ExperimentStatus::Finished,
            Err(e) => {
                error!(experiment = %id, error = %e, "error while running experiment");
                ExperimentStatus::Failed
            }
        };
        self.finalize(&mut experiment, terminal).await;
        info!(experiment = %id, status = %experiment.status, "finalized experiment");
    }

    async fn execute(
        &self,
        experiment: &mut Experiment,
        configuration: &ExperimentConfiguration,
    ) -> Result<()> {
        experiment.transition(ExperimentStatus::InProgress)?;
        experiment.start = Some(util::timestamp());
        self.store.save_experiment(experiment).await?;

        self.controller.start_tracing().await?;
        runner::run_experiment(self.controller.as_ref(), configuration).await
    }

    /// Reuses the persisted record when the queued experiment names an
    /// existing id, and fills in whatever metadata is missing.
    async fn materialize(&self, queued: QueuedExperiment) -> Result<Experiment> {
        let mut experiment = queued.experiment;
        if let Some(id) = experiment.id.clone() {
            if let Some(persisted) = self.store.find_experiment(&id).await? {
                experiment = persisted;
            }
        }

        if experiment.id.is_none() {
            experiment.id = Some(generate_experiment_id());
        }
        if experiment.name.is_none() {
            experiment.name = experiment.id.clone();
        }
        if experiment.creator.is_none() {
            experiment.creator = Some(format!("galileo-{}", std::process::id()));
        }
        if experiment.created.is_none() {
            experiment.created = Some(util::timestamp());
        }

        Ok(experiment)
    }

    async fn finalize(&self, experiment: &mut Experiment, status: ExperimentStatus) {
        if let Err(e) = experiment.transition(status) {
            error!(error = %e, "refusing invalid terminal transition");
            return;
        }
        if let Err(e) = self.store.save_experiment(experiment).await {
            error!(error = %e, "failed to persist terminal experiment status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::SubstrateClusterController;
    use crate::experiment::model::WorkloadConfiguration;
    use crate::experiment::store::InMemoryExperimentStore;
    use crate::substrate::InMemorySubstrate;
    use crate::worker::api::{COMMANDS_TOPIC, Command};
    use std::collections::HashMap;

    fn configuration() -> ExperimentConfiguration {
        ExperimentConfiguration {
            duration: 0.1,
            interval: 0.05,
            workloads: vec![WorkloadConfiguration {
                service: "svc".to_string(),
                ticks: vec![2, 2],
                clients_per_host: 1,
                arrival_pattern: "constant".to_string(),
                client: None,
                client_parameters: HashMap::new(),
            }],
        }
    }

    #[tokio::test]
    async fn failed_run_still_finalizes_and_pauses_tracing() {
        let bus = EventBus::new(Arc::new(InMemorySubstrate::new()));
        let controller = Arc::new(SubstrateClusterController::new(bus.clone()));
        let store = Arc::new(InMemoryExperimentStore::new());
        let daemon = ExperimentDaemon::new(&bus, controller.clone(), store.clone());

        // One worker is registered but no daemon answers create_client, so
        // the run fails with a timeout
        controller
            .register_worker("w1", &HashMap::new())
            .await
            .unwrap();

        let mut commands = bus.subscribe::<Command>(COMMANDS_TOPIC).await.unwrap();

        let queued = QueuedExperiment {
            experiment: Experiment {
                id: Some("exp-fail".to_string()),
                ..Default::default()
            },
            configuration: configuration(),
        };
        daemon.process(queued).await;

        let experiment = store.find_experiment("exp-fail").await.unwrap().unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Failed);
        assert!(experiment.end.is_some());
        assert!(experiment.start.is_some());

        // StartTracing then PauseTracing must both have been broadcast
        let mut saw_start = false;
        let mut saw_pause = false;
        while let Ok(Some(command)) = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            commands.recv(),
        )
        .await
        {
            match command {
                Command::StartTracing => saw_start = true,
                Command::PauseTracing => {
                    assert!(saw_start, "pause before start");
                    saw_pause = true;
                }
                _ => {}
            }
        }
        assert!(saw_start && saw_pause);
    }

    #[tokio::test]
    async fn materialize_fills_missing_metadata() {
        let bus = EventBus::new(Arc::new(InMemorySubstrate::new()));
        let controller = Arc::new(SubstrateClusterController::new(bus.clone()));
        let store = Arc::new(InMemoryExperimentStore::new());
        let daemon = ExperimentDaemon::new(&bus, controller, store);

        let experiment = daemon
            .materialize(QueuedExperiment {
                experiment: Experiment::default(),
                configuration: configuration(),
            })
            .await
            .unwrap();

        assert!(experiment.id.is_some());
        assert_eq!(experiment.name, experiment.id);
        assert!(experiment.creator.as_deref().unwrap().starts_with("galileo-"));
        assert!(experiment.created.is_some());
    }

    #[tokio::test]
    async fn poison_stops_the_daemon() {
        let bus = EventBus::new(Arc::new(InMemorySubstrate::new()));
        let controller = Arc::new(SubstrateClusterController::new(bus.clone()));
        let store = Arc::new(InMemoryExperimentStore::new());
        let daemon = Arc::new(ExperimentDaemon::new(&bus, controller, store));

        daemon.close().await.unwrap();
        let result = daemon.run(CancellationToken::new()).await;
        assert!(result.is_ok());
    }
}
