//! Experiment queue and the controller-side API for queueing and cancelling
//! experiments.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::bus::{EventBus, Queue};
use crate::controller::ClusterController;
use crate::error::{GalileoError, Result};
use crate::experiment::model::{Experiment, ExperimentConfiguration, QueuedExperiment};

/// Substrate list holding queued experiments, consumed from the left.
pub const EXPERIMENT_QUEUE_KEY: &str = "galileo:experiments:queue";

const POISON: &str = "__POISON__";

/// The shared experiment queue.
///
/// Entries are [`QueuedExperiment`] documents plus a poison marker the
/// daemon uses to stop consuming. Cancellation is the transactional
/// `remove` on the underlying queue.
pub struct ExperimentQueue {
    queue: Queue<Value>,
}

impl ExperimentQueue {
    pub fn new(bus: &EventBus) -> Self {
        Self {
            queue: bus.queue(EXPERIMENT_QUEUE_KEY),
        }
    }

    pub async fn put(&self, item: &QueuedExperiment) -> Result<()> {
        self.queue.put(&serde_json::to_value(item)?).await
    }

    /// Asks the consuming daemon to exit.
    pub async fn put_poison(&self) -> Result<()> {
        self.queue.put(&Value::String(POISON.to_string())).await
    }

    /// Blocks for the next entry; `None` is the poison marker.
    pub async fn get(&self) -> Result<Option<QueuedExperiment>> {
        let value = self.queue.get().await?;
        if value.as_str() == Some(POISON) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    pub async fn qsize(&self) -> Result<u64> {
        self.queue.qsize().await
    }

    /// Removes the queued experiment with the given id before the daemon
    /// consumes it. Returns whether anything was removed; persistent write
    /// contention surfaces as [`GalileoError::Cancel`].
    pub async fn remove(&self, experiment_id: &str) -> Result<bool> {
        self.queue
            .remove_where(|value| {
                serde_json::from_value::<QueuedExperiment>(value.clone())
                    .map(|queued| queued.experiment.id.as_deref() == Some(experiment_id))
                    .unwrap_or(false)
            })
            .await
    }
}

/// Controller-side experiment API: enqueue and cancel.
pub struct ExperimentController {
    cluster: Arc<dyn ClusterController>,
    queue: ExperimentQueue,
}

impl ExperimentController {
    pub fn new(bus: &EventBus, cluster: Arc<dyn ClusterController>) -> Self {
        Self {
            cluster,
            queue: ExperimentQueue::new(bus),
        }
    }

    /// Queues an experiment for the experiment daemon. The experiment
    /// metadata is optional; missing fields are generated by the daemon.
    pub async fn queue(
        &self,
        configuration: ExperimentConfiguration,
        experiment: Option<Experiment>,
    ) -> Result<()> {
        if self.cluster.list_workers(None).await?.is_empty() {
            return Err(GalileoError::InvalidArgument(
                "no workers to execute the experiment on".to_string(),
            ));
        }

        let item = QueuedExperiment {
            experiment: experiment.unwrap_or_default(),
            configuration,
        };
        debug!(?item, "queuing experiment");
        self.queue.put(&item).await
    }

    /// Cancels a not-yet-started experiment. Returns false if it is no
    /// longer queued.
    pub async fn cancel(&self, experiment_id: &str) -> Result<bool> {
        self.queue.remove(experiment_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::model::WorkloadConfiguration;
    use crate::substrate::InMemorySubstrate;

    fn queued(id: &str) -> QueuedExperiment {
        QueuedExperiment {
            experiment: Experiment {
                id: Some(id.to_string()),
                ..Default::default()
            },
            configuration: ExperimentConfiguration {
                duration: 10.0,
                interval: 5.0,
                workloads: vec![WorkloadConfiguration {
                    service: "svc".to_string(),
                    ticks: vec![1, 1],
                    clients_per_host: 1,
                    arrival_pattern: "constant".to_string(),
                    client: None,
                    client_parameters: Default::default(),
                }],
            },
        }
    }

    #[tokio::test]
    async fn cancel_removes_exactly_the_matching_experiment() {
        let bus = EventBus::new(Arc::new(InMemorySubstrate::new()));
        let queue = ExperimentQueue::new(&bus);

        queue.put(&queued("abcd")).await.unwrap();
        queue.put(&queued("abcdef")).await.unwrap();

        assert!(queue.remove("abcd").await.unwrap());
        assert_eq!(queue.qsize().await.unwrap(), 1);
        // A second cancel finds nothing
        assert!(!queue.remove("abcd").await.unwrap());

        let remaining = queue.get().await.unwrap().unwrap();
        assert_eq!(remaining.experiment.id.as_deref(), Some("abcdef"));
    }

    #[tokio::test]
    async fn poison_marker_is_distinguishable() {
        let bus = EventBus::new(Arc::new(InMemorySubstrate::new()));
        let queue = ExperimentQueue::new(&bus);

        queue.put(&queued("e1")).await.unwrap();
        queue.put_poison().await.unwrap();

        assert!(queue.get().await.unwrap().is_some());
        assert!(queue.get().await.unwrap().is_none());
    }
}
