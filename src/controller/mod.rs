//! Controller-side components: the authoritative cluster view and the
//! experiment queue.

mod cluster;
mod experiment;

pub use cluster::{ClusterController, SubstrateClusterController, WORKERS_KEY};
pub use experiment::{EXPERIMENT_QUEUE_KEY, ExperimentController, ExperimentQueue};
