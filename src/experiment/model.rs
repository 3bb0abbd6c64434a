//! Experiment data model

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GalileoError, Result};
use crate::util;

/// Experiment lifecycle status. Transitions are monotone:
/// `QUEUED -> IN_PROGRESS -> {FINISHED, FAILED}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    #[default]
    Queued,
    InProgress,
    Finished,
    Failed,
}

impl ExperimentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExperimentStatus::Finished | ExperimentStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            ExperimentStatus::Queued => 0,
            ExperimentStatus::InProgress => 1,
            ExperimentStatus::Finished | ExperimentStatus::Failed => 2,
        }
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExperimentStatus::Queued => "QUEUED",
            ExperimentStatus::InProgress => "IN_PROGRESS",
            ExperimentStatus::Finished => "FINISHED",
            ExperimentStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A named, timed experiment run.
///
/// Metadata fields are optional at queue time; the experiment daemon fills
/// what is missing before running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    #[serde(default = "default_status")]
    pub status: ExperimentStatus,
}

fn default_status() -> ExperimentStatus {
    ExperimentStatus::Queued
}

impl Experiment {
    /// Advances the status; regressions are invalid, terminal states stamp
    /// `end`.
    pub fn transition(&mut self, to: ExperimentStatus) -> Result<()> {
        if to.rank() < self.status.rank() || (self.status.is_terminal() && to != self.status) {
            return Err(GalileoError::InvalidArgument(format!(
                "experiment status cannot move from {} to {}",
                self.status, to
            )));
        }
        self.status = to;
        if to.is_terminal() {
            self.end = Some(util::timestamp());
        }
        Ok(())
    }
}

/// Generates a timestamped experiment id with a random suffix.
pub fn generate_experiment_id() -> String {
    format!(
        "{}-{}",
        util::timestamp() as u64,
        &util::short_uuid()[..4]
    )
}

/// One workload inside an experiment: which service to load, the per-tick
/// service rates, and how clients are created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfiguration {
    pub service: String,
    /// Requests per second per tick for the whole service.
    pub ticks: Vec<u64>,
    /// How many clients each worker hosts for this workload.
    pub clients_per_host: u64,
    /// Interarrival pattern for the clients, `constant` or `expovariate`.
    #[serde(default = "default_arrival_pattern")]
    pub arrival_pattern: String,
    /// App the clients run; the built-in http app if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub client_parameters: HashMap<String, Value>,
}

fn default_arrival_pattern() -> String {
    "constant".to_string()
}

/// Timed schedule description for one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfiguration {
    /// Total duration in seconds.
    pub duration: f64,
    /// Tick length in seconds.
    pub interval: f64,
    pub workloads: Vec<WorkloadConfiguration>,
}

impl ExperimentConfiguration {
    /// Number of ticks: `ceil(duration / interval)`.
    pub fn ticks(&self) -> Result<usize> {
        if self.duration <= 0.0 || self.interval <= 0.0 {
            return Err(GalileoError::InvalidArgument(
                "duration and interval must be positive".to_string(),
            ));
        }
        let ticks = (self.duration / self.interval).ceil() as usize;
        for workload in &self.workloads {
            if workload.ticks.len() < ticks {
                return Err(GalileoError::InvalidArgument(format!(
                    "workload for '{}' provides {} ticks, schedule needs {}",
                    workload.service,
                    workload.ticks.len(),
                    ticks
                )));
            }
        }
        Ok(ticks)
    }
}

/// An experiment and its configuration, atomically enqueued together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedExperiment {
    pub experiment: Experiment,
    pub configuration: ExperimentConfiguration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotone() {
        let mut experiment = Experiment::default();
        assert_eq!(experiment.status, ExperimentStatus::Queued);

        experiment.transition(ExperimentStatus::InProgress).unwrap();
        experiment.transition(ExperimentStatus::Finished).unwrap();
        assert!(experiment.end.is_some());

        // Terminal states never transition back
        assert!(experiment.transition(ExperimentStatus::Queued).is_err());
        assert!(experiment.transition(ExperimentStatus::InProgress).is_err());
        assert!(experiment.transition(ExperimentStatus::Failed).is_err());
    }

    #[test]
    fn failed_is_reachable_from_queued() {
        let mut experiment = Experiment::default();
        experiment.transition(ExperimentStatus::Failed).unwrap();
        assert!(experiment.status.is_terminal());
    }

    #[test]
    fn ticks_rounds_up_and_validates() {
        let workload = WorkloadConfiguration {
            service: "svc".to_string(),
            ticks: vec![10, 10, 10],
            clients_per_host: 1,
            arrival_pattern: "constant".to_string(),
            client: None,
            client_parameters: HashMap::new(),
        };

        let config = ExperimentConfiguration {
            duration: 25.0,
            interval: 10.0,
            workloads: vec![workload.clone()],
        };
        assert_eq!(config.ticks().unwrap(), 3);

        let starved = ExperimentConfiguration {
            duration: 40.0,
            interval: 10.0,
            workloads: vec![workload],
        };
        assert!(starved.ticks().is_err());

        let degenerate = ExperimentConfiguration {
            duration: 0.0,
            interval: 10.0,
            workloads: vec![],
        };
        assert!(degenerate.ticks().is_err());
    }

    #[test]
    fn status_serializes_screaming() {
        let encoded = serde_json::to_string(&ExperimentStatus::InProgress).unwrap();
        assert_eq!(encoded, "\"IN_PROGRESS\"");
    }
}
