//! Wire types shared between workers, clients, and controllers
//!
//! Everything here travels as JSON over the event bus. Commands and events
//! are closed sum types; the dispatcher on each side pattern-matches the tag
//! and ignores variants addressed to someone else.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic carrying all broadcast commands.
pub const COMMANDS_TOPIC: &str = "galileo:commands";

/// Topic carrying all events.
pub const EVENTS_TOPIC: &str = "galileo:events";

/// RPC endpoint answered by every worker daemon.
pub const PING_ENDPOINT: &str = "WorkerDaemon.ping";

/// RPC endpoint of one worker's client factory.
pub fn create_client_endpoint(worker: &str) -> String {
    format!("WorkerDaemon.create_client:{worker}")
}

/// RPC endpoint answered by every client.
pub const CLIENT_INFO_ENDPOINT: &str = "Client.get_info";

/// Configuration for one client (or a group of identical clients).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub service: String,
    /// Name of the app producing requests; the built-in http app if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    /// Opaque parameters handed to the app.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, Value>,
    /// Label selector for placement; all entries must match a worker's labels.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub worker_labels: HashMap<String, String>,
}

impl ClientConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Default::default()
        }
    }
}

/// A placed client: its id, hosting worker, and configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientDescription {
    pub client_id: String,
    pub worker: String,
    pub config: ClientConfig,
}

/// Answer to [`CLIENT_INFO_ENDPOINT`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub description: ClientDescription,
    pub requests: u64,
    pub failed: u64,
}

/// How a client generates interarrival times.
///
/// `num` bounds the workload; `None` runs until stopped, `Some(0)` completes
/// immediately. The distribution samples *are* the interarrival seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num: Option<u64>,
    pub distribution: String,
    #[serde(default)]
    pub parameters: Vec<f64>,
}

impl WorkloadSpec {
    /// A constant-interarrival workload.
    pub fn constant(client_id: impl Into<String>, interarrival: f64, num: Option<u64>) -> Self {
        Self {
            client_id: client_id.into(),
            num,
            distribution: "constant".to_string(),
            parameters: vec![interarrival],
        }
    }

    /// Convenience for rate-based controllers: `rps` requests per second as a
    /// constant interarrival of `1/rps`.
    pub fn rps(client_id: impl Into<String>, rps: f64) -> Self {
        Self::constant(client_id, 1.0 / rps, None)
    }

    /// A named distribution applied with the given parameters.
    pub fn distribution(
        client_id: impl Into<String>,
        distribution: impl Into<String>,
        parameters: Vec<f64>,
        num: Option<u64>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            num,
            distribution: distribution.into(),
            parameters,
        }
    }
}

/// Broadcast commands consumed by workers and clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    RegisterWorker,
    StartTracing,
    PauseTracing,
    CreateClient(CreateClientCommand),
    CloseClient { client_id: String },
    SetWorkload(WorkloadSpec),
    StopWorkload { client_id: String },
}

/// Payload of [`Command::CreateClient`] and of the per-worker RPC endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateClientCommand {
    pub host: String,
    pub config: ClientConfig,
    #[serde(default = "default_num")]
    pub num: usize,
}

fn default_num() -> usize {
    1
}

/// Events published by workers and clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    RegisterWorker { name: String },
    UnregisterWorker { name: String },
    ClientStarted { client_id: String },
    ClientStopped { client_id: String },
    WorkloadDone { client_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_roundtrip_through_tagged_json() {
        let command = Command::CreateClient(CreateClientCommand {
            host: "w1".to_string(),
            config: ClientConfig::new("myservice"),
            num: 3,
        });

        let encoded = serde_json::to_string(&command).unwrap();
        assert!(encoded.contains("\"command\":\"create_client\""));
        let decoded: Command = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn workload_rps_maps_to_constant_interarrival() {
        let spec = WorkloadSpec::rps("c1", 20.0);
        assert_eq!(spec.distribution, "constant");
        assert_eq!(spec.parameters, vec![0.05]);
        assert_eq!(spec.num, None);
    }

    #[test]
    fn events_roundtrip_through_tagged_json() {
        let event = Event::WorkloadDone {
            client_id: "w:svc:0".to_string(),
        };
        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"event\":\"workload_done\""));
        assert_eq!(serde_json::from_str::<Event>(&encoded).unwrap(), event);
    }
}
