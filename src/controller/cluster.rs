//! Cluster controller
//!
//! The authoritative view of workers and clients in the substrate: worker
//! membership, per-worker client sets, serialized client documents, and the
//! commands that fan out to workers. Placement packs new clients onto the
//! least-loaded candidates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::error::{GalileoError, Result};
use crate::substrate::Substrate;
use crate::worker::api::{
    COMMANDS_TOPIC, ClientConfig, ClientDescription, Command, CreateClientCommand, PING_ENDPOINT,
    WorkloadSpec, create_client_endpoint,
};

/// Set of alive worker names.
pub const WORKERS_KEY: &str = "galileo:workers";

const PING_TIMEOUT: Duration = Duration::from_secs(2);
const CREATE_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

fn worker_clients_key(worker: &str) -> String {
    format!("galileo:worker:{worker}:clients")
}

fn client_key(client_id: &str) -> String {
    format!("galileo:client:{client_id}")
}

/// Registration, discovery, placement, and broadcast commands for the
/// worker fleet.
#[async_trait]
pub trait ClusterController: Send + Sync + 'static {
    /// Each live worker answers with its name at most once within the
    /// timeout.
    async fn ping(&self) -> Result<Vec<String>>;

    /// Drops stale membership state and asks all live workers to re-register.
    async fn discover(&self) -> Result<()>;

    async fn register_worker(&self, name: &str, labels: &HashMap<String, String>) -> Result<()>;

    async fn unregister_worker(&self, name: &str) -> Result<()>;

    /// All worker names, or those matching an anchored regular expression.
    async fn list_workers(&self, pattern: Option<&str>) -> Result<Vec<String>>;

    async fn list_workers_info(
        &self,
        pattern: Option<&str>,
    ) -> Result<Vec<(String, HashMap<String, String>)>>;

    async fn register_client(&self, client: &ClientDescription) -> Result<()>;

    async fn unregister_client(&self, client_id: &str) -> Result<()>;

    async fn list_clients(&self, worker: Option<&str>) -> Result<Vec<ClientDescription>>;

    async fn get_client_description(&self, client_id: &str) -> Result<Option<ClientDescription>>;

    /// Creates `num` clients on one specific worker via its RPC endpoint.
    async fn create_client(
        &self,
        host: &str,
        config: &ClientConfig,
        num: usize,
    ) -> Result<Vec<ClientDescription>>;

    /// Places `num` clients across the fleet: filters workers by the config's
    /// label selector, then packs onto the least-loaded candidates.
    async fn create_clients(
        &self,
        config: &ClientConfig,
        num: usize,
    ) -> Result<Vec<ClientDescription>>;

    async fn close_client(&self, client_id: &str) -> Result<()>;

    async fn start_tracing(&self) -> Result<()>;

    async fn stop_tracing(&self) -> Result<()>;

    async fn set_workload(&self, spec: WorkloadSpec) -> Result<()>;

    /// Constant-distribution convenience: `rps` requests per second.
    async fn set_rps(&self, client_id: &str, rps: f64) -> Result<()> {
        self.set_workload(WorkloadSpec::rps(client_id, rps)).await
    }

    async fn stop_workload(&self, client_id: &str) -> Result<()>;
}

/// Cluster controller over the substrate and event bus.
pub struct SubstrateClusterController {
    substrate: Arc<dyn Substrate>,
    bus: EventBus,
}

impl SubstrateClusterController {
    pub fn new(bus: EventBus) -> Self {
        Self {
            substrate: bus.substrate(),
            bus,
        }
    }

    async fn publish_command(&self, command: Command) -> Result<()> {
        self.bus.publish(COMMANDS_TOPIC, &command).await
    }

    /// Greedy best-fit: repeatedly assign to the candidate with the fewest
    /// clients, ties resolved in candidate order.
    fn pack(candidates: &[(String, u64)], num: usize) -> Vec<(String, usize)> {
        let mut loads: Vec<(String, u64, usize)> = candidates
            .iter()
            .map(|(name, count)| (name.clone(), *count, 0usize))
            .collect();

        for _ in 0..num {
            let min = loads
                .iter_mut()
                .min_by_key(|(_, count, assigned)| *count + *assigned as u64)
                .expect("candidate set is non-empty");
            min.2 += 1;
        }

        loads
            .into_iter()
            .filter(|(_, _, assigned)| *assigned > 0)
            .map(|(name, _, assigned)| (name, assigned))
            .collect()
    }
}

#[async_trait]
impl ClusterController for SubstrateClusterController {
    async fn ping(&self) -> Result<Vec<String>> {
        let stub = self.bus.stub::<(), String>(PING_ENDPOINT, PING_TIMEOUT);
        stub.call_multi(&()).await
    }

    async fn discover(&self) -> Result<()> {
        for worker in self.list_workers(None).await? {
            self.substrate.del(&worker_clients_key(&worker)).await?;
        }
        self.substrate.del(WORKERS_KEY).await?;
        self.publish_command(Command::RegisterWorker).await
    }

    async fn register_worker(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        info!(worker = name, "registering worker");
        self.substrate.sadd(WORKERS_KEY, name).await?;
        if !labels.is_empty() {
            self.substrate.hset_all(name, labels).await?;
        }
        Ok(())
    }

    async fn unregister_worker(&self, name: &str) -> Result<()> {
        info!(worker = name, "unregistering worker");
        self.substrate.srem(WORKERS_KEY, name).await?;
        self.substrate.del(&worker_clients_key(name)).await?;
        Ok(())
    }

    async fn list_workers(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let workers = self.substrate.smembers(WORKERS_KEY).await?;

        let Some(pattern) = pattern.filter(|p| !p.is_empty()) else {
            return Ok(workers);
        };

        let regex = regex::Regex::new(&format!("^{pattern}$")).map_err(|e| {
            GalileoError::InvalidArgument(format!("invalid pattern {pattern}: {e}"))
        })?;
        Ok(workers
            .into_iter()
            .filter(|worker| regex.is_match(worker))
            .collect())
    }

    async fn list_workers_info(
        &self,
        pattern: Option<&str>,
    ) -> Result<Vec<(String, HashMap<String, String>)>> {
        let mut infos = Vec::new();
        for worker in self.list_workers(pattern).await? {
            let labels = self.substrate.hgetall(&worker).await?;
            infos.push((worker, labels));
        }
        Ok(infos)
    }

    async fn register_client(&self, client: &ClientDescription) -> Result<()> {
        self.substrate
            .sadd(&worker_clients_key(&client.worker), &client.client_id)
            .await?;
        let document = serde_json::to_string(client)?;
        self.substrate
            .set(&client_key(&client.client_id), &document)
            .await?;
        Ok(())
    }

    async fn unregister_client(&self, client_id: &str) -> Result<()> {
        let Some(client) = self.get_client_description(client_id).await? else {
            return Ok(());
        };

        self.substrate.del(&client_key(client_id)).await?;
        self.substrate
            .srem(&worker_clients_key(&client.worker), client_id)
            .await?;
        Ok(())
    }

    async fn list_clients(&self, worker: Option<&str>) -> Result<Vec<ClientDescription>> {
        let client_ids = match worker {
            Some(worker) => self.substrate.smembers(&worker_clients_key(worker)).await?,
            None => {
                let keys = self.substrate.keys(&worker_clients_key("*")).await?;
                if keys.is_empty() {
                    return Ok(Vec::new());
                }
                self.substrate.sunion(&keys).await?
            }
        };

        if client_ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = client_ids.iter().map(|id| client_key(id)).collect();
        let documents = self.substrate.mget(&keys).await?;

        Ok(documents
            .into_iter()
            .flatten()
            .filter_map(|document| match serde_json::from_str(&document) {
                Ok(description) => Some(description),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable client document");
                    None
                }
            })
            .collect())
    }

    async fn get_client_description(&self, client_id: &str) -> Result<Option<ClientDescription>> {
        let Some(document) = self.substrate.get(&client_key(client_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&document)?))
    }

    async fn create_client(
        &self,
        host: &str,
        config: &ClientConfig,
        num: usize,
    ) -> Result<Vec<ClientDescription>> {
        let command = CreateClientCommand {
            host: host.to_string(),
            config: config.clone(),
            num,
        };
        let stub = self
            .bus
            .stub::<CreateClientCommand, Vec<ClientDescription>>(
                &create_client_endpoint(host),
                CREATE_CLIENT_TIMEOUT,
            );
        stub.call(&command).await
    }

    async fn create_clients(
        &self,
        config: &ClientConfig,
        num: usize,
    ) -> Result<Vec<ClientDescription>> {
        let mut candidates = Vec::new();
        for worker in self.list_workers(None).await? {
            let labels = self.substrate.hgetall(&worker).await?;
            let matches = config
                .worker_labels
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value));
            if !matches {
                continue;
            }
            let load = self.substrate.scard(&worker_clients_key(&worker)).await?;
            candidates.push((worker, load));
        }

        if candidates.is_empty() {
            return Err(GalileoError::NoCandidate);
        }

        let placement = Self::pack(&candidates, num);
        debug!(?placement, "packed client placement");

        let mut clients = Vec::with_capacity(num);
        for (worker, count) in placement {
            let created = self.create_client(&worker, config, count).await?;
            clients.extend(created);
        }
        Ok(clients)
    }

    async fn close_client(&self, client_id: &str) -> Result<()> {
        self.publish_command(Command::CloseClient {
            client_id: client_id.to_string(),
        })
        .await
    }

    async fn start_tracing(&self) -> Result<()> {
        self.publish_command(Command::StartTracing).await
    }

    async fn stop_tracing(&self) -> Result<()> {
        self.publish_command(Command::PauseTracing).await
    }

    async fn set_workload(&self, spec: WorkloadSpec) -> Result<()> {
        self.publish_command(Command::SetWorkload(spec)).await
    }

    async fn stop_workload(&self, client_id: &str) -> Result<()> {
        self.publish_command(Command::StopWorkload {
            client_id: client_id.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::InMemorySubstrate;

    fn controller() -> SubstrateClusterController {
        SubstrateClusterController::new(EventBus::new(Arc::new(InMemorySubstrate::new())))
    }

    fn description(worker: &str, client_id: &str) -> ClientDescription {
        ClientDescription {
            client_id: client_id.to_string(),
            worker: worker.to_string(),
            config: ClientConfig::new("svc"),
        }
    }

    #[tokio::test]
    async fn register_worker_is_idempotent() {
        let ctrl = controller();
        let labels = HashMap::new();
        ctrl.register_worker("w1", &labels).await.unwrap();
        ctrl.register_worker("w1", &labels).await.unwrap();

        assert_eq!(ctrl.list_workers(None).await.unwrap(), vec!["w1"]);
    }

    #[tokio::test]
    async fn unregister_worker_drops_client_set() {
        let ctrl = controller();
        ctrl.register_worker("w1", &HashMap::new()).await.unwrap();
        ctrl.register_client(&description("w1", "w1:svc:0"))
            .await
            .unwrap();

        ctrl.unregister_worker("w1").await.unwrap();

        assert!(ctrl.list_workers(None).await.unwrap().is_empty());
        assert!(ctrl.list_clients(Some("w1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_workers_applies_anchored_pattern() {
        let ctrl = controller();
        for name in ["pico1", "pico2", "nuc1"] {
            ctrl.register_worker(name, &HashMap::new()).await.unwrap();
        }

        let mut picos = ctrl.list_workers(Some("pico[0-9]")).await.unwrap();
        picos.sort();
        assert_eq!(picos, vec!["pico1", "pico2"]);

        // Anchoring: a substring match is not enough
        assert!(ctrl.list_workers(Some("pico")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_workers_rejects_bad_pattern() {
        let ctrl = controller();
        let result = ctrl.list_workers(Some("pico[")).await;
        assert!(matches!(result, Err(GalileoError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn client_registration_roundtrips_description() {
        let ctrl = controller();
        let original = description("w1", "w1:svc:0");
        ctrl.register_client(&original).await.unwrap();

        let loaded = ctrl
            .get_client_description("w1:svc:0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, original);

        let listed = ctrl.list_clients(Some("w1")).await.unwrap();
        assert_eq!(listed, vec![original.clone()]);

        // union across workers
        ctrl.register_client(&description("w2", "w2:svc:0"))
            .await
            .unwrap();
        let all = ctrl.list_clients(None).await.unwrap();
        assert_eq!(all.len(), 2);

        ctrl.unregister_client("w1:svc:0").await.unwrap();
        assert!(ctrl.get_client_description("w1:svc:0").await.unwrap().is_none());
        assert!(ctrl.list_clients(Some("w1")).await.unwrap().is_empty());
    }

    #[test]
    fn pack_balances_under_skew() {
        let candidates = vec![
            ("a".to_string(), 5u64),
            ("b".to_string(), 2u64),
            ("c".to_string(), 1u64),
        ];
        let mut placement = SubstrateClusterController::pack(&candidates, 5);
        placement.sort();
        assert_eq!(
            placement,
            vec![("b".to_string(), 2usize), ("c".to_string(), 3usize)]
        );
    }

    #[test]
    fn pack_spreads_evenly_from_equal_loads() {
        let candidates = vec![
            ("a".to_string(), 0u64),
            ("b".to_string(), 0u64),
            ("c".to_string(), 0u64),
        ];
        let mut placement = SubstrateClusterController::pack(&candidates, 6);
        placement.sort();
        assert_eq!(
            placement,
            vec![
                ("a".to_string(), 2usize),
                ("b".to_string(), 2usize),
                ("c".to_string(), 2usize)
            ]
        );
    }

    #[tokio::test]
    async fn create_clients_without_candidates_fails() {
        let ctrl = controller();
        let result = ctrl.create_clients(&ClientConfig::new("svc"), 3).await;
        assert!(matches!(result, Err(GalileoError::NoCandidate)));
    }

    #[tokio::test]
    async fn create_clients_filters_by_labels() {
        let ctrl = controller();
        ctrl.register_worker("cpu", &HashMap::from([("arch".to_string(), "x86".to_string())]))
            .await
            .unwrap();
        ctrl.register_worker("arm", &HashMap::from([("arch".to_string(), "aarch64".to_string())]))
            .await
            .unwrap();

        let mut config = ClientConfig::new("svc");
        config
            .worker_labels
            .insert("arch".to_string(), "riscv".to_string());

        let result = ctrl.create_clients(&config, 1).await;
        assert!(matches!(result, Err(GalileoError::NoCandidate)));
    }
}
