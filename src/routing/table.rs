//! Routing table
//!
//! The authoritative map `service -> (hosts, weights)` lives in the substrate
//! under `routing:*` keys. Every successful write announces the affected
//! service name on the [`UPDATE_TOPIC`] so caching tables can invalidate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{GalileoError, Result};
use crate::substrate::Substrate;

/// Topic carrying the name of each service whose routing record changed.
pub const UPDATE_TOPIC: &str = "routing:updates";

const SERVICES_KEY: &str = "routing:services";

fn hosts_key(service: &str) -> String {
    format!("routing:hosts:{service}")
}

fn weights_key(service: &str) -> String {
    format!("routing:weights:{service}")
}

/// One routing record: the weighted hosts serving a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub service: String,
    pub hosts: Vec<String>,
    pub weights: Vec<f64>,
}

impl RoutingRecord {
    pub fn new(
        service: impl Into<String>,
        hosts: Vec<String>,
        weights: Vec<f64>,
    ) -> Result<Self> {
        let record = Self {
            service: service.into(),
            hosts,
            weights,
        };
        record.validate()?;
        Ok(record)
    }

    fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(GalileoError::InvalidArgument(format!(
                "routing record for '{}' has no hosts",
                self.service
            )));
        }
        if self.hosts.len() != self.weights.len() {
            return Err(GalileoError::InvalidArgument(
                "the number of weights does not match the population".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read/write access to the shared routing table.
#[async_trait]
pub trait RoutingTable: Send + Sync + 'static {
    async fn list_services(&self) -> Result<Vec<String>>;

    /// Fails with `NotFound` if no record exists for the service.
    async fn get_routing(&self, service: &str) -> Result<Arc<RoutingRecord>>;

    async fn set_routing(&self, record: RoutingRecord) -> Result<()>;

    async fn remove_service(&self, service: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    async fn get_routes(&self) -> Result<Vec<Arc<RoutingRecord>>> {
        let mut records = Vec::new();
        for service in self.list_services().await? {
            records.push(self.get_routing(&service).await?);
        }
        Ok(records)
    }
}

/// Authoritative routing table over the substrate.
pub struct SubstrateRoutingTable {
    substrate: Arc<dyn Substrate>,
}

impl SubstrateRoutingTable {
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self { substrate }
    }
}

#[async_trait]
impl RoutingTable for SubstrateRoutingTable {
    async fn list_services(&self) -> Result<Vec<String>> {
        Ok(self.substrate.smembers(SERVICES_KEY).await?)
    }

    async fn get_routing(&self, service: &str) -> Result<Arc<RoutingRecord>> {
        let hosts = self.substrate.lrange(&hosts_key(service), 0, -1).await?;
        if hosts.is_empty() {
            return Err(GalileoError::NotFound(format!(
                "no routing record found for service '{service}'"
            )));
        }

        let weights = self
            .substrate
            .lrange(&weights_key(service), 0, -1)
            .await?
            .iter()
            .map(|w| w.parse::<f64>().unwrap_or(0.0))
            .collect();

        Ok(Arc::new(RoutingRecord {
            service: service.to_string(),
            hosts,
            weights,
        }))
    }

    async fn set_routing(&self, record: RoutingRecord) -> Result<()> {
        record.validate()?;

        let substrate = &self.substrate;
        substrate.del(&hosts_key(&record.service)).await?;
        substrate.del(&weights_key(&record.service)).await?;

        substrate.sadd(SERVICES_KEY, &record.service).await?;
        substrate
            .rpush(&hosts_key(&record.service), &record.hosts)
            .await?;
        let weights: Vec<String> = record.weights.iter().map(|w| w.to_string()).collect();
        substrate
            .rpush(&weights_key(&record.service), &weights)
            .await?;

        substrate.publish(UPDATE_TOPIC, &record.service).await?;
        debug!(service = %record.service, hosts = record.hosts.len(), "routing record updated");
        Ok(())
    }

    async fn remove_service(&self, service: &str) -> Result<()> {
        let substrate = &self.substrate;
        substrate.del(&hosts_key(service)).await?;
        substrate.del(&weights_key(service)).await?;
        substrate.srem(SERVICES_KEY, service).await?;
        substrate.publish(UPDATE_TOPIC, service).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        for service in self.list_services().await? {
            self.substrate.del(&hosts_key(&service)).await?;
            self.substrate.del(&weights_key(&service)).await?;
            self.substrate.publish(UPDATE_TOPIC, &service).await?;
        }
        self.substrate.del(SERVICES_KEY).await?;
        Ok(())
    }
}

struct CacheState {
    records: HashMap<String, Arc<RoutingRecord>>,
    services: Vec<String>,
}

/// Read-through caching view of the routing table.
///
/// Subscribes to [`UPDATE_TOPIC`] on construction; a notification invalidates
/// the cached record for the named service and refreshes the service list.
/// Reads miss the cache, load from the authoritative table under the table
/// lock, and populate it, so concurrent misses do not both hit the store.
pub struct CachingRoutingTable {
    inner: Arc<SubstrateRoutingTable>,
    state: Arc<Mutex<CacheState>>,
    listener: JoinHandle<()>,
}

impl CachingRoutingTable {
    pub async fn connect(substrate: Arc<dyn Substrate>) -> Result<Self> {
        let inner = Arc::new(SubstrateRoutingTable::new(substrate.clone()));
        let services = inner.list_services().await.unwrap_or_default();
        let state = Arc::new(Mutex::new(CacheState {
            records: HashMap::new(),
            services,
        }));

        let mut updates = substrate.subscribe(UPDATE_TOPIC).await?;
        let listener = {
            let inner = inner.clone();
            let state = state.clone();
            tokio::spawn(async move {
                while let Some(service) = updates.recv().await {
                    debug!(service = %service, "received routing table update");

                    let services = match inner.list_services().await {
                        Ok(services) => services,
                        Err(e) => {
                            warn!(error = %e, "failed to refresh service list");
                            continue;
                        }
                    };

                    let mut state = state.lock().await;
                    state.records.remove(&service);
                    state.services = services;
                }
            })
        };

        Ok(Self {
            inner,
            state,
            listener,
        })
    }
}

impl Drop for CachingRoutingTable {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl RoutingTable for CachingRoutingTable {
    async fn list_services(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().await.services.clone())
    }

    async fn get_routing(&self, service: &str) -> Result<Arc<RoutingRecord>> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.records.get(service) {
            return Ok(record.clone());
        }

        // Miss-load while holding the table lock
        let record = self.inner.get_routing(service).await?;
        state.records.insert(service.to_string(), record.clone());
        debug!(service, "loaded routing record into cache");
        Ok(record)
    }

    async fn set_routing(&self, _record: RoutingRecord) -> Result<()> {
        Err(GalileoError::InvalidArgument(
            "caching routing table is read-only".to_string(),
        ))
    }

    async fn remove_service(&self, _service: &str) -> Result<()> {
        Err(GalileoError::InvalidArgument(
            "caching routing table is read-only".to_string(),
        ))
    }

    async fn clear(&self) -> Result<()> {
        Err(GalileoError::InvalidArgument(
            "caching routing table is read-only".to_string(),
        ))
    }
}
