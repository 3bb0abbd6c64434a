//! Runtime factory
//!
//! The explicit replacement for process-wide singletons: one [`Runtime`] is
//! built from configuration (usually the environment) and handed to every
//! component. It owns the substrate connection and knows how to construct
//! routers, trace writers, app loaders, and the worker context.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::apps::{AppLoader, DirectoryLoader, PluginRegistry, RepositoryClient, RepositoryFallbackLoader};
use crate::bus::EventBus;
use crate::controller::{ClusterController, SubstrateClusterController};
use crate::error::{GalileoError, Result};
use crate::experiment::{DatabaseTraceWriter, SqliteExperimentStore};
use crate::routing::{
    Balancer, CachingRoutingTable, DebugRouter, HostRouter, Router, RoutingTable, ServiceRouter,
    StaticRouter, SubstrateRoutingTable, WeightedRandomBalancer,
};
use crate::substrate::{InMemorySubstrate, RedisSubstrate, Substrate};
use crate::util;
use crate::worker::{
    CsvTraceWriter, NullTraceWriter, RouterFactory, SubstrateTraceWriter, TraceWriter,
    WorkerContext,
};

/// Which router a worker's clients use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouterType {
    StaticRouter,
    HostRouter,
    ServiceRouter,
    CachingHostRouter,
    #[default]
    CachingServiceRouter,
    DebugRouter,
}

impl std::str::FromStr for RouterType {
    type Err = GalileoError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "StaticRouter" => Ok(RouterType::StaticRouter),
            "HostRouter" => Ok(RouterType::HostRouter),
            "ServiceRouter" => Ok(RouterType::ServiceRouter),
            "CachingHostRouter" => Ok(RouterType::CachingHostRouter),
            "CachingServiceRouter" => Ok(RouterType::CachingServiceRouter),
            "DebugRouter" => Ok(RouterType::DebugRouter),
            other => Err(GalileoError::InvalidArgument(format!(
                "unknown router type {other}"
            ))),
        }
    }
}

/// Where flushed traces go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceSink {
    /// Discard traces.
    #[default]
    None,
    File,
    PubSub,
    Database,
}

impl std::str::FromStr for TraceSink {
    type Err = GalileoError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "" => Ok(TraceSink::None),
            "file" => Ok(TraceSink::File),
            "pubsub" => Ok(TraceSink::PubSub),
            "db" => Ok(TraceSink::Database),
            other => Err(GalileoError::InvalidArgument(format!(
                "unknown trace logging type {other}"
            ))),
        }
    }
}

/// Configuration consumed by [`Runtime`].
///
/// Environment variables, all optional:
///
/// - `GALILEO_REDIS_HOST` (localhost), `GALILEO_REDIS_PORT` (6379)
/// - `GALILEO_ROUTER_TYPE`: StaticRouter | HostRouter | ServiceRouter |
///   CachingHostRouter | CachingServiceRouter | DebugRouter
/// - `GALILEO_ROUTER_STATIC_HOST` (http://localhost)
/// - `GALILEO_TRACE_LOGGING`: file | pubsub | db
/// - `GALILEO_TRACE_DIR` (/tmp/galileo)
/// - `SQLITE_PATH` (/tmp/galileo.sqlite)
/// - `GALILEO_APPS_DIR` (./apps), `GALILEO_APPS_REPOSITORY`
///   (http://localhost:5001)
/// - `GALILEO_WORKER_NAME` (hostname)
/// - `GALILEO_WORKER_LABEL_<key>`: worker labels for placement
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub redis_host: String,
    pub redis_port: u16,
    pub router_type: RouterType,
    pub router_static_host: String,
    pub trace_sink: TraceSink,
    pub trace_dir: String,
    pub sqlite_path: String,
    pub apps_dir: String,
    pub apps_repository: String,
    pub worker_name: String,
    pub worker_labels: HashMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            router_type: RouterType::default(),
            router_static_host: "http://localhost".to_string(),
            trace_sink: TraceSink::default(),
            trace_dir: "/tmp/galileo".to_string(),
            sqlite_path: "/tmp/galileo.sqlite".to_string(),
            apps_dir: "./apps".to_string(),
            apps_repository: "http://localhost:5001".to_string(),
            worker_name: util::hostname(),
            worker_labels: HashMap::new(),
        }
    }
}

const LABEL_PREFIX: &str = "GALILEO_WORKER_LABEL_";

impl RuntimeConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("GALILEO_REDIS_HOST") {
            config.redis_host = host;
        }
        if let Ok(port) = std::env::var("GALILEO_REDIS_PORT") {
            config.redis_port = port.parse().map_err(|_| {
                GalileoError::InvalidArgument(format!("invalid redis port {port}"))
            })?;
        }
        if let Ok(router) = std::env::var("GALILEO_ROUTER_TYPE") {
            config.router_type = router.parse()?;
        }
        if let Ok(host) = std::env::var("GALILEO_ROUTER_STATIC_HOST") {
            config.router_static_host = host;
        }
        if let Ok(sink) = std::env::var("GALILEO_TRACE_LOGGING") {
            config.trace_sink = sink.parse()?;
        }
        if let Ok(dir) = std::env::var("GALILEO_TRACE_DIR") {
            config.trace_dir = dir;
        }
        if let Ok(path) = std::env::var("SQLITE_PATH") {
            config.sqlite_path = path;
        }
        if let Ok(dir) = std::env::var("GALILEO_APPS_DIR") {
            config.apps_dir = dir;
        }
        if let Ok(repo) = std::env::var("GALILEO_APPS_REPOSITORY") {
            config.apps_repository = repo;
        }
        if let Ok(name) = std::env::var("GALILEO_WORKER_NAME") {
            config.worker_name = name;
        }

        for (key, value) in std::env::vars() {
            if let Some(label) = key.strip_prefix(LABEL_PREFIX) {
                config
                    .worker_labels
                    .insert(label.to_lowercase(), value);
            }
        }

        Ok(config)
    }
}

/// A connected galileo runtime: substrate, event bus, and factories for
/// every component that depends on them.
pub struct Runtime {
    config: RuntimeConfig,
    substrate: Arc<dyn Substrate>,
    bus: EventBus,
    registry: Arc<PluginRegistry>,
}

impl Runtime {
    /// Connects to the configured redis substrate. An unreachable substrate
    /// is fatal; daemons exit non-zero instead of limping along.
    pub async fn connect(config: RuntimeConfig) -> Result<Self> {
        let substrate =
            Arc::new(RedisSubstrate::connect(&config.redis_host, config.redis_port).await?);
        debug!(host = %config.redis_host, port = config.redis_port, "runtime connected");
        Ok(Self::with_substrate(config, substrate))
    }

    /// Runtime over a process-local substrate, for tests and dry runs.
    pub fn in_memory(config: RuntimeConfig) -> Self {
        Self::with_substrate(config, Arc::new(InMemorySubstrate::new()))
    }

    pub fn with_substrate(config: RuntimeConfig, substrate: Arc<dyn Substrate>) -> Self {
        let bus = EventBus::new(substrate.clone());
        Self {
            config,
            substrate,
            bus,
            registry: Arc::new(PluginRegistry::with_builtins()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn substrate(&self) -> Arc<dyn Substrate> {
        self.substrate.clone()
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn registry(&self) -> Arc<PluginRegistry> {
        self.registry.clone()
    }

    pub fn cluster(&self) -> Arc<dyn ClusterController> {
        Arc::new(SubstrateClusterController::new(self.bus.clone()))
    }

    /// The authoritative routing table.
    pub fn routing_table(&self) -> Arc<dyn RoutingTable> {
        Arc::new(SubstrateRoutingTable::new(self.substrate.clone()))
    }

    async fn balancer(&self, caching: bool) -> Result<Arc<dyn Balancer>> {
        let table: Arc<dyn RoutingTable> = if caching {
            Arc::new(CachingRoutingTable::connect(self.substrate.clone()).await?)
        } else {
            Arc::new(SubstrateRoutingTable::new(self.substrate.clone()))
        };
        Ok(Arc::new(WeightedRandomBalancer::new(table)))
    }

    /// Builds a router of the configured type. Each call returns a fresh
    /// router; caching variants own their own update subscription.
    pub async fn create_router(&self) -> Result<Arc<dyn Router>> {
        let router: Arc<dyn Router> = match self.config.router_type {
            RouterType::StaticRouter => {
                Arc::new(StaticRouter::new(self.config.router_static_host.clone()))
            }
            RouterType::HostRouter => Arc::new(HostRouter::new(self.balancer(false).await?)),
            RouterType::ServiceRouter => {
                Arc::new(ServiceRouter::new(self.balancer(false).await?))
            }
            RouterType::CachingHostRouter => {
                Arc::new(HostRouter::new(self.balancer(true).await?))
            }
            RouterType::CachingServiceRouter => {
                Arc::new(ServiceRouter::new(self.balancer(true).await?))
            }
            RouterType::DebugRouter => Arc::new(DebugRouter::new(Some(self.balancer(true).await?))),
        };
        Ok(router)
    }

    pub fn create_app_loader(&self) -> Arc<dyn AppLoader> {
        let directory = DirectoryLoader::new(self.config.apps_dir.clone(), self.registry.clone());
        let repository = RepositoryClient::new(self.config.apps_repository.clone());
        Arc::new(RepositoryFallbackLoader::new(directory, repository))
    }

    pub async fn create_trace_writer(&self) -> Result<Arc<dyn TraceWriter>> {
        let writer: Arc<dyn TraceWriter> = match self.config.trace_sink {
            TraceSink::None => Arc::new(NullTraceWriter),
            TraceSink::File => Arc::new(CsvTraceWriter::create(
                self.config.trace_dir.clone(),
                &self.config.worker_name,
            )?),
            TraceSink::PubSub => Arc::new(SubstrateTraceWriter::new(self.substrate.clone())),
            TraceSink::Database => {
                let store = Arc::new(SqliteExperimentStore::open(&self.config.sqlite_path).await?);
                Arc::new(DatabaseTraceWriter::new(store))
            }
        };
        Ok(writer)
    }

    /// Assembles the full dependency set for a worker daemon.
    pub async fn worker_context(self: &Arc<Self>) -> Result<WorkerContext> {
        Ok(WorkerContext {
            name: self.config.worker_name.clone(),
            labels: self.config.worker_labels.clone(),
            bus: self.bus(),
            controller: self.cluster(),
            routers: self.clone(),
            apps: self.create_app_loader(),
            trace_writer: self.create_trace_writer().await?,
        })
    }
}

#[async_trait::async_trait]
impl RouterFactory for Runtime {
    async fn create_router(&self) -> Result<Arc<dyn Router>> {
        Runtime::create_router(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_type_parses_all_documented_values() {
        for raw in [
            "StaticRouter",
            "HostRouter",
            "ServiceRouter",
            "CachingHostRouter",
            "CachingServiceRouter",
            "DebugRouter",
        ] {
            assert!(raw.parse::<RouterType>().is_ok(), "{raw}");
        }
        assert!("SymmetryRouter".parse::<RouterType>().is_err());
    }

    #[test]
    fn trace_sink_parses_documented_values() {
        assert_eq!("file".parse::<TraceSink>().unwrap(), TraceSink::File);
        assert_eq!("pubsub".parse::<TraceSink>().unwrap(), TraceSink::PubSub);
        assert_eq!("db".parse::<TraceSink>().unwrap(), TraceSink::Database);
        assert!("mysql".parse::<TraceSink>().is_err());
    }

    #[tokio::test]
    async fn in_memory_runtime_builds_worker_context() {
        let runtime = Arc::new(Runtime::in_memory(RuntimeConfig {
            worker_name: "w-test".to_string(),
            ..Default::default()
        }));
        let context = runtime.worker_context().await.unwrap();
        assert_eq!(context.name, "w-test");
    }
}
