//! Worker daemon
//!
//! The per-node supervisor: registers itself in the cluster, spawns and
//! supervises client tasks on command, runs the trace logger, and forwards
//! tracing start/pause into the trace channel. Shutdown drains clients first,
//! then the logger, then unregisters.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::apps::{AppClient, AppLoader};
use crate::bus::EventBus;
use crate::controller::ClusterController;
use crate::error::{GalileoError, Result};
use crate::routing::Router;
use crate::worker::api::{
    COMMANDS_TOPIC, ClientDescription, Command, CreateClientCommand, EVENTS_TOPIC, Event,
    PING_ENDPOINT, create_client_endpoint,
};
use crate::worker::client::Client;
use crate::worker::trace::{TraceLogger, TraceMessage, TraceWriter};

/// Capacity of the trace channel; clients drop traces once it is full.
const TRACE_CHANNEL_CAPACITY: usize = 16 * 1024;

/// How long to wait for a client task when closing it.
const CLIENT_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Registered,
    Running,
    Draining,
    Stopped,
}

/// Builds one router per spawned client.
#[async_trait::async_trait]
pub trait RouterFactory: Send + Sync {
    async fn create_router(&self) -> Result<Arc<dyn Router>>;
}

/// Router factory handing out one shared router, mainly for tests and the
/// debug configuration.
pub struct FixedRouterFactory {
    router: Arc<dyn Router>,
}

impl FixedRouterFactory {
    pub fn new(router: Arc<dyn Router>) -> Self {
        Self { router }
    }
}

#[async_trait::async_trait]
impl RouterFactory for FixedRouterFactory {
    async fn create_router(&self) -> Result<Arc<dyn Router>> {
        Ok(self.router.clone())
    }
}

/// Everything a worker daemon needs injected.
pub struct WorkerContext {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub bus: EventBus,
    pub controller: Arc<dyn ClusterController>,
    pub routers: Arc<dyn RouterFactory>,
    pub apps: Arc<dyn AppLoader>,
    pub trace_writer: Arc<dyn TraceWriter>,
}

struct ClientProcess {
    description: ClientDescription,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

struct WorkerInner {
    ctx: WorkerContext,
    trace_tx: mpsc::Sender<TraceMessage>,
    clients: DashMap<String, ClientProcess>,
    client_counter: AtomicU64,
    shutdown: CancellationToken,
    state_tx: watch::Sender<WorkerState>,
}

/// The worker daemon. Cheap to clone; all clones drive the same worker.
#[derive(Clone)]
pub struct WorkerDaemon {
    inner: Arc<WorkerInner>,
    trace_rx: Arc<std::sync::Mutex<Option<mpsc::Receiver<TraceMessage>>>>,
}

impl WorkerDaemon {
    pub fn new(ctx: WorkerContext) -> Self {
        let (trace_tx, trace_rx) = mpsc::channel(TRACE_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(WorkerState::Starting);

        Self {
            inner: Arc::new(WorkerInner {
                ctx,
                trace_tx,
                clients: DashMap::new(),
                client_counter: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                state_tx,
            }),
            trace_rx: Arc::new(std::sync::Mutex::new(Some(trace_rx))),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.ctx.name
    }

    /// Observe lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.inner.state_tx.subscribe()
    }

    /// Asks the daemon to shut down; `run` drains and returns.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    fn set_state(&self, state: WorkerState) {
        debug!(worker = %self.inner.ctx.name, ?state, "worker state transition");
        let _ = self.inner.state_tx.send(state);
        eprintln!("DEBUG set_state({:?}) -> borrow now = {:?} ptr={:?}", state, *self.inner.state_tx.borrow(), Arc::as_ptr(&self.inner));
    }

    /// Runs the daemon until `shutdown` is cancelled or [`close`](Self::close)
    /// is called. Registration failure against an unreachable substrate is
    /// fatal.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let name = inner.ctx.name.clone();

        let trace_rx = self
            .trace_rx
            .lock()
            .expect("trace receiver lock poisoned")
            .take()
            .ok_or_else(|| GalileoError::Fatal("worker daemon already ran".to_string()))?;
        let logger = TraceLogger::new(trace_rx, inner.ctx.trace_writer.clone());
        let logger_task = tokio::spawn(logger.run());

        let mut commands = inner.ctx.bus.subscribe::<Command>(COMMANDS_TOPIC).await?;

        self.register_worker().await?;
        self.set_state(WorkerState::Registered);

        let _ping = {
            let name = name.clone();
            inner
                .ctx
                .bus
                .expose(PING_ENDPOINT, move |_: ()| {
                    let name = name.clone();
                    async move { name }
                })
                .await?
        };

        let _create = {
            let daemon = self.clone();
            inner
                .ctx
                .bus
                .expose(
                    &create_client_endpoint(&name),
                    move |command: CreateClientCommand| {
                        let daemon = daemon.clone();
                        async move {
                            match daemon.create_client(command).await {
                                Ok(descriptions) => descriptions,
                                Err(e) => {
                                    error!(error = %e, "create_client failed");
                                    Vec::new()
                                }
                            }
                        }
                    },
                )
                .await?
        };

        self.set_state(WorkerState::Running);
        info!(worker = %name, "worker daemon running");

        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = inner.shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle_command(command).await;
        }

        self.set_state(WorkerState::Draining);
        info!(worker = %name, "worker daemon draining");

        self.close_clients().await;

        let _ = inner.trace_tx.send(TraceMessage::Poison).await;
        if let Err(e) = logger_task.await {
            warn!(error = %e, "trace logger task failed");
        }

        self.unregister_worker().await;
        self.set_state(WorkerState::Stopped);
        info!(worker = %name, "worker daemon exiting");
        Ok(())
    }

    async fn handle_command(&self, command: Command) {
        match command {
            Command::RegisterWorker => {
                info!(worker = %self.inner.ctx.name, "received registration command");
                if let Err(e) = self.register_worker().await {
                    error!(error = %e, "re-registration failed");
                }
            }
            Command::StartTracing => {
                info!("received start tracing command, tracing is activated");
                let _ = self.inner.trace_tx.send(TraceMessage::Start).await;
            }
            Command::PauseTracing => {
                info!("received pause tracing command, tracing is deactivated");
                let _ = self.inner.trace_tx.send(TraceMessage::Pause).await;
            }
            Command::CreateClient(command) => {
                if let Err(e) = self.create_client(command).await {
                    error!(error = %e, "create_client failed");
                }
            }
            Command::CloseClient { client_id } => {
                self.close_client(&client_id).await;
            }
            // Workload commands are handled by the clients themselves
            Command::SetWorkload(_) | Command::StopWorkload { .. } => {}
        }
    }

    /// Creates `num` clients for a [`CreateClientCommand`] addressed to this
    /// worker; commands for other hosts are ignored.
    pub async fn create_client(
        &self,
        command: CreateClientCommand,
    ) -> Result<Vec<ClientDescription>> {
        let inner = &self.inner;

        if command.host != inner.ctx.name {
            debug!(host = %command.host, "ignoring create_client sent to another worker");
            return Ok(Vec::new());
        }

        let mut descriptions = Vec::with_capacity(command.num);
        for _ in 0..command.num {
            let seq = inner.client_counter.fetch_add(1, Ordering::Relaxed);
            let client_id = format!(
                "{}:{}:{}",
                inner.ctx.name, command.config.service, seq
            );
            let description = ClientDescription {
                client_id: client_id.clone(),
                worker: inner.ctx.name.clone(),
                config: command.config.clone(),
            };
            info!(client_id = %client_id, "creating client");

            let app = match &command.config.client {
                Some(app_name) => {
                    inner
                        .ctx
                        .apps
                        .load(app_name, command.config.parameters.clone())
                        .await?
                }
                None => AppClient::http(command.config.parameters.clone()),
            };
            let router = inner.ctx.routers.create_router().await?;

            let client = Client::new(
                description.clone(),
                inner.ctx.bus.clone(),
                router,
                app,
                inner.trace_tx.clone(),
            );

            let child_shutdown = inner.shutdown.child_token();
            let handle = client.start(child_shutdown.clone()).await?;

            inner.clients.insert(
                client_id.clone(),
                ClientProcess {
                    description: description.clone(),
                    shutdown: child_shutdown,
                    handle,
                },
            );

            inner.ctx.controller.register_client(&description).await?;
            descriptions.push(description);
        }

        Ok(descriptions)
    }

    /// Stops one client, removes it from the registry, and joins its task.
    pub async fn close_client(&self, client_id: &str) {
        let Some((_, process)) = self.inner.clients.remove(client_id) else {
            return;
        };
        info!(client_id, "closing client");

        if let Err(e) = self.inner.ctx.controller.unregister_client(client_id).await {
            warn!(client_id, error = %e, "failed to unregister client");
        }

        process.shutdown.cancel();
        match tokio::time::timeout(CLIENT_JOIN_TIMEOUT, process.handle).await {
            Ok(_) => debug!(client_id, "client task joined"),
            Err(_) => warn!(client_id, "client task did not stop in time"),
        }
    }

    async fn close_clients(&self) {
        let ids: Vec<String> = self
            .inner
            .clients
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for client_id in ids {
            self.close_client(&client_id).await;
        }
    }

    /// Currently hosted clients.
    pub fn clients(&self) -> Vec<ClientDescription> {
        self.inner
            .clients
            .iter()
            .map(|entry| entry.value().description.clone())
            .collect()
    }

    async fn register_worker(&self) -> Result<()> {
        let inner = &self.inner;
        info!(worker = %inner.ctx.name, "registering worker");
        inner
            .ctx
            .controller
            .register_worker(&inner.ctx.name, &inner.ctx.labels)
            .await?;
        inner
            .ctx
            .bus
            .publish(
                EVENTS_TOPIC,
                &Event::RegisterWorker {
                    name: inner.ctx.name.clone(),
                },
            )
            .await?;
        Ok(())
    }

    async fn unregister_worker(&self) {
        let inner = &self.inner;
        info!(worker = %inner.ctx.name, "unregistering worker");
        if let Err(e) = inner.ctx.controller.unregister_worker(&inner.ctx.name).await {
            warn!(error = %e, "failed to unregister worker");
        }
        let _ = inner
            .ctx
            .bus
            .publish(
                EVENTS_TOPIC,
                &Event::UnregisterWorker {
                    name: inner.ctx.name.clone(),
                },
            )
            .await;
    }
}
