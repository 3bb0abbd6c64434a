//! Emulated client
//!
//! One client task owns one request generator and one router. It consumes
//! generated requests, dispatches them, and emits one trace per attempt.
//! Workload commands arrive over the event bus, filtered by client id; info
//! requests are answered on [`CLIENT_INFO_ENDPOINT`](crate::worker::api::CLIENT_INFO_ENDPOINT).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, RpcHandle, TypedSubscription};
use crate::error::Result;
use crate::routing::{Router, ServiceRequest};
use crate::util;
use crate::worker::api::{
    CLIENT_INFO_ENDPOINT, COMMANDS_TOPIC, ClientDescription, ClientInfo, Command, EVENTS_TOPIC,
    Event,
};
use crate::worker::generator::{Generated, RequestGenerator};
use crate::worker::trace::{RequestTrace, TraceMessage};
use crate::apps::AppClient;

/// A single emulated client bound to one [`ClientDescription`].
pub struct Client {
    description: ClientDescription,
    bus: EventBus,
    router: Arc<dyn Router>,
    generator: Arc<RequestGenerator>,
    traces: mpsc::Sender<TraceMessage>,
    requests: AtomicU64,
    failed: AtomicU64,
    request_prefix: String,
}

impl Client {
    pub fn new(
        description: ClientDescription,
        bus: EventBus,
        router: Arc<dyn Router>,
        mut app: AppClient,
        traces: mpsc::Sender<TraceMessage>,
    ) -> Arc<Self> {
        let service = description.config.service.clone();
        let generator = Arc::new(RequestGenerator::new(Box::new(move || {
            let request = app.next_request();
            ServiceRequest::new(service.clone(), request.endpoint)
                .with_method(request.method)
                .with_kwargs(request.kwargs)
        })));

        Arc::new(Self {
            description,
            bus,
            router,
            generator,
            traces,
            requests: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            request_prefix: util::short_uuid(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.description.client_id
    }

    pub fn generator(&self) -> Arc<RequestGenerator> {
        self.generator.clone()
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            description: self.description.clone(),
            requests: self.requests.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Installs the client's subscriptions and RPC endpoint, then spawns its
    /// main loop. By the time this returns, workload commands are delivered.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let commands = self.bus.subscribe::<Command>(COMMANDS_TOPIC).await?;

        let info_endpoint = {
            let client = self.clone();
            self.bus
                .expose(CLIENT_INFO_ENDPOINT, move |_: ()| {
                    let client = client.clone();
                    async move { client.info() }
                })
                .await?
        };

        self.publish_event(Event::ClientStarted {
            client_id: self.description.client_id.clone(),
        })
        .await;

        let client = self.clone();
        Ok(tokio::spawn(async move {
            client.run(shutdown, commands, info_endpoint).await;
        }))
    }

    /// Runs the client until cancelled or its generator closes.
    async fn run(
        self: Arc<Self>,
        shutdown: CancellationToken,
        commands: TypedSubscription<Command>,
        info_endpoint: RpcHandle,
    ) {
        let client_id = self.description.client_id.clone();
        info!(client_id = %client_id, "client starting");

        let command_listener = {
            let client = self.clone();
            let shutdown = shutdown.clone();
            let mut commands = commands;
            tokio::spawn(async move {
                loop {
                    let command = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        command = commands.recv() => match command {
                            Some(command) => command,
                            None => break,
                        },
                    };
                    client.handle_command(command);
                }
            })
        };

        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => break,
                item = self.generator.next() => item,
            };

            match item {
                None => break,
                Some(Generated::Done) => {
                    debug!(client_id = %client_id, "workload done");
                    self.publish_event(Event::WorkloadDone {
                        client_id: client_id.clone(),
                    })
                    .await;
                }
                Some(Generated::Request(request)) => {
                    self.execute(request).await;
                }
            }
        }

        command_listener.abort();
        drop(info_endpoint);
        self.publish_event(Event::ClientStopped {
            client_id: client_id.clone(),
        })
        .await;

        info!(client_id = %client_id, "client exiting");
    }

    fn handle_command(&self, command: Command) {
        match command {
            Command::SetWorkload(spec) if spec.client_id == self.description.client_id => {
                if let Err(e) = self.generator.set_workload(&spec) {
                    error!(client_id = %self.description.client_id, error = %e, "rejecting workload");
                }
            }
            Command::StopWorkload { client_id } if client_id == self.description.client_id => {
                self.generator.pause();
            }
            _ => {}
        }
    }

    async fn execute(&self, mut request: ServiceRequest) {
        let counter = self.requests.fetch_add(1, Ordering::Relaxed);
        let request_id = format!("{}:{}", self.request_prefix, counter);
        request.client_id = Some(self.description.client_id.clone());
        request.request_id = Some(request_id.clone());

        let trace = match self.router.request(&mut request).await {
            Ok(response) => RequestTrace {
                request_id,
                client: self.description.client_id.clone(),
                service: request.service.clone(),
                server: response.host,
                created: request.created,
                sent: request.sent.unwrap_or(-1.0),
                done: util::timestamp(),
                status: response.status,
                response: Some(response.body),
            },
            Err(e) => {
                warn!(client_id = %self.description.client_id, error = %e, "error while handling request");
                RequestTrace {
                    request_id,
                    client: self.description.client_id.clone(),
                    service: request.service.clone(),
                    server: "none".to_string(),
                    created: request.created,
                    sent: -1.0,
                    done: util::timestamp(),
                    status: -1,
                    response: None,
                }
            }
        };

        if trace.status < 0 || trace.status >= 300 {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        // Traces are best-effort: a full channel drops the trace
        let _ = self.traces.try_send(TraceMessage::Trace(trace));
    }

    async fn publish_event(&self, event: Event) {
        if let Err(e) = self.bus.publish(EVENTS_TOPIC, &event).await {
            warn!(error = %e, "failed to publish client event");
        }
    }
}
