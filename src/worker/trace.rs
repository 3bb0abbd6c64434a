//! Trace logger
//!
//! Clients push one [`RequestTrace`] per request attempt into a bounded
//! channel; the logger task drains it, buffers, and flushes batches to a
//! pluggable [`TraceWriter`]. Control flow travels on the same channel as
//! dedicated [`TraceMessage`] variants, so a sentinel can never be mistaken
//! for a trace.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::Result;
use crate::substrate::Substrate;

/// Scored-set key traces are published under by the substrate writer.
pub const TRACES_KEY: &str = "galileo:results:traces";

/// CSV column header, written once per trace file.
pub const CSV_HEADER: [&str; 9] = [
    "request_id",
    "client",
    "service",
    "server",
    "created",
    "sent",
    "done",
    "status",
    "response",
];

/// Record of a single request attempt.
///
/// `status` is the HTTP status, or `-1` for a transport failure; `sent` is
/// `-1.0` when the request never made it onto the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTrace {
    pub request_id: String,
    pub client: String,
    pub service: String,
    pub server: String,
    pub created: f64,
    pub sent: f64,
    pub done: f64,
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl RequestTrace {
    /// Request duration in milliseconds.
    pub fn milliseconds(&self) -> f64 {
        (self.done - self.created) * 1000.0
    }

    fn csv_row(&self) -> [String; 9] {
        [
            self.request_id.clone(),
            self.client.clone(),
            self.service.clone(),
            self.server.clone(),
            format!("{:.7}", self.created),
            format!("{:.7}", self.sent),
            format!("{:.7}", self.done),
            self.status.to_string(),
            self.response.clone().unwrap_or_default(),
        ]
    }
}

/// Everything that can travel on the trace channel.
#[derive(Debug, Clone)]
pub enum TraceMessage {
    Trace(RequestTrace),
    /// Start accepting traces.
    Start,
    /// Stop accepting traces and flush what is buffered.
    Pause,
    /// Flush unconditionally.
    Flush,
    /// Flush, drain briefly, and exit.
    Poison,
}

/// Sink for flushed trace batches.
#[async_trait]
pub trait TraceWriter: Send + Sync {
    async fn write(&self, traces: &[RequestTrace]) -> Result<()>;
}

/// Discards all traces.
pub struct NullTraceWriter;

#[async_trait]
impl TraceWriter for NullTraceWriter {
    async fn write(&self, _traces: &[RequestTrace]) -> Result<()> {
        Ok(())
    }
}

/// Appends traces to `traces-{worker}.csv`, writing the header once.
pub struct CsvTraceWriter {
    path: PathBuf,
}

impl CsvTraceWriter {
    pub fn create(target_dir: impl Into<PathBuf>, worker_name: &str) -> Result<Self> {
        let target_dir = target_dir.into();
        std::fs::create_dir_all(&target_dir)?;
        let path = target_dir.join(format!("traces-{worker_name}.csv"));

        if !path.exists() {
            debug!(path = %path.display(), "initializing trace file with header");
            let mut writer = csv::Writer::from_path(&path)?;
            writer.write_record(CSV_HEADER)?;
            writer.flush()?;
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl TraceWriter for CsvTraceWriter {
    async fn write(&self, traces: &[RequestTrace]) -> Result<()> {
        let mut buffer = csv::Writer::from_writer(Vec::new());
        for trace in traces {
            buffer.write_record(trace.csv_row())?;
        }
        let encoded = buffer
            .into_inner()
            .map_err(|e| crate::error::GalileoError::Fatal(e.to_string()))?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
            file.write_all(&encoded)?;
            Ok(())
        })
        .await
        .map_err(|e| crate::error::GalileoError::Fatal(e.to_string()))?
    }
}

/// Publishes each trace as one scored entry in the substrate, score =
/// `created`, so consumers can page through results in time order.
pub struct SubstrateTraceWriter {
    substrate: Arc<dyn Substrate>,
}

impl SubstrateTraceWriter {
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self { substrate }
    }
}

#[async_trait]
impl TraceWriter for SubstrateTraceWriter {
    async fn write(&self, traces: &[RequestTrace]) -> Result<()> {
        for trace in traces {
            let value = trace.csv_row().join(",");
            self.substrate.zadd(TRACES_KEY, trace.created, &value).await?;
        }
        Ok(())
    }
}

/// Drains the trace channel into a writer.
pub struct TraceLogger {
    inbox: mpsc::Receiver<TraceMessage>,
    writer: Arc<dyn TraceWriter>,
    flush_interval: usize,
    running: bool,
    buffer: Vec<RequestTrace>,
}

/// How long the logger keeps draining after a poison arrives.
const DRAIN_WINDOW: Duration = Duration::from_secs(2);

impl TraceLogger {
    pub const DEFAULT_FLUSH_INTERVAL: usize = 20;

    pub fn new(inbox: mpsc::Receiver<TraceMessage>, writer: Arc<dyn TraceWriter>) -> Self {
        Self {
            inbox,
            writer,
            flush_interval: Self::DEFAULT_FLUSH_INTERVAL,
            running: true,
            buffer: Vec::new(),
        }
    }

    pub fn with_flush_interval(mut self, flush_interval: usize) -> Self {
        self.flush_interval = flush_interval.max(1);
        self
    }

    /// Runs until poisoned (plus the drain window) or the channel closes.
    pub async fn run(mut self) {
        let mut poisoned = false;

        loop {
            let message = if poisoned {
                match tokio::time::timeout(DRAIN_WINDOW, self.inbox.recv()).await {
                    Ok(message) => message,
                    Err(_) => {
                        debug!("drain window elapsed, exiting");
                        break;
                    }
                }
            } else {
                self.inbox.recv().await
            };

            let Some(message) = message else {
                debug!("trace channel closed, exiting");
                break;
            };

            match message {
                TraceMessage::Trace(trace) => {
                    if self.running {
                        self.buffer.push(trace);
                    }
                    if self.buffer.len() >= self.flush_interval {
                        debug!("flush interval reached, flushing buffer");
                        self.flush().await;
                    }
                }
                TraceMessage::Start => {
                    debug!("start received");
                    self.running = true;
                }
                TraceMessage::Pause => {
                    debug!("pause received, flushing remaining traces");
                    self.running = false;
                    self.flush().await;
                }
                TraceMessage::Flush => {
                    debug!("flush command received");
                    self.flush().await;
                }
                TraceMessage::Poison => {
                    debug!("poison received, draining");
                    self.flush().await;
                    poisoned = true;
                }
            }
        }

        self.flush().await;
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        debug!(traces = self.buffer.len(), "flushing trace buffer");
        if let Err(e) = self.writer.write(&self.buffer).await {
            error!(error = %e, "trace writer failed, dropping batch");
        }
        self.buffer.clear();
    }
}
