//! Worker-side components: the daemon, client tasks, request generation, and
//! trace logging.

pub mod api;
mod client;
mod daemon;
mod generator;
mod trace;

pub use client::Client;
pub use daemon::{FixedRouterFactory, RouterFactory, WorkerContext, WorkerDaemon, WorkerState};
pub use generator::{Generated, RequestFactory, RequestGenerator};
pub use trace::{
    CSV_HEADER, CsvTraceWriter, NullTraceWriter, RequestTrace, SubstrateTraceWriter, TRACES_KEY,
    TraceLogger, TraceMessage, TraceWriter,
};
