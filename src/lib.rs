//! # Galileo - Distributed Load Testing
//!
//! Galileo evaluates microservice deployments by driving them with emulated
//! clients from a fleet of workers. A controller commands the workers over a
//! shared coordination substrate; each worker hosts client tasks that pull
//! requests from pluggable apps and fire them at target services through a
//! configurable router consulting a shared routing table. Every request
//! produces a trace that a worker-local logger drains into a pluggable sink,
//! and an experiment daemon turns queued experiment configurations into
//! timed workload schedules against the cluster.
//!
//! ## Components
//!
//! - [`substrate`]: the shared key-value/pub-sub store everything builds on
//! - [`bus`]: typed publish/subscribe, RPC stubs, and durable queues
//! - [`routing`]: routing table, balancers, and HTTP routers
//! - [`apps`]: pluggable request-factory apps with a repository fallback
//! - [`worker`]: the worker daemon, client tasks, request generator, and
//!   trace logger
//! - [`controller`]: the authoritative cluster view and experiment queue
//! - [`experiment`]: experiment model, persistence, and the experiment
//!   daemon
//! - [`runtime`]: the environment-driven factory wiring it all together

pub mod apps;
pub mod bus;
pub mod controller;
pub mod error;
pub mod experiment;
pub mod routing;
pub mod runtime;
pub mod substrate;
pub mod util;
pub mod worker;

pub use crate::error::{GalileoError, Result};
pub use crate::runtime::{Runtime, RuntimeConfig};
