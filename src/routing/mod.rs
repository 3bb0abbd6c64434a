//! Service routing: the shared routing table, balancing policies, and the
//! routers that turn a [`ServiceRequest`](router::ServiceRequest) into an
//! HTTP call.

mod balancer;
mod router;
mod table;

pub use balancer::{Balancer, StaticHostBalancer, WeightedRandomBalancer, WeightedRoundRobinBalancer};
pub use router::{
    DebugRouter, HostRouter, RequestKwargs, Router, RouterResponse, ServiceRequest, ServiceRouter,
    StaticRouter,
};
pub use table::{
    CachingRoutingTable, RoutingRecord, RoutingTable, SubstrateRoutingTable, UPDATE_TOPIC,
};
