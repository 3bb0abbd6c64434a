//! Balancing policies over routing records

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::distr::weighted::WeightedIndex;
use rand::prelude::Distribution;

use crate::error::{GalileoError, Result};
use crate::routing::table::{RoutingRecord, RoutingTable};

/// Stateful policy yielding the next host for a service.
#[async_trait]
pub trait Balancer: Send + Sync {
    async fn next_host(&self, service: &str) -> Result<String>;
}

/// Always returns the same host, regardless of service.
pub struct StaticHostBalancer {
    host: String,
}

impl StaticHostBalancer {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait]
impl Balancer for StaticHostBalancer {
    async fn next_host(&self, _service: &str) -> Result<String> {
        Ok(self.host.clone())
    }
}

/// Picks host `i` with probability `w_i / sum(w)`.
pub struct WeightedRandomBalancer {
    table: Arc<dyn RoutingTable>,
}

impl WeightedRandomBalancer {
    pub fn new(table: Arc<dyn RoutingTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Balancer for WeightedRandomBalancer {
    async fn next_host(&self, service: &str) -> Result<String> {
        let record = self.table.get_routing(service).await?;
        let index = WeightedIndex::new(record.weights.iter().copied()).map_err(|e| {
            GalileoError::InvalidArgument(format!(
                "unusable weights for service '{service}': {e}"
            ))
        })?;
        let pick = index.sample(&mut rand::rng());
        Ok(record.hosts[pick].clone())
    }
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn gcd_all(weights: &[i64]) -> i64 {
    weights.iter().copied().fold(0, gcd)
}

struct WrrState {
    hosts: Vec<String>,
    weights: Vec<i64>,
    index: isize,
    current_weight: i64,
}

impl WrrState {
    fn new(record: &RoutingRecord) -> Self {
        Self {
            hosts: record.hosts.clone(),
            weights: record.weights.iter().map(|w| *w as i64).collect(),
            index: -1,
            current_weight: 0,
        }
    }

    /// Adopts a changed routing record, resetting the position when it no
    /// longer fits the new bounds.
    fn sync(&mut self, record: &RoutingRecord) {
        let weights: Vec<i64> = record.weights.iter().map(|w| *w as i64).collect();
        if self.hosts == record.hosts && self.weights == weights {
            return;
        }
        self.hosts = record.hosts.clone();
        self.weights = weights;
        if self.index >= self.hosts.len() as isize {
            self.index = -1;
        }
        self.current_weight = 0;
    }

    fn advance(&mut self) -> Result<String> {
        let n = self.hosts.len() as isize;
        loop {
            self.index = (self.index + 1) % n;
            if self.index == 0 {
                self.current_weight -= gcd_all(&self.weights);
                if self.current_weight <= 0 {
                    self.current_weight = self.weights.iter().copied().max().unwrap_or(0);
                    if self.current_weight == 0 {
                        return Err(GalileoError::InvalidArgument(
                            "all weights are zero".to_string(),
                        ));
                    }
                }
            }
            if self.weights[self.index as usize] >= self.current_weight {
                return Ok(self.hosts[self.index as usize].clone());
            }
        }
    }
}

/// Weighted round-robin scheduling as done by the Linux Virtual Server.
///
/// Keeps `(index, current_weight)` per service; hosts with larger weights are
/// visited proportionally more often, ties resolved in record order.
pub struct WeightedRoundRobinBalancer {
    table: Arc<dyn RoutingTable>,
    states: DashMap<String, WrrState>,
}

impl WeightedRoundRobinBalancer {
    pub fn new(table: Arc<dyn RoutingTable>) -> Self {
        Self {
            table,
            states: DashMap::new(),
        }
    }
}

#[async_trait]
impl Balancer for WeightedRoundRobinBalancer {
    async fn next_host(&self, service: &str) -> Result<String> {
        let record = self.table.get_routing(service).await?;

        let mut state = self
            .states
            .entry(service.to_string())
            .or_insert_with(|| WrrState::new(&record));
        state.sync(&record);
        state.advance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::table::{RoutingTable, SubstrateRoutingTable};
    use crate::substrate::InMemorySubstrate;

    async fn table_with(service: &str, hosts: &[&str], weights: &[f64]) -> Arc<dyn RoutingTable> {
        let table = Arc::new(SubstrateRoutingTable::new(Arc::new(
            InMemorySubstrate::new(),
        )));
        table
            .set_routing(
                RoutingRecord::new(
                    service,
                    hosts.iter().map(|h| h.to_string()).collect(),
                    weights.to_vec(),
                )
                .unwrap(),
            )
            .await
            .unwrap();
        table
    }

    #[tokio::test]
    async fn static_balancer_ignores_service() {
        let balancer = StaticHostBalancer::new("localhost:8080");
        assert_eq!(balancer.next_host("any").await.unwrap(), "localhost:8080");
    }

    #[tokio::test]
    async fn weighted_random_never_picks_zero_weight_host() {
        let table = table_with("svc", &["dead", "live"], &[0.0, 1.0]).await;
        let balancer = WeightedRandomBalancer::new(table);
        for _ in 0..50 {
            assert_eq!(balancer.next_host("svc").await.unwrap(), "live");
        }
    }

    #[tokio::test]
    async fn weighted_random_rejects_all_zero_weights() {
        let table = table_with("svc", &["a", "b"], &[0.0, 0.0]).await;
        let balancer = WeightedRandomBalancer::new(table);
        assert!(matches!(
            balancer.next_host("svc").await,
            Err(GalileoError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn round_robin_follows_lvs_schedule() {
        let table = table_with("svc", &["a", "b"], &[2.0, 4.0]).await;
        let balancer = WeightedRoundRobinBalancer::new(table);

        let mut picks = Vec::new();
        for _ in 0..6 {
            picks.push(balancer.next_host("svc").await.unwrap());
        }
        // max=4, gcd=2: b, then a and b at cw=2, then b alone again
        assert_eq!(picks, vec!["b", "a", "b", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn round_robin_equal_weights_cycle_in_order() {
        let table = table_with("svc", &["a", "b", "c"], &[1.0, 1.0, 1.0]).await;
        let balancer = WeightedRoundRobinBalancer::new(table);

        let mut picks = Vec::new();
        for _ in 0..6 {
            picks.push(balancer.next_host("svc").await.unwrap());
        }
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn round_robin_rejects_all_zero_weights() {
        let table = table_with("svc", &["a"], &[0.0]).await;
        let balancer = WeightedRoundRobinBalancer::new(table);
        assert!(matches!(
            balancer.next_host("svc").await,
            Err(GalileoError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn round_robin_adopts_changed_record() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let table = Arc::new(SubstrateRoutingTable::new(substrate));
        table
            .set_routing(RoutingRecord::new("svc", vec!["a".into(), "b".into(), "c".into()], vec![1.0, 1.0, 1.0]).unwrap())
            .await
            .unwrap();

        let balancer = WeightedRoundRobinBalancer::new(table.clone());
        for _ in 0..3 {
            balancer.next_host("svc").await.unwrap();
        }

        // Shrinking the record below the current position resets it
        table
            .set_routing(RoutingRecord::new("svc", vec!["x".into()], vec![1.0]).unwrap())
            .await
            .unwrap();
        assert_eq!(balancer.next_host("svc").await.unwrap(), "x");
        assert_eq!(balancer.next_host("svc").await.unwrap(), "x");
    }
}
