//! Coordination substrate
//!
//! Every shared piece of state in galileo lives in one external store: worker
//! membership, client documents, routing records, the experiment queue, and
//! all pub/sub traffic. This module defines the [`Substrate`] trait over that
//! store plus two implementations: [`RedisSubstrate`] for production and
//! [`InMemorySubstrate`] for tests, with identical visible semantics.
//!
//! The consistency model is single-writer-per-key with last-writer-wins;
//! multi-key writes are sequences, not transactions, except for
//! [`Substrate::remove_at`] which is a watch/multi/exec style compare-and-remove.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod memory;
mod redis;

pub use memory::InMemorySubstrate;
pub use redis::RedisSubstrate;

/// Errors surfaced by substrate implementations
#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("wrong type for key {0}")]
    WrongType(String),
}

pub type SubstrateResult<T> = std::result::Result<T, SubstrateError>;

/// Outcome of a transactional [`Substrate::remove_at`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The element was removed.
    Removed,
    /// The element at the index no longer matches the expected value.
    Mismatch,
    /// A concurrent write aborted the transaction; the caller may retry.
    Conflict,
}

/// A live subscription to one pub/sub topic.
///
/// Dropping the subscription unsubscribes.
pub struct TopicSubscription {
    receiver: mpsc::Receiver<String>,
    task: Option<JoinHandle<()>>,
}

impl TopicSubscription {
    pub(crate) fn new(receiver: mpsc::Receiver<String>, task: Option<JoinHandle<()>>) -> Self {
        Self { receiver, task }
    }

    /// Receives the next payload published on the topic, or `None` once the
    /// subscription is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Shared key-value / pub-sub store backing every galileo component.
///
/// The operations mirror what the components actually need: sets for
/// membership, hashes for labels, lists for routing vectors and queues, a
/// scored set for trace sinks, and plain string keys for serialized documents.
#[async_trait]
pub trait Substrate: Send + Sync + 'static {
    // -- string keys --
    async fn get(&self, key: &str) -> SubstrateResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> SubstrateResult<()>;
    async fn del(&self, key: &str) -> SubstrateResult<()>;
    async fn mget(&self, keys: &[String]) -> SubstrateResult<Vec<Option<String>>>;
    /// Enumerates keys matching a glob pattern (`*` wildcards).
    async fn keys(&self, pattern: &str) -> SubstrateResult<Vec<String>>;

    // -- sets --
    async fn sadd(&self, key: &str, member: &str) -> SubstrateResult<()>;
    async fn srem(&self, key: &str, member: &str) -> SubstrateResult<()>;
    async fn smembers(&self, key: &str) -> SubstrateResult<Vec<String>>;
    async fn scard(&self, key: &str) -> SubstrateResult<u64>;
    async fn sunion(&self, keys: &[String]) -> SubstrateResult<Vec<String>>;

    // -- hashes --
    async fn hset_all(&self, key: &str, entries: &HashMap<String, String>) -> SubstrateResult<()>;
    async fn hgetall(&self, key: &str) -> SubstrateResult<HashMap<String, String>>;

    // -- lists --
    async fn rpush(&self, key: &str, values: &[String]) -> SubstrateResult<()>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> SubstrateResult<Vec<String>>;
    async fn llen(&self, key: &str) -> SubstrateResult<u64>;
    async fn lset(&self, key: &str, index: isize, value: &str) -> SubstrateResult<()>;
    /// Pops the leftmost element, waiting up to `timeout` for one to appear.
    async fn pop_front(&self, key: &str, timeout: Duration) -> SubstrateResult<Option<String>>;
    /// Removes the element at `index` if it still equals `expected`.
    ///
    /// Implemented with watch/read/multi/exec semantics on backends that have
    /// them; a concurrent modification yields [`RemoveOutcome::Conflict`].
    async fn remove_at(
        &self,
        key: &str,
        index: isize,
        expected: &str,
    ) -> SubstrateResult<RemoveOutcome>;

    // -- scored sets --
    async fn zadd(&self, key: &str, score: f64, member: &str) -> SubstrateResult<()>;

    // -- pub/sub --
    async fn publish(&self, topic: &str, payload: &str) -> SubstrateResult<()>;
    async fn subscribe(&self, topic: &str) -> SubstrateResult<TopicSubscription>;
}

/// Matches a key against a glob pattern where `*` matches any run of
/// characters. This is the subset of redis `KEYS` globbing the crate uses.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }

    // Only reachable when the pattern ends with '*'
    true
}
