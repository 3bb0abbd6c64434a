//! Redis-backed substrate

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{RemoveOutcome, Substrate, SubstrateError, SubstrateResult, TopicSubscription};

const TOMBSTONE: &str = "__DELETE__";

/// Substrate over a single Redis instance.
///
/// Commands run on a shared multiplexed connection; every subscription and
/// every transactional remove gets a dedicated connection.
pub struct RedisSubstrate {
    client: redis::Client,
    connection: MultiplexedConnection,
}

impl RedisSubstrate {
    /// Connects to Redis and verifies the server is reachable.
    pub async fn connect(host: &str, port: u16) -> SubstrateResult<Self> {
        let url = format!("redis://{host}:{port}/");
        let client = redis::Client::open(url.as_str())
            .map_err(|e| SubstrateError::Connection(e.to_string()))?;

        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SubstrateError::Connection(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .map_err(|e| SubstrateError::Connection(e.to_string()))?;

        debug!(host, port, "connected to redis");
        Ok(Self { client, connection })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

fn backend(e: redis::RedisError) -> SubstrateError {
    if e.is_connection_refusal() || e.is_io_error() || e.is_connection_dropped() {
        SubstrateError::Connection(e.to_string())
    } else {
        SubstrateError::Backend(e.to_string())
    }
}

#[async_trait]
impl Substrate for RedisSubstrate {
    async fn get(&self, key: &str) -> SubstrateResult<Option<String>> {
        self.conn().get(key).await.map_err(backend)
    }

    async fn set(&self, key: &str, value: &str) -> SubstrateResult<()> {
        self.conn().set(key, value).await.map_err(backend)
    }

    async fn del(&self, key: &str) -> SubstrateResult<()> {
        self.conn().del(key).await.map_err(backend)
    }

    async fn mget(&self, keys: &[String]) -> SubstrateResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        if keys.len() == 1 {
            // redis collapses single-key MGET replies to a scalar
            return Ok(vec![self.get(&keys[0]).await?]);
        }
        self.conn().mget(keys).await.map_err(backend)
    }

    async fn keys(&self, pattern: &str) -> SubstrateResult<Vec<String>> {
        let mut conn = self.conn();
        let mut iter = conn
            .scan_match::<_, String>(pattern)
            .await
            .map_err(backend)?;
        let mut found = Vec::new();
        while let Some(key) = iter.next_item().await {
            found.push(key);
        }
        Ok(found)
    }

    async fn sadd(&self, key: &str, member: &str) -> SubstrateResult<()> {
        self.conn().sadd(key, member).await.map_err(backend)
    }

    async fn srem(&self, key: &str, member: &str) -> SubstrateResult<()> {
        self.conn().srem(key, member).await.map_err(backend)
    }

    async fn smembers(&self, key: &str) -> SubstrateResult<Vec<String>> {
        self.conn().smembers(key).await.map_err(backend)
    }

    async fn scard(&self, key: &str) -> SubstrateResult<u64> {
        self.conn().scard(key).await.map_err(backend)
    }

    async fn sunion(&self, keys: &[String]) -> SubstrateResult<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.conn().sunion(keys).await.map_err(backend)
    }

    async fn hset_all(&self, key: &str, entries: &HashMap<String, String>) -> SubstrateResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let items: Vec<(String, String)> =
            entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.conn()
            .hset_multiple(key, &items)
            .await
            .map_err(backend)
    }

    async fn hgetall(&self, key: &str) -> SubstrateResult<HashMap<String, String>> {
        self.conn().hgetall(key).await.map_err(backend)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> SubstrateResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.conn().rpush(key, values).await.map_err(backend)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> SubstrateResult<Vec<String>> {
        self.conn().lrange(key, start, stop).await.map_err(backend)
    }

    async fn llen(&self, key: &str) -> SubstrateResult<u64> {
        self.conn().llen(key).await.map_err(backend)
    }

    async fn lset(&self, key: &str, index: isize, value: &str) -> SubstrateResult<()> {
        self.conn().lset(key, index, value).await.map_err(backend)
    }

    async fn pop_front(&self, key: &str, timeout: Duration) -> SubstrateResult<Option<String>> {
        let reply: Option<(String, String)> = self
            .conn()
            .blpop(key, timeout.as_secs_f64())
            .await
            .map_err(backend)?;
        Ok(reply.map(|(_, value)| value))
    }

    async fn remove_at(
        &self,
        key: &str,
        index: isize,
        expected: &str,
    ) -> SubstrateResult<RemoveOutcome> {
        // WATCH needs its own connection so unrelated traffic cannot slip
        // between WATCH and EXEC.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;

        redis::cmd("WATCH")
            .arg(key)
            .exec_async(&mut conn)
            .await
            .map_err(backend)?;

        let current: Option<String> = conn.lindex(key, index).await.map_err(backend)?;
        if current.as_deref() != Some(expected) {
            redis::cmd("UNWATCH")
                .exec_async(&mut conn)
                .await
                .map_err(backend)?;
            return Ok(RemoveOutcome::Mismatch);
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lset(key, index, TOMBSTONE)
            .ignore()
            .lrem(key, 1, TOMBSTONE)
            .ignore();

        let result: Option<()> = pipe.query_async(&mut conn).await.map_err(backend)?;
        match result {
            Some(()) => Ok(RemoveOutcome::Removed),
            None => Ok(RemoveOutcome::Conflict),
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> SubstrateResult<()> {
        self.conn().zadd(key, member, score).await.map_err(backend)
    }

    async fn publish(&self, topic: &str, payload: &str) -> SubstrateResult<()> {
        self.conn().publish(topic, payload).await.map_err(backend)
    }

    async fn subscribe(&self, topic: &str) -> SubstrateResult<TopicSubscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| SubstrateError::Connection(e.to_string()))?;
        pubsub.subscribe(topic).await.map_err(backend)?;

        let (tx, rx) = mpsc::channel(256);
        let topic = topic.to_string();
        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(topic, error = %e, "dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });

        Ok(TopicSubscription::new(rx, Some(task)))
    }
}
