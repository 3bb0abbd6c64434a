//! Event bus
//!
//! A thin typed layer above the [`Substrate`](crate::substrate::Substrate):
//! topic publish/subscribe of serializable messages, request/response stubs
//! (single- and multi-target with timeout), and durable queues. All payloads
//! travel as JSON; messages that fail to decode are logged and skipped so one
//! malformed publisher cannot wedge a subscriber.
//!
//! RPC encoding: requests are published on `galileo:rpc:{name}` and carry a
//! unique reply topic; every live responder publishes exactly one reply there.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{GalileoError, Result};
use crate::substrate::{RemoveOutcome, Substrate, TopicSubscription};

const RPC_PREFIX: &str = "galileo:rpc:";
const RPC_REPLY_PREFIX: &str = "galileo:rpc:reply:";

/// How long a queue consumer blocks per pop before re-checking for shutdown.
const QUEUE_POLL: Duration = Duration::from_secs(1);

/// Attempts before a transactional queue remove gives up.
const REMOVE_RETRIES: usize = 3;

#[derive(Debug, Serialize, Deserialize)]
struct RpcRequest {
    reply_to: String,
    payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct RpcReply {
    payload: Value,
}

/// Typed publish/subscribe, RPC, and queue access over a shared substrate.
///
/// Cloning is cheap; clones share the substrate connection and the shutdown
/// token.
#[derive(Clone)]
pub struct EventBus {
    substrate: Arc<dyn Substrate>,
    shutdown: CancellationToken,
}

impl EventBus {
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self {
            substrate,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn substrate(&self) -> Arc<dyn Substrate> {
        self.substrate.clone()
    }

    /// Publishes a message on a topic. Subscribers observe messages in
    /// publication order per topic.
    pub async fn publish<T: Serialize>(&self, topic: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        self.substrate.publish(topic, &payload).await?;
        Ok(())
    }

    /// Subscribes to a topic, decoding each payload as `T`.
    pub async fn subscribe<T: DeserializeOwned>(&self, topic: &str) -> Result<TypedSubscription<T>> {
        let inner = self.substrate.subscribe(topic).await?;
        Ok(TypedSubscription {
            topic: topic.to_string(),
            inner,
            _marker: PhantomData,
        })
    }

    /// Answers request/response calls addressed to `name` until the returned
    /// handle is dropped.
    pub async fn expose<Req, Resp, F, Fut>(&self, name: &str, handler: F) -> Result<RpcHandle>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Resp> + Send + 'static,
    {
        let topic = format!("{RPC_PREFIX}{name}");
        let mut subscription = self.substrate.subscribe(&topic).await?;
        let substrate = self.substrate.clone();
        let name = name.to_string();

        let task = tokio::spawn(async move {
            while let Some(raw) = subscription.recv().await {
                let request: RpcRequest = match serde_json::from_str(&raw) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(endpoint = %name, error = %e, "dropping malformed rpc request");
                        continue;
                    }
                };
                let arg: Req = match serde_json::from_value(request.payload) {
                    Ok(arg) => arg,
                    Err(e) => {
                        warn!(endpoint = %name, error = %e, "rpc request payload does not decode");
                        continue;
                    }
                };

                let response = handler(arg).await;
                let reply = match serde_json::to_value(&response) {
                    Ok(payload) => RpcReply { payload },
                    Err(e) => {
                        warn!(endpoint = %name, error = %e, "rpc response does not encode");
                        continue;
                    }
                };
                let encoded = match serde_json::to_string(&reply) {
                    Ok(encoded) => encoded,
                    Err(_) => continue,
                };
                if let Err(e) = substrate.publish(&request.reply_to, &encoded).await {
                    warn!(endpoint = %name, error = %e, "failed to publish rpc reply");
                }
            }
        });

        Ok(RpcHandle { task })
    }

    /// Returns a callable stub for the named endpoint.
    pub fn stub<Req, Resp>(&self, name: &str, timeout: Duration) -> Stub<Req, Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        Stub {
            substrate: self.substrate.clone(),
            name: name.to_string(),
            timeout,
            _marker: PhantomData,
        }
    }

    /// Returns a handle to the named durable queue.
    pub fn queue<T>(&self, name: &str) -> Queue<T>
    where
        T: Serialize + DeserializeOwned,
    {
        Queue {
            substrate: self.substrate.clone(),
            key: name.to_string(),
            shutdown: self.shutdown.clone(),
            _marker: PhantomData,
        }
    }

    /// Releases blocked queue consumers; their `get` calls return
    /// [`GalileoError::Shutdown`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Guard for an exposed RPC endpoint; dropping it stops answering.
pub struct RpcHandle {
    task: JoinHandle<()>,
}

impl Drop for RpcHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A subscription whose payloads decode to `T`.
pub struct TypedSubscription<T> {
    topic: String,
    inner: TopicSubscription,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> TypedSubscription<T> {
    /// Receives the next message, or `None` when the subscription closed.
    /// Payloads that do not decode to `T` are skipped.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let raw = self.inner.recv().await?;
            match serde_json::from_str(&raw) {
                Ok(message) => return Some(message),
                Err(e) => {
                    debug!(topic = %self.topic, error = %e, "skipping message of foreign type");
                }
            }
        }
    }
}

/// Callable request/response stub.
pub struct Stub<Req, Resp> {
    substrate: Arc<dyn Substrate>,
    name: String,
    timeout: Duration,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Serialize, Resp: DeserializeOwned> Stub<Req, Resp> {
    /// Calls a single responder, returning its reply or a timeout error.
    pub async fn call(&self, request: &Req) -> Result<Resp> {
        let mut replies = self.dispatch(request).await?;
        match tokio::time::timeout(self.timeout, replies.recv()).await {
            Ok(Some(raw)) => decode_reply(&raw),
            Ok(None) => Err(GalileoError::Shutdown),
            Err(_) => Err(GalileoError::Timeout(format!(
                "no response from {} within {:?}",
                self.name, self.timeout
            ))),
        }
    }

    /// Calls all live responders, collecting at most one reply per responder
    /// until the timeout elapses.
    pub async fn call_multi(&self, request: &Req) -> Result<Vec<Resp>> {
        let mut replies = self.dispatch(request).await?;
        let deadline = Instant::now() + self.timeout;
        let mut responses = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, replies.recv()).await {
                Ok(Some(raw)) => match decode_reply(&raw) {
                    Ok(response) => responses.push(response),
                    Err(e) => warn!(endpoint = %self.name, error = %e, "discarding bad rpc reply"),
                },
                Ok(None) | Err(_) => break,
            }
        }

        Ok(responses)
    }

    async fn dispatch(&self, request: &Req) -> Result<TopicSubscription> {
        let reply_to = format!("{RPC_REPLY_PREFIX}{}", uuid::Uuid::new_v4());
        let replies = self.substrate.subscribe(&reply_to).await?;

        let envelope = RpcRequest {
            reply_to,
            payload: serde_json::to_value(request)?,
        };
        let encoded = serde_json::to_string(&envelope)?;
        self.substrate
            .publish(&format!("{RPC_PREFIX}{}", self.name), &encoded)
            .await?;

        Ok(replies)
    }
}

fn decode_reply<Resp: DeserializeOwned>(raw: &str) -> Result<Resp> {
    let reply: RpcReply = serde_json::from_str(raw)?;
    Ok(serde_json::from_value(reply.payload)?)
}

/// Durable FIFO queue over a substrate list.
pub struct Queue<T> {
    substrate: Arc<dyn Substrate>,
    key: String,
    shutdown: CancellationToken,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Queue<T> {
    /// Appends an item at the tail.
    pub async fn put(&self, item: &T) -> Result<()> {
        let encoded = serde_json::to_string(item)?;
        self.substrate.rpush(&self.key, &[encoded]).await?;
        Ok(())
    }

    /// Blocks until an item is available. Returns
    /// [`GalileoError::Shutdown`] once the bus shuts down.
    pub async fn get(&self) -> Result<T> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(GalileoError::Shutdown);
            }
            let popped = tokio::select! {
                popped = self.substrate.pop_front(&self.key, QUEUE_POLL) => popped?,
                _ = self.shutdown.cancelled() => return Err(GalileoError::Shutdown),
            };
            if let Some(raw) = popped {
                return Ok(serde_json::from_str(&raw)?);
            }
        }
    }

    pub async fn qsize(&self) -> Result<u64> {
        Ok(self.substrate.llen(&self.key).await?)
    }

    /// All queued items in order. Entries that no longer decode are skipped.
    pub async fn range(&self) -> Result<Vec<T>> {
        let raw = self.substrate.lrange(&self.key, 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }

    pub async fn lset(&self, index: isize, item: &T) -> Result<()> {
        let encoded = serde_json::to_string(item)?;
        self.substrate.lset(&self.key, index, &encoded).await?;
        Ok(())
    }

    /// Removes the element currently at `index`.
    ///
    /// Transactional like [`remove_where`](Self::remove_where): the element
    /// is only removed if it still holds the value read at `index`.
    pub async fn remove(&self, index: isize) -> Result<bool> {
        for attempt in 0..REMOVE_RETRIES {
            let raw = self.substrate.lrange(&self.key, 0, -1).await?;
            let resolved = if index < 0 {
                raw.len() as isize + index
            } else {
                index
            };
            let Some(expected) = usize::try_from(resolved).ok().and_then(|i| raw.get(i)) else {
                return Ok(false);
            };

            match self
                .substrate
                .remove_at(&self.key, resolved, expected)
                .await?
            {
                RemoveOutcome::Removed => return Ok(true),
                RemoveOutcome::Mismatch | RemoveOutcome::Conflict => {
                    warn!(
                        queue = %self.key,
                        attempt = attempt + 1,
                        "conflicting queue write during remove, retrying"
                    );
                }
            }
        }

        Err(GalileoError::Cancel(format!(
            "queue {} kept changing during remove",
            self.key
        )))
    }

    /// Removes the first queued item matching `predicate`.
    ///
    /// Runs as a watch/read/multi/exec transaction retried up to three times;
    /// persistent contention surfaces as [`GalileoError::Cancel`].
    pub async fn remove_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Result<bool> {
        for attempt in 0..REMOVE_RETRIES {
            let raw = self.substrate.lrange(&self.key, 0, -1).await?;
            let found = raw.iter().enumerate().find(|(_, entry)| {
                serde_json::from_str::<T>(entry)
                    .map(|item| predicate(&item))
                    .unwrap_or(false)
            });

            let (index, expected) = match found {
                Some((index, entry)) => (index as isize, entry.clone()),
                None => return Ok(false),
            };

            match self.substrate.remove_at(&self.key, index, &expected).await? {
                RemoveOutcome::Removed => return Ok(true),
                RemoveOutcome::Mismatch | RemoveOutcome::Conflict => {
                    warn!(
                        queue = %self.key,
                        attempt = attempt + 1,
                        "conflicting queue write during remove, retrying"
                    );
                    continue;
                }
            }
        }

        Err(GalileoError::Cancel(format!(
            "queue {} kept changing during remove",
            self.key
        )))
    }
}
