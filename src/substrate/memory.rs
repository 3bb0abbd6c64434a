//! In-memory substrate used by tests and single-process setups

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

use super::{RemoveOutcome, Substrate, SubstrateError, SubstrateResult, TopicSubscription, glob_match};

#[derive(Debug, Clone)]
enum Entry {
    Str(String),
    Set(BTreeSet<String>),
    List(Vec<String>),
    Hash(HashMap<String, String>),
    Scored(Vec<(f64, String)>),
}

/// Substrate backed by process-local maps.
///
/// Semantics match [`super::RedisSubstrate`]: typed keys, blocking list pops,
/// per-topic publication order. Topics are fanned out over mpsc channels; a
/// subscriber that falls more than a channel's capacity behind loses messages,
/// the same way a slow redis pub/sub consumer would.
#[derive(Default)]
pub struct InMemorySubstrate {
    data: Mutex<HashMap<String, Entry>>,
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
    pushed: Notify,
}

impl InMemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_list<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Vec<String>) -> T,
    ) -> SubstrateResult<T> {
        let mut data = self.data.lock().expect("substrate lock poisoned");
        match data
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(Vec::new()))
        {
            Entry::List(list) => Ok(f(list)),
            _ => Err(SubstrateError::WrongType(key.to_string())),
        }
    }
}

fn resolve_index(index: isize, len: usize) -> Option<usize> {
    let len = len as isize;
    let i = if index < 0 { len + index } else { index };
    if i < 0 || i >= len { None } else { Some(i as usize) }
}

fn range_bounds(start: isize, stop: isize, len: usize) -> (usize, usize) {
    let len = len as isize;
    let lo = if start < 0 { (len + start).max(0) } else { start.min(len) };
    let hi = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if hi < lo {
        (0, 0)
    } else {
        (lo as usize, (hi + 1) as usize)
    }
}

#[async_trait]
impl Substrate for InMemorySubstrate {
    async fn get(&self, key: &str) -> SubstrateResult<Option<String>> {
        let data = self.data.lock().expect("substrate lock poisoned");
        match data.get(key) {
            None => Ok(None),
            Some(Entry::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(SubstrateError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> SubstrateResult<()> {
        let mut data = self.data.lock().expect("substrate lock poisoned");
        data.insert(key.to_string(), Entry::Str(value.to_string()));
        Ok(())
    }

    async fn del(&self, key: &str) -> SubstrateResult<()> {
        let mut data = self.data.lock().expect("substrate lock poisoned");
        data.remove(key);
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> SubstrateResult<Vec<Option<String>>> {
        let data = self.data.lock().expect("substrate lock poisoned");
        Ok(keys
            .iter()
            .map(|key| match data.get(key) {
                Some(Entry::Str(value)) => Some(value.clone()),
                _ => None,
            })
            .collect())
    }

    async fn keys(&self, pattern: &str) -> SubstrateResult<Vec<String>> {
        let data = self.data.lock().expect("substrate lock poisoned");
        Ok(data
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> SubstrateResult<()> {
        let mut data = self.data.lock().expect("substrate lock poisoned");
        match data
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(BTreeSet::new()))
        {
            Entry::Set(set) => {
                set.insert(member.to_string());
                Ok(())
            }
            _ => Err(SubstrateError::WrongType(key.to_string())),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> SubstrateResult<()> {
        let mut data = self.data.lock().expect("substrate lock poisoned");
        if let Some(Entry::Set(set)) = data.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> SubstrateResult<Vec<String>> {
        let data = self.data.lock().expect("substrate lock poisoned");
        match data.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(SubstrateError::WrongType(key.to_string())),
        }
    }

    async fn scard(&self, key: &str) -> SubstrateResult<u64> {
        let data = self.data.lock().expect("substrate lock poisoned");
        match data.get(key) {
            Some(Entry::Set(set)) => Ok(set.len() as u64),
            _ => Ok(0),
        }
    }

    async fn sunion(&self, keys: &[String]) -> SubstrateResult<Vec<String>> {
        let data = self.data.lock().expect("substrate lock poisoned");
        let mut union = BTreeSet::new();
        for key in keys {
            if let Some(Entry::Set(set)) = data.get(key) {
                union.extend(set.iter().cloned());
            }
        }
        Ok(union.into_iter().collect())
    }

    async fn hset_all(&self, key: &str, entries: &HashMap<String, String>) -> SubstrateResult<()> {
        let mut data = self.data.lock().expect("substrate lock poisoned");
        match data
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()))
        {
            Entry::Hash(hash) => {
                for (k, v) in entries {
                    hash.insert(k.clone(), v.clone());
                }
                Ok(())
            }
            _ => Err(SubstrateError::WrongType(key.to_string())),
        }
    }

    async fn hgetall(&self, key: &str) -> SubstrateResult<HashMap<String, String>> {
        let data = self.data.lock().expect("substrate lock poisoned");
        match data.get(key) {
            Some(Entry::Hash(hash)) => Ok(hash.clone()),
            _ => Ok(HashMap::new()),
        }
    }

    async fn rpush(&self, key: &str, values: &[String]) -> SubstrateResult<()> {
        self.with_list(key, |list| list.extend(values.iter().cloned()))?;
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> SubstrateResult<Vec<String>> {
        let data = self.data.lock().expect("substrate lock poisoned");
        match data.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::List(list)) => {
                let (lo, hi) = range_bounds(start, stop, list.len());
                Ok(list[lo..hi].to_vec())
            }
            Some(_) => Err(SubstrateError::WrongType(key.to_string())),
        }
    }

    async fn llen(&self, key: &str) -> SubstrateResult<u64> {
        let data = self.data.lock().expect("substrate lock poisoned");
        match data.get(key) {
            Some(Entry::List(list)) => Ok(list.len() as u64),
            _ => Ok(0),
        }
    }

    async fn lset(&self, key: &str, index: isize, value: &str) -> SubstrateResult<()> {
        self.with_list(key, |list| {
            if let Some(i) = resolve_index(index, list.len()) {
                list[i] = value.to_string();
            }
        })
    }

    async fn pop_front(&self, key: &str, timeout: Duration) -> SubstrateResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeups before checking so a push between the
            // check and the wait is not lost.
            let mut pushed = std::pin::pin!(self.pushed.notified());
            pushed.as_mut().enable();

            let popped = self.with_list(key, |list| {
                if list.is_empty() {
                    None
                } else {
                    Some(list.remove(0))
                }
            })?;
            if popped.is_some() {
                return Ok(popped);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = &mut pushed => {}
                _ = tokio::time::sleep(remaining) => return Ok(None),
            }
        }
    }

    async fn remove_at(
        &self,
        key: &str,
        index: isize,
        expected: &str,
    ) -> SubstrateResult<RemoveOutcome> {
        self.with_list(key, |list| match resolve_index(index, list.len()) {
            Some(i) if list[i] == expected => {
                list.remove(i);
                RemoveOutcome::Removed
            }
            _ => RemoveOutcome::Mismatch,
        })
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> SubstrateResult<()> {
        let mut data = self.data.lock().expect("substrate lock poisoned");
        match data
            .entry(key.to_string())
            .or_insert_with(|| Entry::Scored(Vec::new()))
        {
            Entry::Scored(entries) => {
                entries.retain(|(_, m)| m != member);
                entries.push((score, member.to_string()));
                entries.sort_by(|a, b| a.0.total_cmp(&b.0));
                Ok(())
            }
            _ => Err(SubstrateError::WrongType(key.to_string())),
        }
    }

    async fn publish(&self, topic: &str, payload: &str) -> SubstrateResult<()> {
        let senders = {
            let mut topics = self.topics.lock().expect("substrate lock poisoned");
            if let Some(senders) = topics.get_mut(topic) {
                senders.retain(|tx| !tx.is_closed());
                senders.clone()
            } else {
                Vec::new()
            }
        };
        for tx in senders {
            // try_send keeps publishers non-blocking; a full subscriber
            // channel drops the message like a lagging pub/sub consumer
            let _ = tx.try_send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> SubstrateResult<TopicSubscription> {
        let (tx, rx) = mpsc::channel(256);
        let mut topics = self.topics.lock().expect("substrate lock poisoned");
        topics.entry(topic.to_string()).or_default().push(tx);
        Ok(TopicSubscription::new(rx, None))
    }
}

/// Scored-set contents, exposed for assertions in tests.
impl InMemorySubstrate {
    pub fn scored_members(&self, key: &str) -> Vec<(f64, String)> {
        let data = self.data.lock().expect("substrate lock poisoned");
        match data.get(key) {
            Some(Entry::Scored(entries)) => entries.clone(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_set_get_del_roundtrip() {
        let substrate = InMemorySubstrate::new();
        substrate.set("k", "v").await.unwrap();
        assert_eq!(substrate.get("k").await.unwrap(), Some("v".to_string()));
        substrate.del("k").await.unwrap();
        assert_eq!(substrate.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_membership_is_idempotent() {
        let substrate = InMemorySubstrate::new();
        substrate.sadd("s", "a").await.unwrap();
        substrate.sadd("s", "a").await.unwrap();
        substrate.sadd("s", "b").await.unwrap();
        assert_eq!(substrate.smembers("s").await.unwrap(), vec!["a", "b"]);
        assert_eq!(substrate.scard("s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn pop_front_returns_pushed_value() {
        let substrate = std::sync::Arc::new(InMemorySubstrate::new());

        let waiter = {
            let substrate = substrate.clone();
            tokio::spawn(async move {
                substrate
                    .pop_front("q", Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        substrate.rpush("q", &["item".to_string()]).await.unwrap();

        assert_eq!(waiter.await.unwrap(), Some("item".to_string()));
    }

    #[tokio::test]
    async fn pop_front_times_out_on_empty_list() {
        let substrate = InMemorySubstrate::new();
        let popped = substrate
            .pop_front("empty", Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn remove_at_checks_expected_value() {
        let substrate = InMemorySubstrate::new();
        substrate
            .rpush("l", &["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();

        let outcome = substrate.remove_at("l", 1, "x").await.unwrap();
        assert_eq!(outcome, RemoveOutcome::Mismatch);

        let outcome = substrate.remove_at("l", 1, "b").await.unwrap();
        assert_eq!(outcome, RemoveOutcome::Removed);
        assert_eq!(substrate.lrange("l", 0, -1).await.unwrap(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers_in_order() {
        let substrate = InMemorySubstrate::new();
        let mut first = substrate.subscribe("t").await.unwrap();
        let mut second = substrate.subscribe("t").await.unwrap();

        substrate.publish("t", "1").await.unwrap();
        substrate.publish("t", "2").await.unwrap();

        assert_eq!(first.recv().await, Some("1".to_string()));
        assert_eq!(first.recv().await, Some("2".to_string()));
        assert_eq!(second.recv().await, Some("1".to_string()));
        assert_eq!(second.recv().await, Some("2".to_string()));
    }

    #[tokio::test]
    async fn lrange_supports_negative_bounds() {
        let substrate = InMemorySubstrate::new();
        substrate
            .rpush("l", &["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(substrate.lrange("l", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(substrate.lrange("l", 1, 1).await.unwrap(), vec!["b"]);
        assert_eq!(substrate.lrange("l", -2, -1).await.unwrap(), vec!["b", "c"]);
    }
}
