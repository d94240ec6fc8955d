// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process store backend.
//!
//! Single-node deployments and the test suite run against this backend.
//! TTLs are enforced lazily against the injected clock on every access,
//! which keeps expiry deterministic under a manual test clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::clock::{Clock, SystemClock};

use super::{ScoredMember, SharedStore, StoreError, Subscription};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    expires_at: Option<i64>,
}

#[derive(Debug, Default, Clone)]
struct ZSetEntry {
    members: HashMap<String, f64>,
    expires_at: Option<i64>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    zsets: HashMap<String, ZSetEntry>,
}

impl Inner {
    fn purge_expired(&mut self, now_ms: i64) {
        self.strings
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now_ms));
        self.zsets
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now_ms));
    }
}

/// Store backend living entirely in this process.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    /// Create a store reading the given clock for TTL decisions.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn deadline(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|t| self.clock.now_ms() + t.as_millis() as i64)
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.purge_expired(self.clock.now_ms());
        inner
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().expect("channel mutex poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

fn sorted_members(entry: &ZSetEntry) -> Vec<ScoredMember> {
    let mut members: Vec<ScoredMember> = entry
        .members
        .iter()
        .map(|(member, score)| ScoredMember {
            member: member.clone(),
            score: *score,
        })
        .collect();
    members.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| a.member.cmp(&b.member))
    });
    members
}

/// Normalize an inclusive `(start, stop)` rank pair against `len`,
/// resolving negative-from-end indices. Returns `None` for empty ranges.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { start + len } else { start };
    let mut stop = if stop < 0 { stop + len } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if len == 0 || start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn glob_match(pattern: &str, key: &str) -> bool {
    // Only '*' is supported, which is all the core uses.
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
                Some(at) => rest = &rest[at + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '*'.
    true
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let expires_at = self.deadline(ttl);
        let mut inner = self.lock_inner();
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let expires_at = self.deadline(ttl);
        let mut inner = self.lock_inner();
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.lock_inner();
        Ok(inner.strings.get(key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock_inner();
        let existed = inner.strings.remove(key).is_some() | inner.zsets.remove(key).is_some();
        Ok(existed)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock_inner();
        match inner.strings.get(key) {
            Some(entry) if entry.value == expected => {
                inner.strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let expires_at = self.deadline(Some(ttl));
        let mut inner = self.lock_inner();
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.expires_at = expires_at;
            return Ok(true);
        }
        if let Some(entry) = inner.zsets.get_mut(key) {
            entry.expires_at = expires_at;
            return Ok(true);
        }
        Ok(false)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut inner = self.lock_inner();
        let current = match inner.strings.get(key) {
            Some(entry) => entry
                .value
                .parse::<i64>()
                .map_err(|_| StoreError::unavailable("incr", "value is not an integer"))?,
            None => 0,
        };
        let next = current + delta;
        let expires_at = inner.strings.get(key).and_then(|e| e.expires_at);
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        let mut inner = self.lock_inner();
        let entry = inner.zsets.entry(key.to_string()).or_default();
        Ok(entry.members.insert(member.to_string(), score).is_none())
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        let mut inner = self.lock_inner();
        let Some(entry) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        for member in members {
            if entry.members.remove(member).is_some() {
                removed += 1;
            }
        }
        if entry.members.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(removed)
    }

    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let inner = self.lock_inner();
        let Some(entry) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let members = sorted_members(entry);
        Ok(match normalize_range(members.len(), start, stop) {
            Some((start, stop)) => members[start..=stop].to_vec(),
            None => Vec::new(),
        })
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let inner = self.lock_inner();
        let Some(entry) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(sorted_members(entry)
            .into_iter()
            .filter(|m| m.score >= min && m.score <= max)
            .collect())
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError> {
        let inner = self.lock_inner();
        let Some(entry) = inner.zsets.get(key) else {
            return Ok(None);
        };
        Ok(sorted_members(entry)
            .iter()
            .position(|m| m.member == member)
            .map(|rank| rank as u64))
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let inner = self.lock_inner();
        Ok(inner.zsets.get(key).map_or(0, |e| e.members.len() as u64))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let inner = self.lock_inner();
        Ok(inner.zsets.get(key).and_then(|e| e.members.get(member).copied()))
    }

    async fn zremrangebyrank(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock_inner();
        let Some(entry) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let members = sorted_members(entry);
        let Some((start, stop)) = normalize_range(members.len(), start, stop) else {
            return Ok(0);
        };
        let doomed = &members[start..=stop];
        for m in doomed {
            entry.members.remove(&m.member);
        }
        let removed = doomed.len() as u64;
        if entry.members.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(removed)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        // No subscribers is fine; the send result is irrelevant.
        let _ = self.sender_for(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut broadcast_rx = self.sender_for(channel).subscribe();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock_inner();
        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.zsets.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (MemoryStore::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_string_ttl_expires_with_clock() {
        let (store, clock) = store_with_clock();
        store
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance_ms(9_999);
        assert!(store.get("k").await.unwrap().is_some());
        clock.advance_ms(2);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_nx_respects_existing() {
        let (store, _clock) = store_with_clock();
        assert!(store.set_nx("k", "a", None).await.unwrap());
        assert!(!store.set_nx("k", "b", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_zset_orders_by_score_then_member() {
        let (store, _clock) = store_with_clock();
        store.zadd("q", "charlie", 5.0).await.unwrap();
        store.zadd("q", "alice", 5.0).await.unwrap();
        store.zadd("q", "bob", 1.0).await.unwrap();

        let all = store.zrange("q", 0, -1).await.unwrap();
        let names: Vec<&str> = all.iter().map(|m| m.member.as_str()).collect();
        assert_eq!(names, vec!["bob", "alice", "charlie"]);

        assert_eq!(store.zrank("q", "alice").await.unwrap(), Some(1));
        assert_eq!(store.zrank("q", "nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zrem_multiple_is_counted() {
        let (store, _clock) = store_with_clock();
        store.zadd("q", "a", 1.0).await.unwrap();
        store.zadd("q", "b", 2.0).await.unwrap();
        let removed = store
            .zrem("q", &["a".to_string(), "b".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.zcard("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zremrangebyrank_caps_series() {
        let (store, _clock) = store_with_clock();
        for i in 0..10 {
            store.zadd("ts", &format!("sample-{i}"), i as f64).await.unwrap();
        }
        // Keep the newest 4: remove ranks 0 through len-5.
        store.zremrangebyrank("ts", 0, -5).await.unwrap();
        let left = store.zrange("ts", 0, -1).await.unwrap();
        assert_eq!(left.len(), 4);
        assert_eq!(left[0].member, "sample-6");
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_fenced() {
        let (store, clock) = store_with_clock();
        let token = store
            .try_acquire("lock:x", Duration::from_secs(5))
            .await
            .unwrap()
            .expect("first acquire succeeds");
        assert!(store
            .try_acquire("lock:x", Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());

        // A wrong token cannot release.
        assert!(!store.release("lock:x", "stolen").await.unwrap());
        assert!(store.release("lock:x", &token).await.unwrap());

        // After TTL lapse the lock frees itself.
        let _token = store
            .try_acquire("lock:x", Duration::from_secs(5))
            .await
            .unwrap()
            .expect("reacquire after release");
        clock.advance_ms(5_001);
        assert!(store
            .try_acquire("lock:x", Duration::from_secs(5))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_pubsub_delivers_in_order() {
        let (store, _clock) = store_with_clock();
        let mut sub = store.subscribe("events").await.unwrap();
        store.publish("events", "one").await.unwrap();
        store.publish("events", "two").await.unwrap();
        assert_eq!(sub.next().await.as_deref(), Some("one"));
        assert_eq!(sub.next().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_scan_matches_prefix() {
        let (store, _clock) = store_with_clock();
        store.set("session:a", "1", None).await.unwrap();
        store.set("session:b", "2", None).await.unwrap();
        store.set("session-of:u", "a", None).await.unwrap();
        let keys = store.scan("session:*").await.unwrap();
        assert_eq!(keys, vec!["session:a".to_string(), "session:b".to_string()]);
    }

    #[tokio::test]
    async fn test_incr_counts_up_and_down() {
        let (store, _clock) = store_with_clock();
        assert_eq!(store.incr("c", 1).await.unwrap(), 1);
        assert_eq!(store.incr("c", 1).await.unwrap(), 2);
        assert_eq!(store.incr("c", -2).await.unwrap(), 0);
    }
}
