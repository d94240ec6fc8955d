// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared-store interface and backends.
//!
//! This module defines the cluster-state abstraction and its backend
//! implementations. Everything cluster-shared (queues, sessions, presence,
//! instance records) lives behind [`SharedStore`]; the core never talks to
//! a concrete backend directly.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Errors from the shared store.
///
/// Transport failures all collapse into [`StoreError::Unavailable`];
/// callers treat it as a transient refusal and never corrupt local state
/// because of it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backing service refused, timed out, or dropped the connection.
    #[error("shared store unavailable during '{operation}': {details}")]
    Unavailable {
        /// The operation that failed.
        operation: String,
        /// Transport-level details, for the log only.
        details: String,
    },
}

impl StoreError {
    pub(crate) fn unavailable(operation: &str, details: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

/// A member of an ordered set together with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    /// The member value.
    pub member: String,
    /// The float score the set is ordered by.
    pub score: f64,
}

/// A live subscription to a pub/sub channel.
///
/// Dropping the subscription detaches it from the channel.
pub struct Subscription {
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Next published payload, or `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Clustered key/value service used for all cross-instance state.
///
/// Provides strings with TTL, float-scored ordered sets, pub/sub, a key
/// scan, and a fenced single-writer lock. Ordered sets sort by score
/// ascending with ties broken by lexicographic member order, so equal
/// scores still produce a deterministic ranking on every instance.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Set a string value, replacing any previous one.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<(), StoreError>;

    /// Set a string value only if the key does not exist. Returns whether
    /// the write happened.
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete a key of any kind. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete a string key only if it currently holds `expected`.
    ///
    /// This is the fencing primitive: lock release and reverse-pointer
    /// teardown both go through it so a stale holder can never delete a
    /// value it no longer owns.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Reset a key's TTL. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Add `delta` to an integer value, creating it at 0 first. Returns
    /// the new value.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Insert a member with a score. Returns true if the member was new.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError>;

    /// Remove members in one call. Returns how many were present.
    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;

    /// Members by ascending rank, inclusive. Negative indices count from
    /// the end, as in the usual ordered-set convention.
    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<ScoredMember>, StoreError>;

    /// Members with `min <= score <= max`, ascending.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<ScoredMember>, StoreError>;

    /// Zero-based ascending rank of a member.
    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError>;

    /// Number of members in the set.
    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Score of a member.
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    /// Remove members by rank range, inclusive, negative-from-end allowed.
    /// Returns how many were removed.
    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64)
        -> Result<u64, StoreError>;

    /// Publish a payload to a channel. Fire-and-forget.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to a channel. Messages published after this call are
    /// delivered in publish order, at-most-once.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;

    /// All keys matching a glob pattern (`*` wildcard). Cursor pagination
    /// is the backend's concern; the full result is returned.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Try to take the named lock for at most `ttl`.
    ///
    /// Returns the fencing token on success, `None` when another holder
    /// has it. Never blocks waiting for the lock.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<String>, StoreError> {
        let token = uuid::Uuid::new_v4().to_string();
        if self.set_nx(key, &token, Some(ttl)).await? {
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    /// Release a lock previously acquired with [`SharedStore::try_acquire`].
    ///
    /// Only succeeds while the stored token matches, so a holder whose TTL
    /// lapsed cannot release a successor's lock.
    async fn release(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        self.compare_and_delete(key, token).await
    }
}
