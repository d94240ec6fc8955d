// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-modality wait queues with atomic pair extraction.
//!
//! Each modality has an ordered set scored by join time, plus one sidecar
//! entry per waiting user carrying the data needed to notify them later.
//! The sidecar doubles as the cross-modality marker: a user holds at most
//! one of them, so they can wait in at most one queue. Pair extraction
//! runs under the store lock `lock:matching:{modality}` and removes both
//! entries or neither.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use duet_protocol::Modality;

use crate::clock::Clock;
use crate::error::Result;
use crate::metrics::MetricsSink;
use crate::store::SharedStore;

/// A user waiting to be paired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitingEntry {
    /// The waiting user.
    pub user_id: String,
    /// The socket that asked to be queued.
    pub socket_id: String,
    /// Display name, carried so the eventual partner can be greeted
    /// without a directory round trip.
    pub username: String,
    /// Which queue the user is in.
    pub modality: Modality,
    /// Join time, milliseconds since the epoch. The queue's sort key.
    pub joined_at_ms: i64,
}

/// Both halves of a successful pair extraction.
#[derive(Debug, Clone)]
pub struct PairedEntries {
    /// The user on whose behalf `pair` ran.
    pub caller: WaitingEntry,
    /// The matched partner.
    pub partner: WaitingEntry,
}

/// Manager of all wait queues.
pub struct QueueManager {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    queue_timeout: Duration,
    pair_lock_ttl: Duration,
}

fn queue_key(modality: Modality) -> String {
    format!("queue:{modality}")
}

fn entry_key(user_id: &str) -> String {
    format!("waiting:{user_id}")
}

fn pair_lock_key(modality: Modality) -> String {
    format!("lock:matching:{modality}")
}

impl QueueManager {
    /// Create a queue manager.
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        queue_timeout: Duration,
        pair_lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
            queue_timeout,
            pair_lock_ttl,
        }
    }

    /// Sidecar entries outlive the staleness cutoff by one sweep so the
    /// sweeper, not the TTL, is what removes a live queue position.
    fn entry_ttl(&self) -> Duration {
        self.queue_timeout * 2
    }

    /// Add a user to a queue.
    ///
    /// Returns false when the user is already waiting in any modality.
    #[instrument(skip(self), fields(user_id = %user_id, modality = %modality))]
    pub async fn enqueue(
        &self,
        user_id: &str,
        socket_id: &str,
        username: &str,
        modality: Modality,
    ) -> Result<bool> {
        let entry = WaitingEntry {
            user_id: user_id.to_string(),
            socket_id: socket_id.to_string(),
            username: username.to_string(),
            modality,
            joined_at_ms: self.clock.now_ms(),
        };
        let inserted = self
            .store
            .set_nx(
                &entry_key(user_id),
                &serde_json::to_string(&entry)?,
                Some(self.entry_ttl()),
            )
            .await?;
        if !inserted {
            return Ok(false);
        }
        self.store
            .zadd(&queue_key(modality), user_id, entry.joined_at_ms as f64)
            .await?;
        self.metrics
            .counter(&format!("queue.join.{modality}"), 1);
        self.publish_size(modality).await;
        debug!("Enqueued");
        Ok(true)
    }

    /// Remove a user from a queue. Returns whether anything was removed.
    #[instrument(skip(self), fields(user_id = %user_id, modality = %modality))]
    pub async fn dequeue(&self, user_id: &str, modality: Modality) -> Result<bool> {
        let joined = self.store.zscore(&queue_key(modality), user_id).await?;
        let removed = self
            .store
            .zrem(&queue_key(modality), &[user_id.to_string()])
            .await?;
        self.store.delete(&entry_key(user_id)).await?;
        if removed == 0 {
            return Ok(false);
        }
        if let Some(joined_at) = joined {
            let waited = (self.clock.now_ms() as f64 - joined_at).max(0.0);
            self.metrics
                .histogram(&format!("queue.wait_ms.{modality}"), waited);
        }
        self.metrics
            .counter(&format!("queue.leave.{modality}"), 1);
        self.publish_size(modality).await;
        Ok(removed > 0)
    }

    /// Remove a user from whichever queue they are in, if any.
    pub async fn remove_from_all(&self, user_id: &str) -> Result<()> {
        match self.waiting_entry(user_id).await? {
            Some(entry) => {
                self.dequeue(user_id, entry.modality).await?;
            }
            None => {
                // No sidecar; clear any orphaned rank entries anyway.
                for modality in Modality::ALL {
                    self.store
                        .zrem(&queue_key(modality), &[user_id.to_string()])
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Atomically extract the caller and the best-matched partner.
    ///
    /// Under the matching lock, reads the two oldest entries. If the
    /// caller is one of them, both are removed together and the pair is
    /// returned; otherwise nothing changes and the caller keeps waiting.
    /// Lock contention and store refusal both surface as `Ok(None)`: the
    /// caller retries on a later tick.
    #[instrument(skip(self), fields(user_id = %user_id, modality = %modality))]
    pub async fn pair(&self, user_id: &str, modality: Modality) -> Result<Option<PairedEntries>> {
        let lock_key = pair_lock_key(modality);
        let Some(token) = self.store.try_acquire(&lock_key, self.pair_lock_ttl).await? else {
            return Ok(None);
        };
        let result = self.pair_locked(user_id, modality).await;
        if !self.store.release(&lock_key, &token).await.unwrap_or(false) {
            // TTL lapsed mid-extraction; the removal already happened
            // atomically, so this is only worth a log line.
            warn!(modality = %modality, "Matching lock expired before release");
        }
        result
    }

    async fn pair_locked(
        &self,
        user_id: &str,
        modality: Modality,
    ) -> Result<Option<PairedEntries>> {
        let key = queue_key(modality);
        let head = self.store.zrange(&key, 0, 1).await?;
        if head.len() < 2 {
            return Ok(None);
        }
        let Some(caller_rank) = head.iter().position(|m| m.member == user_id) else {
            // The caller is not at the front; the front pair belongs to
            // someone else's extraction.
            return Ok(None);
        };
        let caller_score = head[caller_rank].score;
        let partner_member = &head[1 - caller_rank];
        let partner_id = partner_member.member.clone();
        let partner_score = partner_member.score;

        let caller_entry = self.waiting_entry(user_id).await?;
        let partner_entry = self.waiting_entry(&partner_id).await?;

        // Both ranks go in one call: never just one of the top two.
        self.store
            .zrem(&key, &[user_id.to_string(), partner_id.clone()])
            .await?;

        match (caller_entry, partner_entry) {
            (Some(caller), Some(partner)) => {
                self.store.delete(&entry_key(user_id)).await?;
                self.store.delete(&entry_key(&partner_id)).await?;
                self.publish_size(modality).await;
                Ok(Some(PairedEntries { caller, partner }))
            }
            (Some(_caller), None) => {
                // Partner evaporated between rank and sidecar reads. Put
                // the caller back at the original position and let the
                // next tick try again.
                self.store
                    .zadd(&key, user_id, caller_score)
                    .await?;
                self.store.delete(&entry_key(&partner_id)).await?;
                debug!(partner_id = %partner_id, "Partner entry gone, caller requeued");
                Ok(None)
            }
            (None, partner) => {
                // The caller itself is a ghost (stale rank without data).
                // Keep the partner waiting and drop the ghost.
                if partner.is_some() {
                    self.store
                        .zadd(&key, &partner_id, partner_score)
                        .await?;
                }
                self.store.delete(&entry_key(user_id)).await?;
                debug!("Caller entry gone, dropping ghost rank");
                Ok(None)
            }
        }
    }

    /// Put an extracted entry back at its original score. Used when the
    /// session could not be created, so queue fairness is preserved.
    pub async fn restore(&self, entry: &WaitingEntry) -> Result<()> {
        self.store
            .set(
                &entry_key(&entry.user_id),
                &serde_json::to_string(entry)?,
                Some(self.entry_ttl()),
            )
            .await?;
        self.store
            .zadd(
                &queue_key(entry.modality),
                &entry.user_id,
                entry.joined_at_ms as f64,
            )
            .await?;
        Ok(())
    }

    /// 1-based queue position, 0 when absent.
    pub async fn position(&self, user_id: &str, modality: Modality) -> Result<u64> {
        Ok(self
            .store
            .zrank(&queue_key(modality), user_id)
            .await?
            .map(|rank| rank + 1)
            .unwrap_or(0))
    }

    /// Number of users waiting in a queue.
    pub async fn queue_size(&self, modality: Modality) -> Result<u64> {
        Ok(self.store.zcard(&queue_key(modality)).await?)
    }

    /// The longest-waiting user in a queue.
    pub async fn oldest(&self, modality: Modality) -> Result<Option<String>> {
        Ok(self
            .store
            .zrange(&queue_key(modality), 0, 0)
            .await?
            .into_iter()
            .next()
            .map(|m| m.member))
    }

    /// The sidecar entry for a waiting user, across all modalities.
    pub async fn waiting_entry(&self, user_id: &str) -> Result<Option<WaitingEntry>> {
        match self.store.get(&entry_key(user_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Drop entries that outlived the queue timeout. Returns how many were
    /// removed across all modalities.
    #[instrument(skip(self))]
    pub async fn sweep_stale(&self) -> Result<u64> {
        let cutoff = (self.clock.now_ms() - self.queue_timeout.as_millis() as i64) as f64;
        let mut swept = 0;
        for modality in Modality::ALL {
            let key = queue_key(modality);
            let stale = self
                .store
                .zrange_by_score(&key, f64::NEG_INFINITY, cutoff)
                .await?;
            if stale.is_empty() {
                continue;
            }
            let members: Vec<String> = stale.iter().map(|m| m.member.clone()).collect();
            let removed = self.store.zrem(&key, &members).await?;
            for member in &members {
                self.store.delete(&entry_key(member)).await?;
            }
            swept += removed;
            self.metrics
                .counter(&format!("queue.leave.timeout.{modality}"), removed);
            self.publish_size(modality).await;
            debug!(modality = %modality, removed, "Swept stale queue entries");
        }
        Ok(swept)
    }

    async fn publish_size(&self, modality: Modality) {
        if let Ok(size) = self.store.zcard(&queue_key(modality)).await {
            self.metrics
                .gauge(&format!("queue.size.{modality}"), size as f64);
        }
    }
}
