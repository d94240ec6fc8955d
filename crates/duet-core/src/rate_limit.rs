// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rate limiting for connections and per-socket traffic.
//!
//! Token buckets with continuous refill. Connection attempts are limited
//! per IP through a bounded LRU of buckets; message and queue-join limits
//! are owned by the connection task, so they need no locking.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Instant;

use lru::LruCache;

/// Bounded number of per-IP buckets kept at once.
const MAX_TRACKED_IPS: usize = 10_000;

/// Token bucket with continuous fill.
///
/// The fill level is brought up to date lazily, whenever a consumer asks
/// for a token; nothing ticks in the background.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    fill_per_ms: f64,
    level: f64,
    topped_up_at: Instant,
}

impl TokenBucket {
    /// Bucket holding at most `capacity` tokens, filling at `per_second`
    /// tokens per second. Starts full.
    pub fn new(capacity: f64, per_second: f64) -> Self {
        Self {
            capacity,
            fill_per_ms: per_second / 1000.0,
            level: capacity,
            topped_up_at: Instant::now(),
        }
    }

    /// Try to consume one token.
    ///
    /// Returns `Err` with a retry-after hint in milliseconds when empty.
    pub fn try_consume(&mut self) -> Result<(), u64> {
        self.top_up();
        if self.level < 1.0 {
            let wait_ms = ((1.0 - self.level) / self.fill_per_ms).ceil().max(1.0);
            return Err(wait_ms as u64);
        }
        self.level -= 1.0;
        Ok(())
    }

    fn top_up(&mut self) {
        let now = Instant::now();
        let idle_ms = now.duration_since(self.topped_up_at).as_millis() as f64;
        if idle_ms > 0.0 {
            self.level = self.capacity.min(self.level + idle_ms * self.fill_per_ms);
            self.topped_up_at = now;
        }
    }
}

/// Per-IP connection-attempt limiter shared by all accept paths.
pub struct ConnectLimiter {
    buckets: Mutex<LruCache<IpAddr, TokenBucket>>,
    per_minute: u32,
}

impl ConnectLimiter {
    /// Allow `per_minute` connection attempts per source IP.
    pub fn new(per_minute: u32) -> Self {
        Self {
            buckets: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_IPS).expect("nonzero capacity"),
            )),
            per_minute,
        }
    }

    /// Whether a new connection from this IP is within its budget.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().expect("limiter mutex poisoned");
        let bucket = buckets.get_or_insert_mut(ip, || {
            TokenBucket::new(self.per_minute as f64, self.per_minute as f64 / 60.0)
        });
        bucket.try_consume().is_ok()
    }
}

/// Limits owned by a single connection task.
#[derive(Debug)]
pub struct SocketLimits {
    messages: TokenBucket,
    queue_joins: TokenBucket,
}

impl SocketLimits {
    /// `msg_per_sec` inbound frames per second; `joins_per_5s` queue joins
    /// per rolling five seconds.
    pub fn new(msg_per_sec: u32, joins_per_5s: u32) -> Self {
        Self {
            messages: TokenBucket::new(msg_per_sec as f64, msg_per_sec as f64),
            queue_joins: TokenBucket::new(joins_per_5s as f64, joins_per_5s as f64 / 5.0),
        }
    }

    /// Charge one inbound frame.
    pub fn allow_message(&mut self) -> Result<(), u64> {
        self.messages.try_consume()
    }

    /// Charge one queue join.
    pub fn allow_queue_join(&mut self) -> Result<(), u64> {
        self.queue_joins.try_consume()
    }
}
