// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Socket registry and cross-instance delivery.
//!
//! Each instance owns the sockets it accepted: a `user -> sockets` map and
//! a `socket -> handle` map behind a local mutex. Delivery to a user goes
//! to local sockets when there are any, otherwise onto a fleet-wide
//! directed channel that every instance subscribes to; whichever instances
//! hold that user's sockets deliver. The mutex is never held across a
//! store call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use duet_protocol::ServerMessage;

use crate::clock::Clock;
use crate::error::CoreError;
use crate::metrics::MetricsSink;
use crate::store::SharedStore;

/// Fleet-wide channel for messages targeted at a single user.
pub const DIRECT_CHANNEL: &str = "fleet:direct";
/// Fleet-wide channel for user online/offline transitions.
pub const USER_EVENTS_CHANNEL: &str = "fleet:user-events";

/// Stale socket counters self-destruct after this long without a refresh.
const SOCKET_COUNT_TTL: Duration = Duration::from_secs(3600);

/// One accepted WebSocket connection.
#[derive(Clone)]
pub struct SocketHandle {
    /// Server-assigned socket id.
    pub socket_id: String,
    /// Authenticated owner.
    pub user_id: String,
    /// Display name from the auth claims.
    pub username: String,
    /// Accept time.
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
}

impl SocketHandle {
    /// Build a handle around the connection's outbound queue and its
    /// cancellation token.
    pub fn new(
        socket_id: String,
        user_id: String,
        username: String,
        connected_at: DateTime<Utc>,
        sender: mpsc::Sender<ServerMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket_id,
            user_id,
            username,
            connected_at,
            sender,
            cancel,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    by_user: HashMap<String, HashSet<String>>,
    sockets: HashMap<String, SocketHandle>,
}

/// Message relayed across instances to whoever holds the target's sockets.
#[derive(Debug, Serialize, Deserialize)]
struct DirectedMessage {
    target_user_id: String,
    message: ServerMessage,
}

/// User online/offline transition broadcast to the fleet.
#[derive(Debug, Serialize, Deserialize)]
struct UserEvent {
    user_id: String,
    instance_id: String,
    online: bool,
}

/// Presence record kept alive while a user has any socket in the fleet.
#[derive(Debug, Serialize, Deserialize)]
struct PresenceRecord {
    user_id: String,
    instance_id: String,
    last_seen: i64,
}

/// Registry of this instance's sockets plus the fleet delivery plane.
pub struct SocketRegistry {
    instance_id: String,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    inner: Mutex<RegistryInner>,
    presence_ttl: Duration,
    write_timeout: Duration,
}

impl SocketRegistry {
    /// Create a registry for this instance.
    pub fn new(
        instance_id: String,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        presence_ttl: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            instance_id,
            store,
            clock,
            metrics,
            inner: Mutex::new(RegistryInner::default()),
            presence_ttl,
            write_timeout,
        }
    }

    fn socket_count_key(user_id: &str) -> String {
        format!("user-sockets:{user_id}")
    }

    fn presence_key(user_id: &str) -> String {
        format!("presence:{user_id}")
    }

    /// Register an accepted socket.
    ///
    /// The first socket a user holds anywhere in the fleet flips them
    /// online: the presence record is written and `user:online` published.
    pub async fn register(&self, handle: SocketHandle) -> Result<(), CoreError> {
        let user_id = handle.user_id.clone();
        let local_count = {
            let mut inner = self.inner.lock().expect("registry mutex poisoned");
            inner
                .by_user
                .entry(user_id.clone())
                .or_default()
                .insert(handle.socket_id.clone());
            inner.sockets.insert(handle.socket_id.clone(), handle);
            inner.sockets.len()
        };
        self.metrics.gauge("ws.connections", local_count as f64);

        let count_key = Self::socket_count_key(&user_id);
        let fleet_count = self.store.incr(&count_key, 1).await?;
        self.store.expire(&count_key, SOCKET_COUNT_TTL).await?;
        self.refresh_presence(&user_id).await?;

        if fleet_count == 1 {
            let event = UserEvent {
                user_id: user_id.clone(),
                instance_id: self.instance_id.clone(),
                online: true,
            };
            self.store
                .publish(USER_EVENTS_CHANNEL, &serde_json::to_string(&event)?)
                .await?;
            debug!(user_id = %user_id, "User online");
        }
        Ok(())
    }

    /// Unregister a socket, returning its owner if it was known.
    ///
    /// Presence transitions offline only when the user's last socket
    /// across the whole fleet is gone.
    pub async fn unregister(&self, socket_id: &str) -> Result<Option<String>, CoreError> {
        let (user_id, local_count) = {
            let mut inner = self.inner.lock().expect("registry mutex poisoned");
            let Some(handle) = inner.sockets.remove(socket_id) else {
                return Ok(None);
            };
            if let Some(set) = inner.by_user.get_mut(&handle.user_id) {
                set.remove(socket_id);
                if set.is_empty() {
                    inner.by_user.remove(&handle.user_id);
                }
            }
            (handle.user_id, inner.sockets.len())
        };
        self.metrics.gauge("ws.connections", local_count as f64);

        let count_key = Self::socket_count_key(&user_id);
        let fleet_count = self.store.incr(&count_key, -1).await?;
        if fleet_count <= 0 {
            self.store.delete(&count_key).await?;
            self.store.delete(&Self::presence_key(&user_id)).await?;
            let event = UserEvent {
                user_id: user_id.clone(),
                instance_id: self.instance_id.clone(),
                online: false,
            };
            self.store
                .publish(USER_EVENTS_CHANNEL, &serde_json::to_string(&event)?)
                .await?;
            debug!(user_id = %user_id, "User offline");
        }
        Ok(Some(user_id))
    }

    /// Re-arm the presence TTL for one user.
    pub async fn refresh_presence(&self, user_id: &str) -> Result<(), CoreError> {
        let record = PresenceRecord {
            user_id: user_id.to_string(),
            instance_id: self.instance_id.clone(),
            last_seen: self.clock.now_ms(),
        };
        self.store
            .set(
                &Self::presence_key(user_id),
                &serde_json::to_string(&record)?,
                Some(self.presence_ttl),
            )
            .await?;
        Ok(())
    }

    /// Re-arm presence for every user with a local socket. Runs on the
    /// heartbeat so presence outlives quiet connections.
    pub async fn refresh_all_presence(&self) -> Result<(), CoreError> {
        for user_id in self.local_users() {
            self.refresh_presence(&user_id).await?;
        }
        Ok(())
    }

    /// Deliver to a user wherever their sockets are.
    ///
    /// Local sockets get the frame directly; otherwise it is published on
    /// the directed channel and the holding instance delivers. Best-effort,
    /// at-most-once per socket.
    pub async fn emit_to_user(&self, user_id: &str, message: ServerMessage) -> Result<(), CoreError> {
        if self.deliver_local(user_id, &message).await {
            return Ok(());
        }
        let directed = DirectedMessage {
            target_user_id: user_id.to_string(),
            message,
        };
        self.store
            .publish(DIRECT_CHANNEL, &serde_json::to_string(&directed)?)
            .await?;
        Ok(())
    }

    /// Deliver to local sockets only. Returns whether any socket existed.
    async fn deliver_local(&self, user_id: &str, message: &ServerMessage) -> bool {
        let handles = self.local_handles(user_id);
        if handles.is_empty() {
            return false;
        }
        for handle in handles {
            self.enqueue_frame(&handle, message.clone()).await;
        }
        true
    }

    /// Send a frame to every local socket (counts, shutdown notices).
    pub async fn broadcast_local(&self, message: ServerMessage) {
        let handles: Vec<SocketHandle> = {
            let inner = self.inner.lock().expect("registry mutex poisoned");
            inner.sockets.values().cloned().collect()
        };
        for handle in handles {
            self.enqueue_frame(&handle, message.clone()).await;
        }
    }

    /// Queue a frame on one socket's outbound path.
    ///
    /// When the bounded queue is full, droppable frames are discarded;
    /// anything else gets a short blocking window and the socket is
    /// force-disconnected if that lapses, since a peer that far behind is
    /// not coming back.
    async fn enqueue_frame(&self, handle: &SocketHandle, message: ServerMessage) {
        match handle.sender.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                if message.is_droppable() {
                    self.metrics.counter("ws.frames_dropped", 1);
                    return;
                }
                match tokio::time::timeout(self.write_timeout, handle.sender.send(message)).await
                {
                    Ok(Ok(())) => {}
                    _ => {
                        warn!(
                            socket_id = %handle.socket_id,
                            user_id = %handle.user_id,
                            "Outbound queue stuck, force-disconnecting socket"
                        );
                        self.metrics.counter("ws.force_disconnects", 1);
                        handle.cancel.cancel();
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn local_handles(&self, user_id: &str) -> Vec<SocketHandle> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        let Some(socket_ids) = inner.by_user.get(user_id) else {
            return Vec::new();
        };
        socket_ids
            .iter()
            .filter_map(|id| inner.sockets.get(id).cloned())
            .collect()
    }

    /// Number of sockets this instance currently holds.
    pub fn connection_count(&self) -> u64 {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.sockets.len() as u64
    }

    /// Distinct users with at least one local socket.
    pub fn local_users(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_user.keys().cloned().collect()
    }

    /// Whether the user has a socket on this instance.
    pub fn is_local(&self, user_id: &str) -> bool {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_user.contains_key(user_id)
    }

    /// Run the directed-delivery subscriber until shutdown.
    ///
    /// Every instance subscribes on boot; each directed message is
    /// re-delivered locally, so exactly the instances holding the target's
    /// sockets forward it.
    pub async fn run_fleet_subscriber(self: Arc<Self>, shutdown: CancellationToken) {
        let mut subscription = match self.store.subscribe(DIRECT_CHANNEL).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(error = %e, "Directed-delivery subscription failed; cross-instance delivery disabled");
                return;
            }
        };
        info!(instance_id = %self.instance_id, "Fleet subscriber running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                payload = subscription.next() => {
                    let Some(payload) = payload else {
                        warn!("Directed-delivery subscription closed");
                        break;
                    };
                    let directed: DirectedMessage = match serde_json::from_str(&payload) {
                        Ok(directed) => directed,
                        Err(e) => {
                            warn!(error = %e, "Undecodable directed message, skipping");
                            continue;
                        }
                    };
                    self.deliver_local(&directed.target_user_id, &directed.message).await;
                }
            }
        }
        debug!("Fleet subscriber stopped");
    }
}
