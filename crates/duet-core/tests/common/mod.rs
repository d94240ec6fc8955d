// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for duet-core integration tests.
//!
//! Provides a TestContext wiring the in-memory store, a manual clock, a
//! recording metrics sink, and a recording directory, plus fake sockets
//! that capture everything the registry delivers to them.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use duet_protocol::ServerMessage;

use duet_core::clock::ManualClock;
use duet_core::collaborators::{Directory, Report, UserProfile};
use duet_core::config::Config;
use duet_core::fleet::{FleetCoordinator, StaticSampler};
use duet_core::metrics::RecordingSink;
use duet_core::pairing::PairingEngine;
use duet_core::queue::QueueManager;
use duet_core::registry::{SocketHandle, SocketRegistry};
use duet_core::relay::Relay;
use duet_core::session::SessionManager;
use duet_core::store::MemoryStore;

/// A directory fake that records every call and answers from fixtures.
#[derive(Default)]
pub struct RecordingDirectory {
    pub users: Mutex<HashMap<String, String>>,
    pub friends: Mutex<HashSet<(String, String)>>,
    pub banned: Mutex<HashSet<String>>,
    pub reports: Mutex<Vec<Report>>,
    pub ended_sessions: Mutex<Vec<(String, String)>>,
}

impl RecordingDirectory {
    pub fn add_user(&self, user_id: &str, username: &str) {
        self.users
            .lock()
            .unwrap()
            .insert(user_id.to_string(), username.to_string());
    }

    pub fn add_friends(&self, a: &str, b: &str) {
        let mut friends = self.friends.lock().unwrap();
        friends.insert((a.to_string(), b.to_string()));
        friends.insert((b.to_string(), a.to_string()));
    }

    pub fn ban(&self, user_id: &str) {
        self.banned.lock().unwrap().insert(user_id.to_string());
    }

    pub fn ended_reasons(&self, session_id: &str) -> Vec<String> {
        self.ended_sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == session_id)
            .map(|(_, reason)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl Directory for RecordingDirectory {
    async fn find_user(&self, user_id: &str) -> Option<UserProfile> {
        self.users
            .lock()
            .unwrap()
            .get(user_id)
            .map(|username| UserProfile {
                user_id: user_id.to_string(),
                username: username.clone(),
            })
    }

    async fn is_banned(&self, user_id: &str) -> bool {
        self.banned.lock().unwrap().contains(user_id)
    }

    async fn are_friends(&self, a: &str, b: &str) -> bool {
        self.friends
            .lock()
            .unwrap()
            .contains(&(a.to_string(), b.to_string()))
    }

    async fn record_report(&self, report: Report) {
        self.reports.lock().unwrap().push(report);
    }

    async fn record_session_ended(
        &self,
        session_id: &str,
        _started_at: DateTime<Utc>,
        _ended_at: DateTime<Utc>,
        reason: &str,
    ) {
        self.ended_sessions
            .lock()
            .unwrap()
            .push((session_id.to_string(), reason.to_string()));
    }
}

/// A registered fake socket capturing delivered frames.
pub struct TestSocket {
    pub socket_id: String,
    pub user_id: String,
    pub cancel: CancellationToken,
    rx: mpsc::Receiver<ServerMessage>,
}

impl TestSocket {
    /// Next delivered frame, or panic after a short wait.
    pub async fn recv(&mut self) -> ServerMessage {
        tokio::time::timeout(Duration::from_millis(500), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket channel closed")
    }

    /// Next delivered frame if one arrives in time.
    pub async fn try_recv(&mut self) -> Option<ServerMessage> {
        tokio::time::timeout(Duration::from_millis(100), self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Everything currently queued.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Wait for a frame matching the predicate, skipping others.
    pub async fn recv_until<F>(&mut self, mut matches: F) -> ServerMessage
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        for _ in 0..20 {
            let frame = self.recv().await;
            if matches(&frame) {
                return frame;
            }
        }
        panic!("expected frame never arrived");
    }
}

/// All core components over one shared in-memory store.
pub struct TestContext {
    pub config: Config,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub metrics: Arc<RecordingSink>,
    pub directory: Arc<RecordingDirectory>,
    pub sampler: Arc<StaticSampler>,
    pub fleet: Arc<FleetCoordinator>,
    pub registry: Arc<SocketRegistry>,
    pub queues: Arc<QueueManager>,
    pub sessions: Arc<SessionManager>,
    pub pairing: Arc<PairingEngine>,
    pub relay: Arc<Relay>,
}

impl TestContext {
    /// Wire a fresh context with the default configuration and an idle
    /// load sample.
    pub fn new() -> Self {
        Self::with_instance("test-instance")
    }

    /// Same, but with a chosen instance id (for cross-instance tests,
    /// share the store and clock between two contexts).
    pub fn with_instance(instance_id: &str) -> Self {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        Self::over_store(instance_id, clock, store)
    }

    /// Build a context over an existing store and clock.
    pub fn over_store(
        instance_id: &str,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
    ) -> Self {
        let mut config = Config::default();
        // Short write timeout so backpressure tests finish quickly.
        config.socket_write_timeout = Duration::from_millis(200);

        let metrics = Arc::new(RecordingSink::new());
        let directory = Arc::new(RecordingDirectory::default());
        let sampler = Arc::new(StaticSampler::new(10.0, 20.0));

        let fleet = Arc::new(FleetCoordinator::new(
            instance_id.to_string(),
            config.bind_addr.port(),
            store.clone(),
            clock.clone(),
            metrics.clone(),
            sampler.clone(),
            config.instance_ttl,
        ));
        let registry = Arc::new(SocketRegistry::new(
            fleet.instance_id().to_string(),
            store.clone(),
            clock.clone(),
            metrics.clone(),
            config.instance_ttl,
            config.socket_write_timeout,
        ));
        let queues = Arc::new(QueueManager::new(
            store.clone(),
            clock.clone(),
            metrics.clone(),
            config.queue_timeout,
            config.pair_lock_ttl,
        ));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            clock.clone(),
            metrics.clone(),
            directory.clone(),
            config.session_ttl,
            config.session_create_lock_ttl,
            config.max_session_duration,
        ));
        let pairing = Arc::new(PairingEngine::new(
            queues.clone(),
            sessions.clone(),
            registry.clone(),
            directory.clone(),
            metrics.clone(),
        ));
        let relay = Arc::new(Relay::new(
            sessions.clone(),
            registry.clone(),
            pairing.clone(),
            clock.clone(),
            metrics.clone(),
        ));

        Self {
            config,
            clock,
            store,
            metrics,
            directory,
            sampler,
            fleet,
            registry,
            queues,
            sessions,
            pairing,
            relay,
        }
    }

    /// Register a fake socket for a user and capture its deliveries.
    pub async fn connect(&self, user_id: &str) -> TestSocket {
        self.connect_with_buffer(user_id, self.config.socket_send_buffer)
            .await
    }

    /// Register a fake socket with a chosen outbound buffer size.
    pub async fn connect_with_buffer(&self, user_id: &str, buffer: usize) -> TestSocket {
        let socket_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();
        let handle = SocketHandle::new(
            socket_id.clone(),
            user_id.to_string(),
            user_id.to_string(),
            Utc::now(),
            tx,
            cancel.clone(),
        );
        self.registry
            .register(handle)
            .await
            .expect("socket registration failed");
        TestSocket {
            socket_id,
            user_id: user_id.to_string(),
            cancel,
            rx,
        }
    }
}
