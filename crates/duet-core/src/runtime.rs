// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Composition root for the duet core.
//!
//! [`CoreRuntime`] wires the store, managers, and supervisor together and
//! owns every background task: the WebSocket server, the fleet heartbeat,
//! the queue sweeper, the session cleanup, the per-modality safety
//! matchers, and the directed-delivery subscriber. Embedders build one
//! with [`CoreRuntime::builder`], `start` it, and `shutdown` it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use duet_protocol::{DisconnectReason, Modality, ServerMessage};

use crate::clock::{Clock, SystemClock};
use crate::collaborators::{AuthProvider, Directory, GuestAuth, NullDirectory};
use crate::config::Config;
use crate::fleet::{FleetCoordinator, LoadSampler, SystemSampler};
use crate::metrics::{MetricsSink, NoopSink};
use crate::pairing::PairingEngine;
use crate::queue::QueueManager;
use crate::registry::SocketRegistry;
use crate::relay::Relay;
use crate::session::{EndReason, SessionManager};
use crate::store::{MemoryStore, SharedStore};
use crate::supervisor::ConnectionSupervisor;

/// Builder for a [`CoreRuntime`].
pub struct CoreRuntimeBuilder {
    config: Config,
    store: Option<Arc<dyn SharedStore>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    auth: Arc<dyn AuthProvider>,
    directory: Arc<dyn Directory>,
    sampler: Option<Arc<dyn LoadSampler>>,
}

impl std::fmt::Debug for CoreRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreRuntimeBuilder")
            .field("config", &self.config)
            .field("store", &self.store.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for CoreRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            store: None,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoopSink),
            auth: Arc::new(GuestAuth),
            directory: Arc::new(NullDirectory),
            sampler: None,
        }
    }
}

impl CoreRuntimeBuilder {
    /// Fresh builder with defaults (memory store, guest auth, no-op
    /// metrics).
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use this shared store. Defaults to the in-process memory store.
    pub fn store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this clock. Tests pass a manual clock here.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use this metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Use this auth collaborator.
    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    /// Use this directory collaborator.
    pub fn directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = directory;
        self
    }

    /// Use this load sampler. Defaults to the operating-system sampler.
    pub fn sampler(mut self, sampler: Arc<dyn LoadSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Assemble the runtime. No I/O happens until `start`.
    pub fn build(self) -> CoreRuntime {
        let config = self.config;
        let clock = self.clock;
        let metrics = self.metrics;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(clock.clone())));
        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(SystemSampler::new()));
        let shutdown = CancellationToken::new();
        let accepting = Arc::new(AtomicBool::new(true));

        let fleet = Arc::new(FleetCoordinator::new(
            config.public_host.clone(),
            config.bind_addr.port(),
            store.clone(),
            clock.clone(),
            metrics.clone(),
            sampler,
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
            self.directory.clone(),
            config.session_ttl,
            config.session_create_lock_ttl,
            config.max_session_duration,
        ));
        let pairing = Arc::new(PairingEngine::new(
            queues.clone(),
            sessions.clone(),
            registry.clone(),
            self.directory.clone(),
            metrics.clone(),
        ));
        let relay = Arc::new(Relay::new(
            sessions.clone(),
            registry.clone(),
            pairing.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            self.auth,
            self.directory,
            fleet.clone(),
            registry.clone(),
            queues.clone(),
            sessions.clone(),
            pairing.clone(),
            relay,
            metrics.clone(),
            clock.clone(),
            config.clone(),
            accepting.clone(),
            shutdown.clone(),
        ));

        CoreRuntime {
            config,
            fleet,
            registry,
            queues,
            sessions,
            pairing,
            supervisor,
            accepting,
            shutdown,
        }
    }
}

/// Assembled but not yet running core.
pub struct CoreRuntime {
    config: Config,
    fleet: Arc<FleetCoordinator>,
    registry: Arc<SocketRegistry>,
    queues: Arc<QueueManager>,
    sessions: Arc<SessionManager>,
    pairing: Arc<PairingEngine>,
    supervisor: Arc<ConnectionSupervisor>,
    accepting: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl CoreRuntime {
    /// Start building a runtime.
    pub fn builder() -> CoreRuntimeBuilder {
        CoreRuntimeBuilder::new()
    }

    /// Register with the fleet, bind the server, and spawn every
    /// background task.
    pub async fn start(self) -> Result<RunningCore> {
        self.fleet.register().await?;

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, instance_id = %self.fleet.instance_id(), "WebSocket server starting");

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let router = self.supervisor.clone().router();
        let server_shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
            {
                error!(error = %e, "WebSocket server error");
            }
        }));

        tasks.push(tokio::spawn(
            self.registry
                .clone()
                .run_fleet_subscriber(self.shutdown.clone()),
        ));

        // Heartbeat: refresh the instance record and presence, reap dead
        // instances, and push the fleet-wide user count to local sockets.
        {
            let fleet = self.fleet.clone();
            let registry = self.registry.clone();
            let shutdown = self.shutdown.clone();
            let interval = self.config.heartbeat_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = fleet.heartbeat(registry.connection_count()).await {
                                warn!(error = %e, "Heartbeat failed");
                                continue;
                            }
                            if let Err(e) = registry.refresh_all_presence().await {
                                warn!(error = %e, "Presence refresh failed");
                            }
                            if let Err(e) = fleet.reap_dead().await {
                                warn!(error = %e, "Instance reap failed");
                            }
                            match fleet.total_connections().await {
                                Ok(n) => {
                                    registry
                                        .broadcast_local(ServerMessage::UserCount { n })
                                        .await
                                }
                                Err(e) => warn!(error = %e, "User count failed"),
                            }
                        }
                    }
                }
            }));
        }

        // Stale-entry sweep.
        {
            let queues = self.queues.clone();
            let shutdown = self.shutdown.clone();
            let interval = self.config.queue_cleanup_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = queues.sweep_stale().await {
                                warn!(error = %e, "Queue sweep failed");
                            }
                        }
                    }
                }
            }));
        }

        // Session reconciliation.
        {
            let sessions = self.sessions.clone();
            let shutdown = self.shutdown.clone();
            let interval = self.config.session_cleanup_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = sessions.cleanup().await {
                                warn!(error = %e, "Session cleanup failed");
                            }
                        }
                    }
                }
            }));
        }

        // Safety matcher, one per modality.
        for modality in Modality::ALL {
            let pairing = self.pairing.clone();
            let shutdown = self.shutdown.clone();
            let interval = self.config.match_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = pairing.run_matcher_tick(modality).await {
                                warn!(modality = %modality, error = %e, "Safety matcher tick failed");
                            }
                        }
                    }
                }
            }));
        }

        info!("Core runtime started");
        Ok(RunningCore {
            config: self.config,
            fleet: self.fleet,
            registry: self.registry,
            sessions: self.sessions,
            shutdown: self.shutdown,
            accepting: self.accepting,
            local_addr,
            tasks,
        })
    }
}

/// A started core; holds every spawned task.
pub struct RunningCore {
    config: Config,
    fleet: Arc<FleetCoordinator>,
    registry: Arc<SocketRegistry>,
    sessions: Arc<SessionManager>,
    shutdown: CancellationToken,
    accepting: Arc<AtomicBool>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningCore {
    /// Address the server actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether new connections are still admitted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Graceful shutdown: notify and end local sessions within the grace
    /// window, deregister from the fleet, then stop every task.
    pub async fn shutdown(mut self) {
        info!("Shutting down");
        self.accepting.store(false, Ordering::SeqCst);

        let grace = self.config.shutdown_grace;
        let registry = self.registry.clone();
        let sessions = self.sessions.clone();
        let notify = async {
            for user_id in registry.local_users() {
                match sessions.end_for_user(&user_id, EndReason::Disconnect).await {
                    Ok(Some((_, partner))) => {
                        let farewell = ServerMessage::MatchDisconnected {
                            reason: DisconnectReason::Shutdown,
                        };
                        let _ = registry.emit_to_user(&user_id, farewell.clone()).await;
                        let _ = registry.emit_to_user(&partner, farewell).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Session teardown failed during shutdown")
                    }
                }
            }
        };
        if tokio::time::timeout(grace, notify).await.is_err() {
            warn!("Shutdown notifications exceeded the grace window");
        }
        // Let the per-socket pumps flush the farewell frames before the
        // connection tasks are cancelled.
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;

        if let Err(e) = self.fleet.deregister().await {
            warn!(error = %e, "Fleet deregistration failed");
        }

        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("Background task did not stop within the grace window");
            }
        }
        info!("Shutdown complete");
    }
}
