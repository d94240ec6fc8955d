// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection supervision: upgrade, handshake, dispatch, teardown.
//!
//! One task per socket. The first frame must be `auth {token}`; after a
//! successful handshake the task loops over inbound frames and the
//! socket's outbound queue. Inbound frames are dispatched by matching the
//! tagged message enum, one handler per type. Handlers run serially per
//! socket, so per-socket ordering holds end to end. Disconnect runs the
//! cleanup cascade under a bounded grace deadline, swallowing errors.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use duet_protocol::{ClientMessage, DisconnectReason, ServerMessage};

use crate::clock::Clock;
use crate::collaborators::{AuthClaims, AuthProvider, Directory, Report};
use crate::config::Config;
use crate::error::CoreError;
use crate::fleet::FleetCoordinator;
use crate::metrics::MetricsSink;
use crate::pairing::PairingEngine;
use crate::queue::QueueManager;
use crate::rate_limit::{ConnectLimiter, SocketLimits};
use crate::registry::{SocketHandle, SocketRegistry};
use crate::relay::Relay;
use crate::session::{EndReason, SessionManager};

/// How long a fresh socket gets to present its auth frame.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// Everything a connection needs, owned by the composition root.
pub struct ConnectionSupervisor {
    auth: Arc<dyn AuthProvider>,
    directory: Arc<dyn Directory>,
    fleet: Arc<FleetCoordinator>,
    registry: Arc<SocketRegistry>,
    queues: Arc<QueueManager>,
    sessions: Arc<SessionManager>,
    pairing: Arc<PairingEngine>,
    relay: Arc<Relay>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    config: Config,
    connect_limiter: ConnectLimiter,
    accepting: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl ConnectionSupervisor {
    /// Wire the supervisor to its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        directory: Arc<dyn Directory>,
        fleet: Arc<FleetCoordinator>,
        registry: Arc<SocketRegistry>,
        queues: Arc<QueueManager>,
        sessions: Arc<SessionManager>,
        pairing: Arc<PairingEngine>,
        relay: Arc<Relay>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        config: Config,
        accepting: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> Self {
        let connect_limiter = ConnectLimiter::new(config.rate_ws_connect_per_min);
        Self {
            auth,
            directory,
            fleet,
            registry,
            queues,
            sessions,
            pairing,
            relay,
            metrics,
            clock,
            config,
            connect_limiter,
            accepting,
            shutdown,
        }
    }

    /// The HTTP surface: the WebSocket endpoint and a liveness probe.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(Self::upgrade))
            .route("/health", get(Self::health))
            .with_state(self)
    }

    async fn health(State(supervisor): State<Arc<Self>>) -> impl IntoResponse {
        Json(serde_json::json!({
            "status": "ok",
            "instanceId": supervisor.fleet.instance_id(),
            "connections": supervisor.registry.connection_count(),
        }))
    }

    async fn upgrade(
        State(supervisor): State<Arc<Self>>,
        ConnectInfo(addr): ConnectInfo<SocketAddr>,
        ws: WebSocketUpgrade,
    ) -> Response {
        if !supervisor.connect_limiter.allow(addr.ip()) {
            supervisor.metrics.counter("ws.refused.rate_limited", 1);
            return (StatusCode::TOO_MANY_REQUESTS, "connection rate exceeded").into_response();
        }
        if !supervisor.accepting.load(Ordering::SeqCst) || !supervisor.fleet.should_accept() {
            supervisor.metrics.counter("ws.refused.overloaded", 1);
            return (StatusCode::SERVICE_UNAVAILABLE, "instance at capacity").into_response();
        }
        ws.on_upgrade(move |socket| async move {
            supervisor.handle_socket(socket, addr).await;
        })
    }

    #[instrument(skip(self, socket), fields(remote = %addr))]
    async fn handle_socket(self: Arc<Self>, socket: WebSocket, addr: SocketAddr) {
        let (mut sink, mut stream) = socket.split();

        let Some(claims) = self.handshake(&mut sink, &mut stream).await else {
            let _ = sink.close().await;
            return;
        };

        let socket_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::channel::<ServerMessage>(self.config.socket_send_buffer);
        let conn_cancel = self.shutdown.child_token();

        let handle = SocketHandle::new(
            socket_id.clone(),
            claims.user_id.clone(),
            claims.username.clone(),
            self.clock.now(),
            tx.clone(),
            conn_cancel.clone(),
        );
        if let Err(e) = self.registry.register(handle).await {
            warn!(error = %e, "Socket registration failed");
            let _ = send_frame(
                &mut sink,
                &ServerMessage::AuthError {
                    message: "service busy, try again".to_string(),
                },
                self.config.socket_write_timeout,
            )
            .await;
            let _ = sink.close().await;
            return;
        }

        if send_frame(
            &mut sink,
            &ServerMessage::AuthSuccess {
                socket_id: socket_id.clone(),
                user_id: claims.user_id.clone(),
                username: claims.username.clone(),
            },
            self.config.socket_write_timeout,
        )
        .await
        .is_err()
        {
            let _ = self.disconnect_cleanup(&claims.user_id, &socket_id).await;
            return;
        }

        info!(user_id = %claims.user_id, socket_id = %socket_id, "Socket connected");

        let mut limits = SocketLimits::new(
            self.config.rate_ws_msg_per_sec,
            self.config.rate_queue_join_per_5s,
        );

        loop {
            tokio::select! {
                _ = conn_cancel.cancelled() => {
                    debug!("Connection cancelled");
                    break;
                }
                outbound = rx.recv() => {
                    let Some(frame) = outbound else { break };
                    if send_frame(&mut sink, &frame, self.config.socket_write_timeout)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            let replies = self
                                .handle_frame(&claims, &socket_id, &mut limits, text.as_str())
                                .await;
                            let mut failed = false;
                            for reply in replies {
                                if send_frame(&mut sink, &reply, self.config.socket_write_timeout)
                                    .await
                                    .is_err()
                                {
                                    failed = true;
                                    break;
                                }
                            }
                            if failed {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {} // pings are answered by the protocol layer
                        Some(Err(e)) => {
                            debug!(error = %e, "Socket read failed");
                            break;
                        }
                    }
                }
            }
        }

        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, self.disconnect_cleanup(&claims.user_id, &socket_id))
            .await
            .is_err()
        {
            warn!(user_id = %claims.user_id, "Disconnect cleanup exceeded its grace window");
        }
        info!(user_id = %claims.user_id, socket_id = %socket_id, "Socket closed");
    }

    /// Read and verify the opening `auth` frame.
    async fn handshake(
        &self,
        sink: &mut SplitSink<WebSocket, Message>,
        stream: &mut SplitStream<WebSocket>,
    ) -> Option<AuthClaims> {
        let refuse = |message: &str| ServerMessage::AuthError {
            message: message.to_string(),
        };

        let first = match tokio::time::timeout(AUTH_DEADLINE, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(_) => {
                let _ = send_frame(
                    sink,
                    &refuse("expected auth frame"),
                    self.config.socket_write_timeout,
                )
                .await;
                return None;
            }
            Err(_) => {
                let _ = send_frame(
                    sink,
                    &refuse("auth timeout"),
                    self.config.socket_write_timeout,
                )
                .await;
                return None;
            }
        };

        let token = match serde_json::from_str::<ClientMessage>(first.as_str()) {
            Ok(ClientMessage::Auth { token }) => token,
            _ => {
                let _ = send_frame(
                    sink,
                    &refuse("expected auth frame"),
                    self.config.socket_write_timeout,
                )
                .await;
                return None;
            }
        };

        let Some(claims) = self.auth.verify_access_token(&token).await else {
            self.metrics.counter("errors.auth", 1);
            let _ = send_frame(
                sink,
                &refuse("invalid or expired token"),
                self.config.socket_write_timeout,
            )
            .await;
            return None;
        };

        if self.directory.is_banned(&claims.user_id).await {
            self.metrics.counter("errors.auth", 1);
            let _ = send_frame(
                sink,
                &refuse("account banned"),
                self.config.socket_write_timeout,
            )
            .await;
            return None;
        }

        Some(claims)
    }

    /// Dispatch one inbound frame. Replies are for this socket only;
    /// anything aimed at the partner goes through the registry.
    async fn handle_frame(
        &self,
        claims: &AuthClaims,
        socket_id: &str,
        limits: &mut SocketLimits,
        raw: &str,
    ) -> Vec<ServerMessage> {
        if limits.allow_message().is_err() {
            self.metrics.counter("ws.rate_limited", 1);
            return vec![self.error_frame(CoreError::RateLimited {
                limit: "messages".to_string(),
            })];
        }

        let message = match serde_json::from_str::<ClientMessage>(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Undecodable client frame");
                return vec![self.error_frame(CoreError::Validation {
                    field: "message".to_string(),
                    message: "invalid message format".to_string(),
                })];
            }
        };

        let user_id = &claims.user_id;
        match message {
            ClientMessage::Auth { .. } => vec![self.error_frame(CoreError::Validation {
                field: "type".to_string(),
                message: "already authenticated".to_string(),
            })],

            ClientMessage::QueueJoin { session_type } => {
                if limits.allow_queue_join().is_err() {
                    self.metrics.counter("ws.rate_limited", 1);
                    return vec![ServerMessage::QueueError {
                        message: "joining too often, slow down".to_string(),
                    }];
                }
                match self
                    .pairing
                    .quick_match(user_id, socket_id, &claims.username, session_type)
                    .await
                {
                    Ok(_) => Vec::new(),
                    Err(e) => vec![self.queue_error(e)],
                }
            }

            ClientMessage::QueueLeave { session_type } => {
                match self.pairing.cancel(user_id, session_type).await {
                    Ok(true) => Vec::new(),
                    Ok(false) => vec![self.queue_error(CoreError::NotInQueue {
                        user_id: user_id.clone(),
                    })],
                    Err(e) => vec![self.queue_error(e)],
                }
            }

            ClientMessage::MatchNext => {
                match self
                    .relay
                    .match_next(user_id, socket_id, &claims.username)
                    .await
                {
                    Ok(_) => Vec::new(),
                    Err(e) => vec![self.match_error(e)],
                }
            }

            ClientMessage::CallOffer { sdp } => {
                self.relay_signal(user_id, ServerMessage::CallOffer { sdp })
                    .await
            }
            ClientMessage::CallAnswer { sdp } => {
                self.relay_signal(user_id, ServerMessage::CallAnswer { sdp })
                    .await
            }
            ClientMessage::CallIce { candidate } => {
                self.relay_signal(user_id, ServerMessage::CallIce { candidate })
                    .await
            }

            ClientMessage::CallEnd => match self.relay.call_end(user_id).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![self.call_error(e)],
            },

            ClientMessage::ChatMessage { text } => {
                match self.relay.chat_message(user_id, &text).await {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![self.error_frame(e)],
                }
            }

            ClientMessage::ChatTyping => match self.relay.typing(user_id, false).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![self.error_frame(e)],
            },
            ClientMessage::ChatStopTyping => match self.relay.typing(user_id, true).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![self.error_frame(e)],
            },

            ClientMessage::FriendCall {
                friend_id,
                session_type,
            } => {
                if claims.is_guest {
                    return vec![ServerMessage::MatchError {
                        message: "guest accounts cannot call friends".to_string(),
                    }];
                }
                if !self.directory.are_friends(user_id, &friend_id).await {
                    return vec![ServerMessage::MatchError {
                        message: "you are not friends with that user".to_string(),
                    }];
                }
                match self
                    .pairing
                    .with_friend(user_id, &friend_id, session_type)
                    .await
                {
                    Ok(_) => Vec::new(),
                    Err(e) => vec![self.match_error(e)],
                }
            }

            ClientMessage::ReportUser {
                reported_user_id,
                reason,
                description,
                session_id,
            } => {
                self.handle_report(claims, reported_user_id, reason, description, session_id)
                    .await
            }
        }
    }

    async fn relay_signal(&self, user_id: &str, frame: ServerMessage) -> Vec<ServerMessage> {
        match self.relay.call_signal(user_id, frame).await {
            Ok(()) => Vec::new(),
            Err(e) => vec![self.call_error(e)],
        }
    }

    async fn handle_report(
        &self,
        claims: &AuthClaims,
        reported_user_id: String,
        reason: String,
        description: Option<String>,
        session_id: Option<String>,
    ) -> Vec<ServerMessage> {
        if claims.is_guest {
            return vec![self.error_frame(CoreError::Validation {
                field: "type".to_string(),
                message: "guest accounts cannot file reports".to_string(),
            })];
        }
        if reason.trim().is_empty() {
            return vec![self.error_frame(CoreError::Validation {
                field: "reason".to_string(),
                message: "reason is required".to_string(),
            })];
        }
        if reported_user_id.is_empty() || reported_user_id == claims.user_id {
            return vec![self.error_frame(CoreError::Validation {
                field: "reportedUserId".to_string(),
                message: "invalid report target".to_string(),
            })];
        }
        let report = Report {
            report_id: Uuid::new_v4().to_string(),
            reporter_id: claims.user_id.clone(),
            reported_id: reported_user_id,
            session_id,
            reason,
            description,
            created_at: self.clock.now(),
        };
        self.directory.record_report(report).await;
        self.metrics.counter("reports.filed", 1);
        Vec::new()
    }

    /// Cascade cleanup after a socket goes away. Best-effort: every error
    /// is logged and swallowed.
    async fn disconnect_cleanup(&self, user_id: &str, socket_id: &str) {
        if let Err(e) = self.queues.remove_from_all(user_id).await {
            warn!(user_id = %user_id, error = %e, "Queue cleanup failed on disconnect");
        }
        match self
            .sessions
            .end_for_user(user_id, EndReason::Disconnect)
            .await
        {
            Ok(Some((_, partner))) => {
                if let Err(e) = self
                    .registry
                    .emit_to_user(
                        &partner,
                        ServerMessage::MatchDisconnected {
                            reason: DisconnectReason::Disconnect,
                        },
                    )
                    .await
                {
                    warn!(partner = %partner, error = %e, "Partner notification failed on disconnect");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Session cleanup failed on disconnect");
            }
        }
        if let Err(e) = self.registry.unregister(socket_id).await {
            warn!(socket_id = %socket_id, error = %e, "Unregister failed on disconnect");
        }
    }

    fn error_frame(&self, error: CoreError) -> ServerMessage {
        self.count_error(&error);
        ServerMessage::Error {
            code: error.error_code().to_string(),
            message: error.to_string(),
        }
    }

    fn queue_error(&self, error: CoreError) -> ServerMessage {
        self.count_error(&error);
        ServerMessage::QueueError {
            message: error.to_string(),
        }
    }

    fn match_error(&self, error: CoreError) -> ServerMessage {
        self.count_error(&error);
        ServerMessage::MatchError {
            message: error.to_string(),
        }
    }

    fn call_error(&self, error: CoreError) -> ServerMessage {
        self.count_error(&error);
        ServerMessage::CallError {
            message: error.to_string(),
        }
    }

    fn count_error(&self, error: &CoreError) {
        self.metrics
            .counter(&format!("errors.{}", error.subsystem()), 1);
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &ServerMessage,
    timeout: Duration,
) -> std::result::Result<(), ()> {
    let payload = serde_json::to_string(frame).map_err(|e| {
        warn!(error = %e, "Failed to encode server frame");
    })?;
    match tokio::time::timeout(timeout, sink.send(Message::Text(payload.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "Socket write failed");
            Err(())
        }
        Err(_) => {
            debug!("Socket write timed out");
            Err(())
        }
    }
}
