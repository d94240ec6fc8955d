// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-session message relay.
//!
//! Chat and WebRTC signaling pass through the server untouched: the relay
//! resolves the partner, stamps chat lines, and hands the frame to the
//! registry. The server holds no call state beyond the pairing itself,
//! and chat bodies are never written anywhere.

use std::sync::Arc;

use tracing::{debug, instrument};

use duet_protocol::{DisconnectReason, ServerMessage};

use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::metrics::MetricsSink;
use crate::pairing::{MatchOutcome, PairingEngine};
use crate::registry::SocketRegistry;
use crate::session::{EndReason, SessionManager};

/// Longest accepted chat line, in characters.
const MAX_CHAT_LEN: usize = 1000;

/// Relay for in-session traffic.
pub struct Relay {
    sessions: Arc<SessionManager>,
    registry: Arc<SocketRegistry>,
    pairing: Arc<PairingEngine>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl Relay {
    /// Create a relay over the given managers.
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<SocketRegistry>,
        pairing: Arc<PairingEngine>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            sessions,
            registry,
            pairing,
            clock,
            metrics,
        }
    }

    /// Deliver a chat line to the partner.
    #[instrument(skip(self, text), fields(user_id = %user_id))]
    pub async fn chat_message(&self, user_id: &str, text: &str) -> Result<()> {
        if text.is_empty() {
            return Err(CoreError::Validation {
                field: "text".to_string(),
                message: "message is empty".to_string(),
            });
        }
        if text.chars().count() > MAX_CHAT_LEN {
            return Err(CoreError::Validation {
                field: "text".to_string(),
                message: format!("message exceeds {MAX_CHAT_LEN} characters"),
            });
        }
        let Some((session, partner)) = self.sessions.partner_of(user_id).await? else {
            return Err(CoreError::NotInSession {
                user_id: user_id.to_string(),
            });
        };
        self.registry
            .emit_to_user(
                &partner,
                ServerMessage::ChatMessage {
                    sender_id: user_id.to_string(),
                    text: text.to_string(),
                    timestamp: self.clock.now_ms(),
                },
            )
            .await?;
        // Chat is activity: keep the session from expiring under it.
        self.sessions.extend(&session.session_id).await?;
        self.metrics.counter("chat.messages", 1);
        Ok(())
    }

    /// Relay a typing indicator. Ephemeral, no payload.
    pub async fn typing(&self, user_id: &str, stopped: bool) -> Result<()> {
        let Some((_, partner)) = self.sessions.partner_of(user_id).await? else {
            return Err(CoreError::NotInSession {
                user_id: user_id.to_string(),
            });
        };
        let message = if stopped {
            ServerMessage::ChatStopTyping
        } else {
            ServerMessage::ChatTyping
        };
        self.registry.emit_to_user(&partner, message).await?;
        Ok(())
    }

    /// Relay an opaque WebRTC signaling frame.
    ///
    /// Dropped silently when there is no partner; that race is routine at
    /// call teardown.
    pub async fn call_signal(&self, user_id: &str, message: ServerMessage) -> Result<()> {
        let Some((_, partner)) = self.sessions.partner_of(user_id).await? else {
            debug!(user_id = %user_id, "Dropping signaling frame without a partner");
            return Ok(());
        };
        self.registry.emit_to_user(&partner, message).await?;
        Ok(())
    }

    /// Hang up: tell the partner, then end the session.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn call_end(&self, user_id: &str) -> Result<()> {
        let Some((session, partner)) = self.sessions.partner_of(user_id).await? else {
            // Both sides hanging up at once is normal; nothing to do.
            return Ok(());
        };
        self.registry
            .emit_to_user(&partner, ServerMessage::CallEnd)
            .await?;
        self.sessions
            .end(&session.session_id, EndReason::Normal)
            .await?;
        Ok(())
    }

    /// Skip: tell the partner they were skipped, end the session, and put
    /// the skipper back in the queue of the same modality.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn match_next(
        &self,
        user_id: &str,
        socket_id: &str,
        username: &str,
    ) -> Result<MatchOutcome> {
        let Some((session, partner)) = self
            .sessions
            .end_for_user(user_id, EndReason::Skip)
            .await?
        else {
            return Err(CoreError::NotInSession {
                user_id: user_id.to_string(),
            });
        };
        self.registry
            .emit_to_user(
                &partner,
                ServerMessage::MatchDisconnected {
                    reason: DisconnectReason::Skip,
                },
            )
            .await?;
        self.metrics.counter("session.skips", 1);
        self.pairing
            .rematch(user_id, socket_id, username, session.modality)
            .await
    }
}
