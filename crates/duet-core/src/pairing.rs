// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration of queueing and session creation.
//!
//! The engine is parameterized on the queue and session managers at
//! construction; they never call back into it. `quick_match` is the fast
//! path a joining user runs inline; the per-modality safety tick re-runs
//! the same extraction on behalf of the oldest waiting user to mop up
//! races the fast path lost.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use duet_protocol::{Modality, ServerMessage};

use crate::collaborators::Directory;
use crate::error::{CoreError, Result};
use crate::metrics::MetricsSink;
use crate::queue::{PairedEntries, QueueManager, WaitingEntry};
use crate::registry::SocketRegistry;
use crate::session::{EndReason, Session, SessionManager};

/// Advertised per-position wait estimate.
const WAIT_PER_POSITION: Duration = Duration::from_secs(5);

/// What became of a match attempt.
#[derive(Debug, Clone)]
pub enum MatchOutcome {
    /// A partner was found and both sides were notified.
    Matched(Session),
    /// Still waiting; the caller was told its queue position.
    Queued {
        /// 1-based position in the queue.
        position: u64,
    },
}

/// A user's current standing with the matcher.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    /// Whether the user is waiting anywhere.
    pub in_queue: bool,
    /// The queue they are waiting in.
    pub modality: Option<Modality>,
    /// 1-based position, 0 when absent.
    pub position: u64,
    /// Rough wait estimate derived from the position.
    pub estimated_wait: Duration,
}

/// The pairing engine.
pub struct PairingEngine {
    queues: Arc<QueueManager>,
    sessions: Arc<SessionManager>,
    registry: Arc<SocketRegistry>,
    directory: Arc<dyn Directory>,
    metrics: Arc<dyn MetricsSink>,
}

impl PairingEngine {
    /// Create an engine over the given managers.
    pub fn new(
        queues: Arc<QueueManager>,
        sessions: Arc<SessionManager>,
        registry: Arc<SocketRegistry>,
        directory: Arc<dyn Directory>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            queues,
            sessions,
            registry,
            directory,
            metrics,
        }
    }

    /// Join a queue and immediately try to pair.
    ///
    /// A user already in an active session may not queue; a user already
    /// waiting anywhere may not queue twice.
    #[instrument(skip(self), fields(user_id = %user_id, modality = %modality))]
    pub async fn quick_match(
        &self,
        user_id: &str,
        socket_id: &str,
        username: &str,
        modality: Modality,
    ) -> Result<MatchOutcome> {
        if self.sessions.partner_of(user_id).await?.is_some() {
            return Err(CoreError::AlreadyInSession {
                user_id: user_id.to_string(),
            });
        }
        if !self
            .queues
            .enqueue(user_id, socket_id, username, modality)
            .await?
        {
            return Err(CoreError::AlreadyQueued {
                user_id: user_id.to_string(),
            });
        }
        self.attempt_pair(user_id, modality).await
    }

    /// Run one pair extraction on behalf of a waiting user.
    pub async fn attempt_pair(&self, user_id: &str, modality: Modality) -> Result<MatchOutcome> {
        match self.queues.pair(user_id, modality).await? {
            Some(pair) => self.create_and_notify(pair, modality).await,
            None => {
                let position = self.queues.position(user_id, modality).await?;
                self.registry
                    .emit_to_user(user_id, ServerMessage::QueuePosition { position })
                    .await?;
                Ok(MatchOutcome::Queued { position })
            }
        }
    }

    async fn create_and_notify(
        &self,
        pair: PairedEntries,
        modality: Modality,
    ) -> Result<MatchOutcome> {
        // The partner waited longer, so it becomes the session's first
        // member; ordering is cosmetic but stable.
        let session = match self
            .sessions
            .create(modality, &pair.partner.user_id, &pair.caller.user_id)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.metrics.counter("errors.pairing", 1);
                warn!(error = %e, "Session creation failed after extraction, requeueing");
                self.requeue_unless_in_session(&pair.caller).await;
                self.requeue_unless_in_session(&pair.partner).await;
                return Err(e);
            }
        };

        self.notify_matched(&session, &pair.caller, &pair.partner.username)
            .await;
        self.notify_matched(&session, &pair.partner, &pair.caller.username)
            .await;
        Ok(MatchOutcome::Matched(session))
    }

    /// Put an extracted entry back at its original score, unless the user
    /// ended up in a session after all (re-adding them would put one user
    /// in a queue and a session at once).
    async fn requeue_unless_in_session(&self, entry: &WaitingEntry) {
        match self.sessions.partner_of(&entry.user_id).await {
            Ok(Some(_)) => {}
            _ => {
                if let Err(e) = self.queues.restore(entry).await {
                    warn!(user_id = %entry.user_id, error = %e, "Failed to requeue after create failure");
                }
            }
        }
    }

    async fn notify_matched(&self, session: &Session, to: &WaitingEntry, partner_username: &str) {
        let Some(partner_id) = session.partner_of(&to.user_id) else {
            return;
        };
        let message = ServerMessage::MatchFound {
            session_id: session.session_id.clone(),
            partner_id: partner_id.to_string(),
            partner_username: partner_username.to_string(),
            session_type: session.modality,
        };
        if let Err(e) = self.registry.emit_to_user(&to.user_id, message).await {
            warn!(user_id = %to.user_id, error = %e, "Failed to deliver match notification");
        }
    }

    /// Leave a queue. Returns whether the user was actually waiting.
    pub async fn cancel(&self, user_id: &str, modality: Modality) -> Result<bool> {
        self.queues.dequeue(user_id, modality).await
    }

    /// Where a user currently stands with the matcher.
    pub async fn status(&self, user_id: &str) -> Result<QueueStatus> {
        let Some(entry) = self.queues.waiting_entry(user_id).await? else {
            return Ok(QueueStatus {
                in_queue: false,
                modality: None,
                position: 0,
                estimated_wait: Duration::ZERO,
            });
        };
        let position = self.queues.position(user_id, entry.modality).await?;
        let estimated_wait = WAIT_PER_POSITION * position.saturating_sub(1) as u32;
        Ok(QueueStatus {
            in_queue: true,
            modality: Some(entry.modality),
            position,
            estimated_wait,
        })
    }

    /// Start a session with a friend directly, bypassing the queue.
    #[instrument(skip(self), fields(user_id = %user_id, friend_id = %friend_id, modality = %modality))]
    pub async fn with_friend(
        &self,
        user_id: &str,
        friend_id: &str,
        modality: Modality,
    ) -> Result<Session> {
        if user_id == friend_id {
            return Err(CoreError::Validation {
                field: "friendId".to_string(),
                message: "cannot call yourself".to_string(),
            });
        }
        let session = self.sessions.create(modality, user_id, friend_id).await?;
        let user_name = self.display_name(user_id).await;
        let friend_name = self.display_name(friend_id).await;
        self.registry
            .emit_to_user(
                user_id,
                ServerMessage::MatchFound {
                    session_id: session.session_id.clone(),
                    partner_id: friend_id.to_string(),
                    partner_username: friend_name,
                    session_type: modality,
                },
            )
            .await?;
        self.registry
            .emit_to_user(
                friend_id,
                ServerMessage::MatchFound {
                    session_id: session.session_id.clone(),
                    partner_id: user_id.to_string(),
                    partner_username: user_name,
                    session_type: modality,
                },
            )
            .await?;
        Ok(session)
    }

    async fn display_name(&self, user_id: &str) -> String {
        match self.directory.find_user(user_id).await {
            Some(profile) => profile.username,
            None => user_id.to_string(),
        }
    }

    /// Leave the current session (if any is left) and rejoin the queue.
    #[instrument(skip(self), fields(user_id = %user_id, modality = %modality))]
    pub async fn rematch(
        &self,
        user_id: &str,
        socket_id: &str,
        username: &str,
        modality: Modality,
    ) -> Result<MatchOutcome> {
        self.sessions.end_for_user(user_id, EndReason::Skip).await?;
        self.queues.remove_from_all(user_id).await?;
        self.quick_match(user_id, socket_id, username, modality).await
    }

    /// One safety tick for one modality.
    ///
    /// Attempts up to half the queue in extractions, each impersonating
    /// the oldest waiting user so every match is still pulled out through
    /// one of its own members. Covers races the inline fast path lost.
    pub async fn run_matcher_tick(&self, modality: Modality) -> Result<u64> {
        let size = self.queues.queue_size(modality).await?;
        if size < 2 {
            return Ok(0);
        }
        let mut matched = 0;
        for _ in 0..(size / 2) {
            let Some(oldest) = self.queues.oldest(modality).await? else {
                break;
            };
            match self.attempt_pair(&oldest, modality).await {
                Ok(MatchOutcome::Matched(_)) => matched += 1,
                Ok(MatchOutcome::Queued { .. }) => break,
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "Safety tick hit transient failure");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Safety tick match failed");
                    break;
                }
            }
        }
        Ok(matched)
    }
}
