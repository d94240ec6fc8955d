// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authoritative state for active pairings.
//!
//! A session is a record `session:{id}` plus one reverse pointer
//! `session-of:{user}` per member, all sharing the session TTL. Creation
//! runs under the store lock with a two-side probe; the pointers are
//! additionally written set-if-absent, so a user can never end up in two
//! active sessions even across a lost lock. Teardown is idempotent and
//! removes the record and both pointers together.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use duet_protocol::Modality;

use crate::clock::Clock;
use crate::collaborators::Directory;
use crate::error::{CoreError, Result};
use crate::metrics::MetricsSink;
use crate::store::SharedStore;

/// Channel carrying `match:found` announcements to the fleet.
pub const MATCH_CHANNEL: &str = "fleet:match";

const CREATE_LOCK_KEY: &str = "lock:session-create";

/// Lifecycle state of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Both members paired and chatting.
    Active,
    /// Closed by a member or by cleanup.
    Ended,
    /// Closed by the sweep because it outlived its allowed duration or
    /// lost its record without a clean end.
    Abandoned,
}

/// Why a session was ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// A member hung up.
    Normal,
    /// A member skipped to the next stranger.
    Skip,
    /// A member's connection dropped.
    Disconnect,
    /// The session hit its maximum duration.
    Timeout,
    /// The background sweep reconciled it away.
    Abandoned,
}

impl EndReason {
    /// Stable name used in metrics and the history record.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Normal => "normal",
            EndReason::Skip => "skip",
            EndReason::Disconnect => "disconnect",
            EndReason::Timeout => "timeout",
            EndReason::Abandoned => "abandoned",
        }
    }
}

/// An active two-party pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session id.
    pub session_id: String,
    /// The modality both members asked for.
    pub modality: Modality,
    /// First member (the longer-waiting one for queue matches).
    pub user_a: String,
    /// Second member.
    pub user_b: String,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// Lifecycle state. Stored records are always `active`; the
    /// terminal states live only in the history collaborator.
    pub status: SessionStatus,
}

impl Session {
    /// The other member, if `user_id` is one of the two.
    pub fn partner_of(&self, user_id: &str) -> Option<&str> {
        if self.user_a == user_id {
            Some(&self.user_b)
        } else if self.user_b == user_id {
            Some(&self.user_a)
        } else {
            None
        }
    }
}

/// Announcement published when a pair is created.
#[derive(Debug, Serialize, Deserialize)]
pub struct MatchAnnouncement {
    /// The new session.
    pub session_id: String,
    /// First member.
    pub user_a: String,
    /// Second member.
    pub user_b: String,
    /// Session modality.
    pub modality: Modality,
}

/// Manager of session records and reverse pointers.
pub struct SessionManager {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    directory: Arc<dyn Directory>,
    session_ttl: Duration,
    create_lock_ttl: Duration,
    max_session_duration: Duration,
}

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

fn pointer_key(user_id: &str) -> String {
    format!("session-of:{user_id}")
}

fn active_gauge_key(modality: Modality) -> String {
    format!("sessions-active:{modality}")
}

impl SessionManager {
    /// Create a session manager.
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        directory: Arc<dyn Directory>,
        session_ttl: Duration,
        create_lock_ttl: Duration,
        max_session_duration: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
            directory,
            session_ttl,
            create_lock_ttl,
            max_session_duration,
        }
    }

    /// Create a session for two distinct users.
    ///
    /// Rejects with `AlreadyInSession` if either member has an active
    /// session. Lock contention surfaces as a transient store error; the
    /// caller retries on its next tick.
    #[instrument(skip(self), fields(user_a = %user_a, user_b = %user_b, modality = %modality))]
    pub async fn create(
        &self,
        modality: Modality,
        user_a: &str,
        user_b: &str,
    ) -> Result<Session> {
        if user_a == user_b {
            return Err(CoreError::Validation {
                field: "user_b".to_string(),
                message: "cannot pair a user with themselves".to_string(),
            });
        }
        let Some(token) = self
            .store
            .try_acquire(CREATE_LOCK_KEY, self.create_lock_ttl)
            .await?
        else {
            return Err(CoreError::StoreUnavailable {
                operation: "session-create-lock".to_string(),
                details: "lock contended".to_string(),
            });
        };
        let result = self.create_locked(modality, user_a, user_b).await;
        if !self
            .store
            .release(CREATE_LOCK_KEY, &token)
            .await
            .unwrap_or(false)
        {
            warn!("Session-create lock expired before release");
        }
        result
    }

    async fn create_locked(
        &self,
        modality: Modality,
        user_a: &str,
        user_b: &str,
    ) -> Result<Session> {
        if self.store.get(&pointer_key(user_a)).await?.is_some() {
            return Err(CoreError::AlreadyInSession {
                user_id: user_a.to_string(),
            });
        }
        if self.store.get(&pointer_key(user_b)).await?.is_some() {
            return Err(CoreError::AlreadyInSession {
                user_id: user_b.to_string(),
            });
        }

        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            modality,
            user_a: user_a.to_string(),
            user_b: user_b.to_string(),
            started_at: self.clock.now(),
            status: SessionStatus::Active,
        };
        let key = session_key(&session.session_id);
        self.store
            .set(&key, &serde_json::to_string(&session)?, Some(self.session_ttl))
            .await?;

        // The probe above ran under the lock, but the pointers are still
        // written set-if-absent: a lost lock must not yield a double
        // membership.
        if !self
            .store
            .set_nx(&pointer_key(user_a), &session.session_id, Some(self.session_ttl))
            .await?
        {
            self.store.delete(&key).await?;
            return Err(CoreError::AlreadyInSession {
                user_id: user_a.to_string(),
            });
        }
        if !self
            .store
            .set_nx(&pointer_key(user_b), &session.session_id, Some(self.session_ttl))
            .await?
        {
            self.store
                .compare_and_delete(&pointer_key(user_a), &session.session_id)
                .await?;
            self.store.delete(&key).await?;
            return Err(CoreError::AlreadyInSession {
                user_id: user_b.to_string(),
            });
        }

        let announcement = MatchAnnouncement {
            session_id: session.session_id.clone(),
            user_a: user_a.to_string(),
            user_b: user_b.to_string(),
            modality,
        };
        self.store
            .publish(MATCH_CHANNEL, &serde_json::to_string(&announcement)?)
            .await?;

        self.metrics
            .counter(&format!("session.created.{modality}"), 1);
        if let Ok(active) = self.store.incr(&active_gauge_key(modality), 1).await {
            self.metrics
                .gauge(&format!("sessions.active.{modality}"), active as f64);
        }
        info!(session_id = %session.session_id, "Session created");
        Ok(session)
    }

    /// Fetch a session record.
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        match self.store.get(&session_key(session_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    /// The partner of a user in their active session.
    ///
    /// Heals a dangling reverse pointer (session record expired without a
    /// clean end) by deleting it.
    pub async fn partner_of(&self, user_id: &str) -> Result<Option<(Session, String)>> {
        let Some(session_id) = self.store.get(&pointer_key(user_id)).await? else {
            return Ok(None);
        };
        let Some(session) = self.get(&session_id).await? else {
            self.store
                .compare_and_delete(&pointer_key(user_id), &session_id)
                .await?;
            debug!(user_id = %user_id, session_id = %session_id, "Healed dangling session pointer");
            return Ok(None);
        };
        match session.partner_of(user_id) {
            Some(partner) => {
                let partner = partner.to_string();
                Ok(Some((session, partner)))
            }
            None => {
                // Pointer to a session the user is not in: stale beyond
                // repair, drop it.
                self.store
                    .compare_and_delete(&pointer_key(user_id), &session_id)
                    .await?;
                Ok(None)
            }
        }
    }

    /// End a session. Idempotent: the first call returns true, any later
    /// call false.
    #[instrument(skip(self), fields(session_id = %session_id, reason = reason.as_str()))]
    pub async fn end(&self, session_id: &str, reason: EndReason) -> Result<bool> {
        let Some(session) = self.get(session_id).await? else {
            return Ok(false);
        };
        if !self.store.delete(&session_key(session_id)).await? {
            // Lost the race against a concurrent end.
            return Ok(false);
        }
        self.store
            .compare_and_delete(&pointer_key(&session.user_a), session_id)
            .await?;
        self.store
            .compare_and_delete(&pointer_key(&session.user_b), session_id)
            .await?;

        let ended_at = self.clock.now();
        let duration_ms = (ended_at - session.started_at).num_milliseconds().max(0);
        self.metrics.histogram(
            &format!("session.duration_ms.{}", session.modality),
            duration_ms as f64,
        );
        self.metrics
            .counter(&format!("session.ended.{}", reason.as_str()), 1);
        if let Ok(active) = self
            .store
            .incr(&active_gauge_key(session.modality), -1)
            .await
        {
            self.metrics.gauge(
                &format!("sessions.active.{}", session.modality),
                active.max(0) as f64,
            );
        }
        self.directory
            .record_session_ended(session_id, session.started_at, ended_at, reason.as_str())
            .await;
        info!(duration_ms, "Session ended");
        Ok(true)
    }

    /// End whatever active session a user is in.
    ///
    /// Returns the ended session and the partner's id, so the caller can
    /// notify the surviving side.
    pub async fn end_for_user(
        &self,
        user_id: &str,
        reason: EndReason,
    ) -> Result<Option<(Session, String)>> {
        let Some((session, partner)) = self.partner_of(user_id).await? else {
            return Ok(None);
        };
        if self.end(&session.session_id, reason).await? {
            Ok(Some((session, partner)))
        } else {
            Ok(None)
        }
    }

    /// Re-arm the TTL of a session and its pointers on observed activity.
    pub async fn extend(&self, session_id: &str) -> Result<bool> {
        let Some(session) = self.get(session_id).await? else {
            return Ok(false);
        };
        self.store
            .expire(&session_key(session_id), self.session_ttl)
            .await?;
        self.store
            .expire(&pointer_key(&session.user_a), self.session_ttl)
            .await?;
        self.store
            .expire(&pointer_key(&session.user_b), self.session_ttl)
            .await?;
        Ok(true)
    }

    /// Reconcile live records against their pointers and close anything
    /// that outlived its welcome. Returns how many sessions were closed
    /// or repaired.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<u64> {
        let mut reconciled = 0;

        for key in self.store.scan("session:*").await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let Ok(session) = serde_json::from_str::<Session>(&raw) else {
                warn!(key = %key, "Deleting undecodable session record");
                self.store.delete(&key).await?;
                reconciled += 1;
                continue;
            };

            let age = self.clock.now() - session.started_at;
            if age.num_milliseconds() >= self.max_session_duration.as_millis() as i64 {
                if self.end(&session.session_id, EndReason::Abandoned).await? {
                    reconciled += 1;
                }
                continue;
            }

            let a_ok = self
                .store
                .get(&pointer_key(&session.user_a))
                .await?
                .as_deref()
                == Some(session.session_id.as_str());
            let b_ok = self
                .store
                .get(&pointer_key(&session.user_b))
                .await?
                .as_deref()
                == Some(session.session_id.as_str());
            if !a_ok || !b_ok {
                // Half-torn record: finish the teardown.
                if self.end(&session.session_id, EndReason::Abandoned).await? {
                    reconciled += 1;
                }
            }
        }

        // Pointers whose session record expired underneath them.
        for key in self.store.scan("session-of:*").await? {
            let Some(session_id) = self.store.get(&key).await? else {
                continue;
            };
            if self.get(&session_id).await?.is_none() {
                self.store.compare_and_delete(&key, &session_id).await?;
                reconciled += 1;
            }
        }

        if reconciled > 0 {
            info!(reconciled, "Session cleanup reconciled records");
        }
        Ok(reconciled)
    }
}
