// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interfaces to the services around the core.
//!
//! Accounts, friendships, reports, and session history live in external
//! services; the core consumes them through these traits and never stores
//! credentials or profile data itself. Tests inject recording fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

/// Identity extracted from a verified access token.
#[derive(Debug, Clone)]
pub struct AuthClaims {
    /// Stable opaque user id.
    pub user_id: String,
    /// Display name shown to partners.
    pub username: String,
    /// Guests may chat but have no durable account.
    pub is_guest: bool,
}

/// Token verification, owned by the auth service.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Verify an access token. `None` means the token is invalid or
    /// expired; the core does not learn why.
    async fn verify_access_token(&self, token: &str) -> Option<AuthClaims>;
}

/// Minimal user profile, as much as the core ever sees of an account.
#[derive(Debug, Clone)]
pub struct UserProfile {
    /// Stable opaque user id.
    pub user_id: String,
    /// Display name.
    pub username: String,
}

/// A user report captured during or after a session.
#[derive(Debug, Clone)]
pub struct Report {
    /// Server-assigned report id.
    pub report_id: String,
    /// Who filed it.
    pub reporter_id: String,
    /// Who it is about.
    pub reported_id: String,
    /// Session it refers to, if any.
    pub session_id: Option<String>,
    /// Short reason code.
    pub reason: String,
    /// Free-form details.
    pub description: Option<String>,
    /// When it was filed.
    pub created_at: DateTime<Utc>,
}

/// Account, friendship, report, and history operations.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Look up a user's profile.
    async fn find_user(&self, user_id: &str) -> Option<UserProfile>;

    /// Whether the account is banned from connecting.
    async fn is_banned(&self, user_id: &str) -> bool;

    /// Whether two users are friends.
    async fn are_friends(&self, a: &str, b: &str) -> bool;

    /// Persist a report. The core never reads reports back.
    async fn record_report(&self, report: Report);

    /// Persist the outcome of an ended session (metadata only, never
    /// message bodies).
    async fn record_session_ended(
        &self,
        session_id: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        reason: &str,
    );
}

/// Standalone-mode auth: admits guests whose token is `guest:<id>:<name>`.
///
/// Deployments with a real account service replace this with their own
/// [`AuthProvider`].
#[derive(Debug, Default, Clone, Copy)]
pub struct GuestAuth;

#[async_trait]
impl AuthProvider for GuestAuth {
    async fn verify_access_token(&self, token: &str) -> Option<AuthClaims> {
        let rest = token.strip_prefix("guest:")?;
        let (id, name) = rest.split_once(':')?;
        if id.is_empty() || name.is_empty() || Uuid::parse_str(id).is_err() {
            return None;
        }
        Some(AuthClaims {
            user_id: format!("guest-{id}"),
            username: name.to_string(),
            is_guest: true,
        })
    }
}

/// Standalone-mode directory: nobody has an account, a friend, or a ban;
/// reports and history are logged and dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDirectory;

#[async_trait]
impl Directory for NullDirectory {
    async fn find_user(&self, _user_id: &str) -> Option<UserProfile> {
        None
    }

    async fn is_banned(&self, _user_id: &str) -> bool {
        false
    }

    async fn are_friends(&self, _a: &str, _b: &str) -> bool {
        false
    }

    async fn record_report(&self, report: Report) {
        info!(
            report_id = %report.report_id,
            reported_id = %report.reported_id,
            reason = %report.reason,
            "Report received (no directory configured, dropping)"
        );
    }

    async fn record_session_ended(
        &self,
        session_id: &str,
        _started_at: DateTime<Utc>,
        _ended_at: DateTime<Utc>,
        reason: &str,
    ) {
        info!(session_id = %session_id, reason = %reason, "Session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guest_auth_accepts_well_formed_tokens() {
        let auth = GuestAuth;
        let id = Uuid::new_v4();
        let claims = auth
            .verify_access_token(&format!("guest:{id}:mallory"))
            .await
            .expect("valid guest token");
        assert_eq!(claims.user_id, format!("guest-{id}"));
        assert_eq!(claims.username, "mallory");
        assert!(claims.is_guest);
    }

    #[tokio::test]
    async fn test_guest_auth_rejects_garbage() {
        let auth = GuestAuth;
        assert!(auth.verify_access_token("").await.is_none());
        assert!(auth.verify_access_token("guest:").await.is_none());
        assert!(auth.verify_access_token("guest:not-a-uuid:bob").await.is_none());
        assert!(auth.verify_access_token("jwt-looking-thing").await.is_none());
    }
}
