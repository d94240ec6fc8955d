// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the duet core.
//!
//! Provides a unified error type that maps to the short stable codes sent
//! to clients in `error` frames. Messages are human text, never stack
//! traces.

use crate::store::StoreError;

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while processing a client operation.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// The access token did not verify.
    AuthInvalid,

    /// The account is banned and may not connect.
    Banned {
        /// The banned user.
        user_id: String,
    },

    /// A payload failed validation.
    Validation {
        /// The offending field.
        field: String,
        /// What was wrong with it.
        message: String,
    },

    /// The user is already waiting in a queue.
    AlreadyQueued {
        /// The user.
        user_id: String,
    },

    /// The user is not waiting in the named queue.
    NotInQueue {
        /// The user.
        user_id: String,
    },

    /// The user already has an active session.
    AlreadyInSession {
        /// The user.
        user_id: String,
    },

    /// The operation requires an active session and there is none.
    NotInSession {
        /// The user.
        user_id: String,
    },

    /// The partner exists but could not be reached.
    PartnerUnavailable {
        /// The unreachable partner.
        user_id: String,
    },

    /// The shared store refused or timed out. Transient.
    StoreUnavailable {
        /// The operation that failed.
        operation: String,
        /// Transport-level details, for the log only.
        details: String,
    },

    /// This instance is above its load watermarks.
    Overloaded,

    /// A token bucket ran dry.
    RateLimited {
        /// Which limit was hit.
        limit: String,
    },

    /// Anything else. Logged with context; the socket stays open.
    Internal {
        /// What was being attempted.
        context: String,
    },
}

impl CoreError {
    /// Short stable code included in `error` frames.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AuthInvalid => "AUTH_INVALID",
            Self::Banned { .. } => "BANNED",
            Self::Validation { .. } => "VALIDATION",
            Self::AlreadyQueued { .. } => "ALREADY_QUEUED",
            Self::NotInQueue { .. } => "NOT_IN_QUEUE",
            Self::AlreadyInSession { .. } => "ALREADY_IN_SESSION",
            Self::NotInSession { .. } => "NOT_IN_SESSION",
            Self::PartnerUnavailable { .. } => "PARTNER_UNAVAILABLE",
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            Self::Overloaded => "OVERLOADED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::Overloaded | Self::RateLimited { .. }
        )
    }

    /// The metric subsystem label for `errors.{subsystem}` counters.
    pub fn subsystem(&self) -> &'static str {
        match self {
            Self::AuthInvalid | Self::Banned { .. } => "auth",
            Self::AlreadyQueued { .. } | Self::NotInQueue { .. } => "queue",
            Self::AlreadyInSession { .. }
            | Self::NotInSession { .. }
            | Self::PartnerUnavailable { .. } => "session",
            Self::StoreUnavailable { .. } => "store",
            Self::Overloaded | Self::RateLimited { .. } => "admission",
            Self::Validation { .. } | Self::Internal { .. } => "core",
        }
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthInvalid => write!(f, "Invalid or expired access token"),
            Self::Banned { user_id } => write!(f, "Account '{}' is banned", user_id),
            Self::Validation { field, message } => {
                write!(f, "Invalid '{}': {}", field, message)
            }
            Self::AlreadyQueued { user_id } => {
                write!(f, "User '{}' is already waiting in a queue", user_id)
            }
            Self::NotInQueue { user_id } => {
                write!(f, "User '{}' is not waiting in that queue", user_id)
            }
            Self::AlreadyInSession { user_id } => {
                write!(f, "User '{}' is already in an active session", user_id)
            }
            Self::NotInSession { user_id } => {
                write!(f, "User '{}' is not in an active session", user_id)
            }
            Self::PartnerUnavailable { user_id } => {
                write!(f, "Partner '{}' is unavailable", user_id)
            }
            Self::StoreUnavailable { operation, .. } => {
                write!(f, "Service busy during '{}', try again", operation)
            }
            Self::Overloaded => write!(f, "Server is at capacity, try again shortly"),
            Self::RateLimited { limit } => write!(f, "Rate limit exceeded: {}", limit),
            Self::Internal { context } => write!(f, "Internal error during '{}'", context),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { operation, details } => {
                CoreError::StoreUnavailable { operation, details }
            }
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal {
            context: format!("json: {}", err),
        }
    }
}
