// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire vocabulary for the duet WebSocket surface.
//!
//! Every frame exchanged with a client is a JSON object tagged by a `type`
//! string. Inbound frames deserialize into [`ClientMessage`], outbound
//! frames serialize from [`ServerMessage`]. Payload fields use camelCase on
//! the wire. WebRTC payloads (`sdp`, `candidate`) are carried as opaque
//! JSON values and never inspected by the server.

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};

/// The kind of session a user wants to be paired for.
///
/// One wait queue exists per modality; pairing never crosses modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Two-way video call.
    Video,
    /// Audio-only call.
    Audio,
    /// Text chat only.
    Text,
}

impl Modality {
    /// All modalities, in a fixed order. Background sweeps iterate this.
    pub const ALL: [Modality; 3] = [Modality::Video, Modality::Audio, Modality::Text];

    /// Stable lowercase name used in store keys and metric names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Video => "video",
            Modality::Audio => "audio",
            Modality::Text => "text",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Modality::Video),
            "audio" => Ok(Modality::Audio),
            "text" => Ok(Modality::Text),
            other => Err(format!("unknown session type '{other}'")),
        }
    }
}

/// Why a session ended, as reported to the surviving peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectReason {
    /// The partner asked for the next stranger.
    Skip,
    /// The partner's connection dropped.
    Disconnect,
    /// The partner hung up.
    Normal,
    /// The session outlived its allowed duration.
    Timeout,
    /// The server instance is shutting down.
    Shutdown,
}

/// Messages a client may send to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// First frame after the socket opens; carries the access token.
    #[serde(rename = "auth")]
    Auth {
        /// Opaque access token verified by the auth collaborator.
        token: String,
    },

    /// Join the wait queue for a modality.
    #[serde(rename = "queue:join", rename_all = "camelCase")]
    QueueJoin {
        /// Which queue to join.
        session_type: Modality,
    },

    /// Leave the wait queue for a modality.
    #[serde(rename = "queue:leave", rename_all = "camelCase")]
    QueueLeave {
        /// Which queue to leave.
        session_type: Modality,
    },

    /// Skip the current partner and look for the next one.
    #[serde(rename = "match:next")]
    MatchNext,

    /// WebRTC SDP offer, relayed verbatim to the partner.
    #[serde(rename = "call:offer")]
    CallOffer {
        /// Opaque SDP blob.
        sdp: serde_json::Value,
    },

    /// WebRTC SDP answer, relayed verbatim to the partner.
    #[serde(rename = "call:answer")]
    CallAnswer {
        /// Opaque SDP blob.
        sdp: serde_json::Value,
    },

    /// ICE candidate, relayed verbatim to the partner.
    #[serde(rename = "call:ice")]
    CallIce {
        /// Opaque candidate blob.
        candidate: serde_json::Value,
    },

    /// Hang up the current call.
    #[serde(rename = "call:end")]
    CallEnd,

    /// Text chat line for the current partner.
    #[serde(rename = "chat:message")]
    ChatMessage {
        /// Message body, 1..=1000 characters. Never persisted.
        text: String,
    },

    /// The user started typing.
    #[serde(rename = "chat:typing")]
    ChatTyping,

    /// The user stopped typing.
    #[serde(rename = "chat:stop_typing")]
    ChatStopTyping,

    /// Start a session with a friend directly, bypassing the queue.
    #[serde(rename = "friend:call", rename_all = "camelCase")]
    FriendCall {
        /// The friend to call.
        friend_id: String,
        /// Requested modality.
        session_type: Modality,
    },

    /// Report another user.
    #[serde(rename = "report:user", rename_all = "camelCase")]
    ReportUser {
        /// The user being reported.
        reported_user_id: String,
        /// Short reason code chosen by the client.
        reason: String,
        /// Free-form details.
        #[serde(default)]
        description: Option<String>,
        /// Session during which the behavior occurred, if any.
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// Messages the server may send to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Handshake accepted.
    #[serde(rename = "auth:success", rename_all = "camelCase")]
    AuthSuccess {
        /// Server-assigned socket id for this connection.
        socket_id: String,
        /// Authenticated user id.
        user_id: String,
        /// Display name echoed from the auth claims.
        username: String,
    },

    /// Handshake rejected; the socket will be closed.
    #[serde(rename = "auth:error")]
    AuthError {
        /// Human-readable reason.
        message: String,
    },

    /// Current 1-based position in the wait queue.
    #[serde(rename = "queue:position")]
    QueuePosition {
        /// 1-based rank; 1 means next in line.
        position: u64,
    },

    /// A queue operation failed.
    #[serde(rename = "queue:error")]
    QueueError {
        /// Human-readable reason.
        message: String,
    },

    /// A partner was found.
    #[serde(rename = "match:found", rename_all = "camelCase")]
    MatchFound {
        /// Session id shared by both peers.
        session_id: String,
        /// The partner's user id.
        partner_id: String,
        /// The partner's display name.
        partner_username: String,
        /// Modality of the session.
        session_type: Modality,
    },

    /// The partner is gone; the session is over.
    #[serde(rename = "match:disconnected")]
    MatchDisconnected {
        /// Why the session ended.
        reason: DisconnectReason,
    },

    /// A matching operation failed.
    #[serde(rename = "match:error")]
    MatchError {
        /// Human-readable reason.
        message: String,
    },

    /// Chat line from the partner.
    #[serde(rename = "chat:message", rename_all = "camelCase")]
    ChatMessage {
        /// The author.
        sender_id: String,
        /// Message body.
        text: String,
        /// Server receive time, milliseconds since the Unix epoch.
        timestamp: i64,
    },

    /// The partner started typing.
    #[serde(rename = "chat:typing")]
    ChatTyping,

    /// The partner stopped typing.
    #[serde(rename = "chat:stop_typing")]
    ChatStopTyping,

    /// WebRTC SDP offer from the partner.
    #[serde(rename = "call:offer")]
    CallOffer {
        /// Opaque SDP blob.
        sdp: serde_json::Value,
    },

    /// WebRTC SDP answer from the partner.
    #[serde(rename = "call:answer")]
    CallAnswer {
        /// Opaque SDP blob.
        sdp: serde_json::Value,
    },

    /// ICE candidate from the partner.
    #[serde(rename = "call:ice")]
    CallIce {
        /// Opaque candidate blob.
        candidate: serde_json::Value,
    },

    /// The partner hung up.
    #[serde(rename = "call:end")]
    CallEnd,

    /// A call operation failed.
    #[serde(rename = "call:error")]
    CallError {
        /// Human-readable reason.
        message: String,
    },

    /// Fleet-wide connected-user count.
    #[serde(rename = "user:count")]
    UserCount {
        /// Number of open connections across healthy instances.
        n: u64,
    },

    /// Generic typed error for anything without a dedicated event.
    #[serde(rename = "error")]
    Error {
        /// Short stable machine-readable code.
        code: String,
        /// Human-readable message. Never a stack trace.
        message: String,
    },
}

impl ServerMessage {
    /// Whether this frame may be dropped under outbound backpressure.
    ///
    /// Positions and counters are advisory and regenerated on the next
    /// tick; chat, signaling, and match lifecycle frames are not.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            ServerMessage::QueuePosition { .. } | ServerMessage::UserCount { .. }
        )
    }
}
