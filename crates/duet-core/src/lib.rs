// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duet Core - Random Pairing Chat Server
//!
//! This crate is the server core of the duet platform: strangers connect,
//! ask to be paired for a video, audio, or text session, chat and exchange
//! WebRTC signaling, and move on. All cluster state lives in a shared
//! store so any number of instances can serve the same population.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            Clients                                   │
//! │                     (browser / mobile apps)                          │
//! └─────────────────────────────────────────────────────────────────────┘
//!                │ WebSocket (JSON frames, duet-protocol)
//!                ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  Connection Supervisor ── auth handshake, admission, rate limits,    │
//! │                           dispatch, disconnect cascade               │
//! └──────┬──────────────┬─────────────────────┬─────────────────────────┘
//!        │              │                     │
//!        ▼              ▼                     ▼
//! ┌────────────┐ ┌──────────────┐ ┌───────────────────┐
//! │  Pairing   │ │    Relay     │ │  Socket Registry  │◄── directed
//! │  Engine    │ │ (chat/WebRTC)│ │  (local sockets,  │    pub/sub from
//! └──┬─────┬───┘ └──────┬───────┘ │   fleet delivery) │    other instances
//!    │     │            │         └─────────┬─────────┘
//!    ▼     ▼            ▼                   │
//! ┌──────┐ ┌──────────────────┐             │
//! │Queue │ │ Session Manager  │             │
//! │Mgr   │ │ (records +       │             │
//! └──┬───┘ │  reverse ptrs)   │             │
//!    │     └────────┬─────────┘             │
//!    └──────────────┼───────────────────────┘
//!                   ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │   Shared Store (strings+TTL, ordered sets, pub/sub, scan, locks)     │
//! │              memory backend  /  redis backend                        │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The Fleet Coordinator runs beside all of this, heartbeating an
//! instance record (load, connection count) so admission control and
//! external routing can avoid hot instances.
//!
//! # Locks
//!
//! Only two operations hold the store lock:
//!
//! | Lock | TTL | Held around |
//! |------|-----|-------------|
//! | `lock:matching:{modality}` | 5 s | reading and removing the two oldest queue entries |
//! | `lock:session-create` | 3 s | the two-side active-session probe and pointer writes |
//!
//! A caller that cannot acquire a lock returns a transient refusal and
//! retries on its next tick; nothing blocks on a lock.
//!
//! # Background tasks
//!
//! | Task | Interval | Purpose |
//! |------|----------|---------|
//! | heartbeat | 10 s | refresh instance record, presence, user count, reap dead instances |
//! | queue sweep | 10 s | drop waiting entries older than the queue timeout |
//! | session cleanup | 5 min | reconcile records and pointers, close over-long sessions |
//! | safety matcher | 2 s per modality | re-run pair extraction for the oldest waiting user |
//!
//! # Modules
//!
//! - [`config`]: configuration from environment variables
//! - [`store`]: shared-store trait with memory and redis backends
//! - [`error`]: error types with wire-code mapping
//! - [`fleet`]: instance registration, heartbeats, and load views
//! - [`registry`]: socket registry and cross-instance delivery
//! - [`queue`]: per-modality wait queues and pair extraction
//! - [`session`]: session records, reverse pointers, teardown
//! - [`pairing`]: quick match, friend calls, rematch, safety tick
//! - [`relay`]: in-session chat and WebRTC signaling pass-through
//! - [`supervisor`]: WebSocket upgrade, handshake, dispatch
//! - [`runtime`]: composition root and background task ownership
//! - [`collaborators`]: auth/directory interfaces to external services

#![deny(missing_docs)]

/// Time source abstraction.
pub mod clock;

/// Interfaces to the auth and directory services around the core.
pub mod collaborators;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for core operations with wire-code mapping.
pub mod error;

/// Fleet coordination: instance records, heartbeats, admission.
pub mod fleet;

/// Metrics sink abstraction.
pub mod metrics;

/// Pairing orchestration over queues and sessions.
pub mod pairing;

/// Per-modality wait queues with atomic pair extraction.
pub mod queue;

/// Rate limiting for connections and per-socket traffic.
pub mod rate_limit;

/// Socket registry and the fleet delivery plane.
pub mod registry;

/// Per-session chat and signaling relay.
pub mod relay;

/// Composition root and background tasks.
pub mod runtime;

/// Session lifecycle management.
pub mod session;

/// Shared-store abstraction and backends.
pub mod store;

/// Connection supervision and message dispatch.
pub mod supervisor;
