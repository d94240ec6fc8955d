// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Duet core configuration.
///
/// Every knob has a default; only deployment-specific values (store URL,
/// public host) are usually set explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the WebSocket server binds to.
    pub bind_addr: SocketAddr,
    /// Redis connection URL. Empty means the in-process memory store.
    pub store_url: String,
    /// Host name advertised in the instance record.
    pub public_host: String,

    /// Waiting entries older than this are stale and swept.
    pub queue_timeout: Duration,
    /// Safety matcher tick per modality.
    pub match_interval: Duration,
    /// Stale-entry sweep interval.
    pub queue_cleanup_interval: Duration,
    /// Session record TTL in the shared store.
    pub session_ttl: Duration,
    /// Sessions older than this are closed as abandoned.
    pub max_session_duration: Duration,
    /// Session reconciliation sweep interval.
    pub session_cleanup_interval: Duration,
    /// Instance record TTL.
    pub instance_ttl: Duration,
    /// Fleet heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Maximum hold of the per-modality matching lock.
    pub pair_lock_ttl: Duration,
    /// Maximum hold of the session-creation lock.
    pub session_create_lock_ttl: Duration,

    /// Per-socket inbound message cap, per second.
    pub rate_ws_msg_per_sec: u32,
    /// Per-user queue joins allowed per five seconds.
    pub rate_queue_join_per_5s: u32,
    /// Per-IP connection attempts allowed per minute.
    pub rate_ws_connect_per_min: u32,

    /// Outbound frames buffered per socket before backpressure kicks in.
    pub socket_send_buffer: usize,
    /// Grace window for disconnect cleanup and shutdown notifications.
    pub shutdown_grace: Duration,
    /// Deadline for a single shared-store call.
    pub store_op_timeout: Duration,
    /// Deadline for a single socket write.
    pub socket_write_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `DUET_BIND_ADDR` (default `0.0.0.0:9300`)
    /// - `DUET_STORE_URL` (default empty: in-process memory store)
    /// - `DUET_PUBLIC_HOST` (default from `HOSTNAME`, else `localhost`)
    /// - `DUET_QUEUE_TIMEOUT_SECS` (default 60)
    /// - `DUET_MATCH_INTERVAL_SECS` (default 2)
    /// - `DUET_QUEUE_CLEANUP_INTERVAL_SECS` (default 10)
    /// - `DUET_SESSION_TTL_SECS` (default 7200)
    /// - `DUET_MAX_SESSION_DURATION_SECS` (default 3600)
    /// - `DUET_SESSION_CLEANUP_INTERVAL_SECS` (default 300)
    /// - `DUET_INSTANCE_TTL_SECS` (default 30)
    /// - `DUET_HEARTBEAT_INTERVAL_SECS` (default 10)
    /// - `DUET_PAIR_LOCK_TTL_SECS` (default 5)
    /// - `DUET_SESSION_CREATE_LOCK_TTL_SECS` (default 3)
    /// - `DUET_RATE_WS_MSG` (default 20)
    /// - `DUET_RATE_QUEUE_JOIN` (default 3)
    /// - `DUET_RATE_WS_CONNECT` (default 10)
    /// - `DUET_SOCKET_SEND_BUFFER` (default 64)
    /// - `DUET_SHUTDOWN_GRACE_SECS` (default 5)
    /// - `DUET_STORE_OP_TIMEOUT_SECS` (default 5)
    /// - `DUET_SOCKET_WRITE_TIMEOUT_SECS` (default 2)
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr: SocketAddr = std::env::var("DUET_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:9300".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("DUET_BIND_ADDR", "must be host:port"))?;

        let store_url = std::env::var("DUET_STORE_URL").unwrap_or_default();

        let public_host = std::env::var("DUET_PUBLIC_HOST")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "localhost".to_string());

        Ok(Self {
            bind_addr,
            store_url,
            public_host,
            queue_timeout: secs("DUET_QUEUE_TIMEOUT_SECS", 60)?,
            match_interval: secs("DUET_MATCH_INTERVAL_SECS", 2)?,
            queue_cleanup_interval: secs("DUET_QUEUE_CLEANUP_INTERVAL_SECS", 10)?,
            session_ttl: secs("DUET_SESSION_TTL_SECS", 7200)?,
            max_session_duration: secs("DUET_MAX_SESSION_DURATION_SECS", 3600)?,
            session_cleanup_interval: secs("DUET_SESSION_CLEANUP_INTERVAL_SECS", 300)?,
            instance_ttl: secs("DUET_INSTANCE_TTL_SECS", 30)?,
            heartbeat_interval: secs("DUET_HEARTBEAT_INTERVAL_SECS", 10)?,
            pair_lock_ttl: secs("DUET_PAIR_LOCK_TTL_SECS", 5)?,
            session_create_lock_ttl: secs("DUET_SESSION_CREATE_LOCK_TTL_SECS", 3)?,
            rate_ws_msg_per_sec: int("DUET_RATE_WS_MSG", 20)?,
            rate_queue_join_per_5s: int("DUET_RATE_QUEUE_JOIN", 3)?,
            rate_ws_connect_per_min: int("DUET_RATE_WS_CONNECT", 10)?,
            socket_send_buffer: int::<usize>("DUET_SOCKET_SEND_BUFFER", 64)?,
            shutdown_grace: secs("DUET_SHUTDOWN_GRACE_SECS", 5)?,
            store_op_timeout: secs("DUET_STORE_OP_TIMEOUT_SECS", 5)?,
            socket_write_timeout: secs("DUET_SOCKET_WRITE_TIMEOUT_SECS", 2)?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9300)),
            store_url: String::new(),
            public_host: "localhost".to_string(),
            queue_timeout: Duration::from_secs(60),
            match_interval: Duration::from_secs(2),
            queue_cleanup_interval: Duration::from_secs(10),
            session_ttl: Duration::from_secs(7200),
            max_session_duration: Duration::from_secs(3600),
            session_cleanup_interval: Duration::from_secs(300),
            instance_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            pair_lock_ttl: Duration::from_secs(5),
            session_create_lock_ttl: Duration::from_secs(3),
            rate_ws_msg_per_sec: 20,
            rate_queue_join_per_5s: 3,
            rate_ws_connect_per_min: 10,
            socket_send_buffer: 64,
            shutdown_grace: Duration::from_secs(5),
            store_op_timeout: Duration::from_secs(5),
            socket_write_timeout: Duration::from_secs(2),
        }
    }
}

fn secs(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let value: u64 = int(var, default)?;
    Ok(Duration::from_secs(value))
}

fn int<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(var, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.queue_timeout, Duration::from_secs(60));
        assert_eq!(config.match_interval, Duration::from_secs(2));
        assert_eq!(config.session_ttl, Duration::from_secs(7200));
        assert_eq!(config.max_session_duration, Duration::from_secs(3600));
        assert_eq!(config.instance_ttl, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.pair_lock_ttl, Duration::from_secs(5));
        assert_eq!(config.rate_ws_msg_per_sec, 20);
        assert_eq!(config.rate_queue_join_per_5s, 3);
        assert_eq!(config.socket_send_buffer, 64);
    }
}
