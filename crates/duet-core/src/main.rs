// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duet Core - Random Pairing Chat Server
//!
//! The core is responsible for:
//! - Matching waiting strangers per modality (video, audio, text)
//! - Session lifecycle and partner lookup
//! - Chat and WebRTC signaling relay between paired peers
//! - Fleet membership, heartbeats, and load-aware admission
//!
//! Accounts, friendships, and moderation live in external services; this
//! binary runs standalone with guest access and the in-memory store
//! unless a store URL is configured.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use duet_core::config::Config;
use duet_core::runtime::CoreRuntime;
use duet_core::store::{RedisStore, SharedStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from the crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("duet_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Duet Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        bind_addr = %config.bind_addr,
        public_host = %config.public_host,
        store = if config.store_url.is_empty() { "memory" } else { "redis" },
        "Configuration loaded"
    );

    let mut builder = CoreRuntime::builder().config(config.clone());
    if !config.store_url.is_empty() {
        info!("Connecting to shared store...");
        let store: Arc<dyn SharedStore> = Arc::new(
            RedisStore::connect(&config.store_url, config.store_op_timeout).await?,
        );
        // Round-trip a probe key so a bad endpoint fails at boot, not at
        // the first client.
        store
            .set("boot-probe", "ok", Some(Duration::from_secs(10)))
            .await?;
        info!("Shared store connection established");
        builder = builder.store(store);
    }

    let running = builder.build().start().await?;
    info!(addr = %running.local_addr(), "Duet Core initialized successfully");

    // Wait for a shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    running.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
