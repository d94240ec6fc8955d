// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet coordination: instance registration, heartbeats, and load views.
//!
//! Each process writes an instance record with a short TTL and refreshes
//! it on every heartbeat together with a capped load timeseries. The
//! record only stays alive while its own instance keeps heartbeating, so
//! the cluster view self-cleans; the reaper just removes long-dead
//! leftovers and their series.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::metrics::MetricsSink;
use crate::store::SharedStore;

/// Admission watermarks: refuse new sockets above either.
const CPU_WATERMARK_PCT: f64 = 90.0;
const MEM_WATERMARK_PCT: f64 = 85.0;

/// Load timeseries retention.
const SERIES_CAP: i64 = 100;
const SERIES_TTL: Duration = Duration::from_secs(3600);

/// One CPU/memory observation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoadSample {
    /// CPU usage across all cores, percent.
    pub cpu_pct: f64,
    /// Memory in use, percent of total.
    pub mem_pct: f64,
}

/// A timestamped point in an instance's load timeseries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoadPoint {
    /// Sample time, milliseconds since the epoch.
    pub at_ms: i64,
    /// CPU usage across all cores, percent.
    pub cpu_pct: f64,
    /// Memory in use, percent of total.
    pub mem_pct: f64,
    /// Open WebSocket connections at sample time.
    pub active_connections: u64,
}

/// Source of load samples. Swappable so tests can will an overload into
/// existence.
pub trait LoadSampler: Send + Sync {
    /// Take a fresh sample.
    fn sample(&self) -> LoadSample;
}

/// Sampler backed by the operating system.
///
/// CPU usage is computed over the window since the previous call, which
/// the heartbeat cadence makes a rolling average; the first call after
/// boot reads as zero.
pub struct SystemSampler {
    system: Mutex<System>,
}

impl SystemSampler {
    /// Create a sampler and prime the first CPU measurement.
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SystemSampler {
    fn sample(&self) -> LoadSample {
        let mut system = self.system.lock().expect("sampler mutex poisoned");
        system.refresh_cpu_usage();
        system.refresh_memory();
        let total = system.total_memory();
        let mem_pct = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };
        LoadSample {
            cpu_pct: system.global_cpu_usage() as f64,
            mem_pct,
        }
    }
}

/// Liveness and load descriptor for one server process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Unique id: host, pid, and boot stamp.
    pub instance_id: String,
    /// Advertised host name.
    pub host: String,
    /// Advertised WebSocket port.
    pub port: u16,
    /// Last sampled CPU percent.
    pub cpu_pct: f64,
    /// Last sampled memory percent.
    pub mem_pct: f64,
    /// Open WebSocket connections on the instance.
    pub active_connections: u64,
    /// Last heartbeat, milliseconds since the epoch.
    pub last_heartbeat: i64,
    /// Whether the instance considers itself servable.
    pub healthy: bool,
}

impl InstanceRecord {
    /// Composite load score used for routing: lower is better.
    pub fn load_score(&self) -> f64 {
        0.4 * self.cpu_pct + 0.3 * self.mem_pct + 0.3 * (self.active_connections as f64 / 100.0)
    }
}

/// Coordinator for this instance's membership in the fleet.
pub struct FleetCoordinator {
    instance_id: String,
    host: String,
    port: u16,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    sampler: Arc<dyn LoadSampler>,
    instance_ttl: Duration,
    last_sample: Mutex<LoadSample>,
}

fn instance_key(instance_id: &str) -> String {
    format!("instance:{instance_id}")
}

fn series_key(instance_id: &str) -> String {
    format!("instance-load:{instance_id}")
}

impl FleetCoordinator {
    /// Create a coordinator for this process.
    ///
    /// The instance id combines host, pid, and a boot stamp so restarts
    /// never collide with their own stale record.
    pub fn new(
        host: String,
        port: u16,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        sampler: Arc<dyn LoadSampler>,
        instance_ttl: Duration,
    ) -> Self {
        let instance_id = format!("{host}-{}-{}", std::process::id(), clock.now_ms());
        Self {
            instance_id,
            host,
            port,
            store,
            clock,
            metrics,
            sampler,
            instance_ttl,
            last_sample: Mutex::new(LoadSample::default()),
        }
    }

    /// This process's unique id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Write the initial instance record. Called once at boot.
    #[instrument(skip(self))]
    pub async fn register(&self) -> Result<()> {
        self.heartbeat(0).await?;
        info!(instance_id = %self.instance_id, "Instance registered");
        Ok(())
    }

    /// Refresh the instance record and append to the load timeseries.
    pub async fn heartbeat(&self, active_connections: u64) -> Result<()> {
        let sample = self.sampler.sample();
        *self.last_sample.lock().expect("sample mutex poisoned") = sample;

        let now_ms = self.clock.now_ms();
        let record = InstanceRecord {
            instance_id: self.instance_id.clone(),
            host: self.host.clone(),
            port: self.port,
            cpu_pct: sample.cpu_pct,
            mem_pct: sample.mem_pct,
            active_connections,
            last_heartbeat: now_ms,
            healthy: true,
        };
        self.store
            .set(
                &instance_key(&self.instance_id),
                &serde_json::to_string(&record)?,
                Some(self.instance_ttl),
            )
            .await?;

        let point = LoadPoint {
            at_ms: now_ms,
            cpu_pct: sample.cpu_pct,
            mem_pct: sample.mem_pct,
            active_connections,
        };
        let series = series_key(&self.instance_id);
        self.store
            .zadd(&series, &serde_json::to_string(&point)?, now_ms as f64)
            .await?;
        self.store
            .zremrangebyrank(&series, 0, -(SERIES_CAP + 1))
            .await?;
        self.store.expire(&series, SERIES_TTL).await?;

        self.metrics.gauge("fleet.cpu_pct", sample.cpu_pct);
        self.metrics.gauge("fleet.mem_pct", sample.mem_pct);
        debug!(
            cpu_pct = sample.cpu_pct,
            mem_pct = sample.mem_pct,
            active_connections,
            "Heartbeat"
        );
        Ok(())
    }

    /// Whether this instance should accept a new connection right now.
    pub fn should_accept(&self) -> bool {
        let sample = *self.last_sample.lock().expect("sample mutex poisoned");
        sample.cpu_pct <= CPU_WATERMARK_PCT && sample.mem_pct <= MEM_WATERMARK_PCT
    }

    /// Instances that heartbeat within the liveness window and report
    /// themselves healthy. A record past the window is dead regardless of
    /// its TTL.
    pub async fn healthy_instances(&self) -> Result<Vec<InstanceRecord>> {
        let cutoff = self.clock.now_ms() - self.instance_ttl.as_millis() as i64;
        let mut healthy = Vec::new();
        for key in self.store.scan("instance:*").await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<InstanceRecord>(&raw) else {
                warn!(key = %key, "Undecodable instance record");
                continue;
            };
            if record.healthy && record.last_heartbeat >= cutoff {
                healthy.push(record);
            }
        }
        Ok(healthy)
    }

    /// Drop records (and their series) that have been silent for two
    /// liveness windows. Returns how many were reaped.
    #[instrument(skip(self))]
    pub async fn reap_dead(&self) -> Result<u64> {
        let cutoff = self.clock.now_ms() - 2 * self.instance_ttl.as_millis() as i64;
        let mut reaped = 0;
        for key in self.store.scan("instance:*").await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let dead = match serde_json::from_str::<InstanceRecord>(&raw) {
                Ok(record) => record.last_heartbeat < cutoff,
                Err(_) => true,
            };
            if dead {
                let instance_id = key.trim_start_matches("instance:").to_string();
                self.store.delete(&key).await?;
                self.store.delete(&series_key(&instance_id)).await?;
                reaped += 1;
                info!(instance_id = %instance_id, "Reaped dead instance");
            }
        }
        Ok(reaped)
    }

    /// The healthy instance with the lowest composite load. Ties go to
    /// the instance with the older heartbeat.
    pub async fn least_loaded(&self) -> Result<Option<InstanceRecord>> {
        let mut healthy = self.healthy_instances().await?;
        healthy.sort_by(|a, b| {
            a.load_score()
                .total_cmp(&b.load_score())
                .then_with(|| a.last_heartbeat.cmp(&b.last_heartbeat))
        });
        Ok(healthy.into_iter().next())
    }

    /// Total open connections across healthy instances.
    pub async fn total_connections(&self) -> Result<u64> {
        Ok(self
            .healthy_instances()
            .await?
            .iter()
            .map(|r| r.active_connections)
            .sum())
    }

    /// Remove this instance's record and series. Called on shutdown.
    #[instrument(skip(self))]
    pub async fn deregister(&self) -> Result<()> {
        self.store.delete(&instance_key(&self.instance_id)).await?;
        self.store.delete(&series_key(&self.instance_id)).await?;
        info!(instance_id = %self.instance_id, "Instance deregistered");
        Ok(())
    }
}

/// Fixed-load sampler for tests and for deployments that disable
/// admission control.
#[derive(Debug, Default)]
pub struct StaticSampler {
    sample: Mutex<LoadSample>,
}

impl StaticSampler {
    /// Sampler that always reports the given load.
    pub fn new(cpu_pct: f64, mem_pct: f64) -> Self {
        Self {
            sample: Mutex::new(LoadSample { cpu_pct, mem_pct }),
        }
    }

    /// Change what the sampler reports from now on.
    pub fn set(&self, cpu_pct: f64, mem_pct: f64) {
        *self.sample.lock().expect("sampler mutex poisoned") = LoadSample { cpu_pct, mem_pct };
    }
}

impl LoadSampler for StaticSampler {
    fn sample(&self) -> LoadSample {
        *self.sample.lock().expect("sampler mutex poisoned")
    }
}
