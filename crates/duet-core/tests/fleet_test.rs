// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for fleet coordination: heartbeats, admission, and reaping.

mod common;

use std::sync::Arc;

use common::TestContext;
use duet_core::clock::ManualClock;
use duet_core::store::{MemoryStore, SharedStore};

#[tokio::test]
async fn test_register_makes_the_instance_visible() {
    let ctx = TestContext::new();
    ctx.fleet.register().await.unwrap();

    let healthy = ctx.fleet.healthy_instances().await.unwrap();
    assert_eq!(healthy.len(), 1);
    assert_eq!(healthy[0].instance_id, ctx.fleet.instance_id());
    assert!(healthy[0].healthy);
}

#[tokio::test]
async fn test_admission_follows_the_load_watermarks() {
    let ctx = TestContext::new();
    ctx.fleet.register().await.unwrap();
    assert!(ctx.fleet.should_accept());

    // CPU above 90% refuses.
    ctx.sampler.set(95.0, 20.0);
    ctx.fleet.heartbeat(10).await.unwrap();
    assert!(!ctx.fleet.should_accept());

    // Memory above 85% refuses too.
    ctx.sampler.set(10.0, 90.0);
    ctx.fleet.heartbeat(10).await.unwrap();
    assert!(!ctx.fleet.should_accept());

    // Back under both watermarks.
    ctx.sampler.set(50.0, 50.0);
    ctx.fleet.heartbeat(10).await.unwrap();
    assert!(ctx.fleet.should_accept());
}

#[tokio::test]
async fn test_silent_instances_drop_out_of_the_healthy_view() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let instance1 = TestContext::over_store("host-1", clock.clone(), store.clone());
    let instance2 = TestContext::over_store("host-2", clock.clone(), store);

    instance1.fleet.register().await.unwrap();
    instance2.fleet.register().await.unwrap();
    assert_eq!(instance1.fleet.healthy_instances().await.unwrap().len(), 2);

    // Instance 2 goes silent; instance 1 keeps heartbeating.
    clock.advance_ms(15_000);
    instance1.fleet.heartbeat(3).await.unwrap();
    clock.advance_ms(16_000);
    instance1.fleet.heartbeat(3).await.unwrap();

    // 31 s of silence: dead regardless of record TTL.
    let healthy = instance1.fleet.healthy_instances().await.unwrap();
    assert_eq!(healthy.len(), 1);
    assert_eq!(healthy[0].instance_id, instance1.fleet.instance_id());
}

#[tokio::test]
async fn test_reaper_removes_long_dead_records_and_series() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let instance1 = TestContext::over_store("host-1", clock.clone(), store.clone());
    let instance2 = TestContext::over_store("host-2", clock.clone(), store.clone());

    instance1.fleet.register().await.unwrap();
    instance2.fleet.register().await.unwrap();

    // Keep instance 1 fresh while instance 2 rots. The memory store
    // would expire the record by TTL on its own, which is exactly what
    // the reaper exists to back up, so pin the record by rewriting it
    // with the old heartbeat timestamp.
    let dead_key = format!("instance:{}", instance2.fleet.instance_id());
    let dead_record = store.get(&dead_key).await.unwrap().unwrap();
    clock.advance_ms(61_000);
    instance1.fleet.heartbeat(0).await.unwrap();
    store.set(&dead_key, &dead_record, None).await.unwrap();

    assert_eq!(instance1.fleet.reap_dead().await.unwrap(), 1);
    assert!(store.get(&dead_key).await.unwrap().is_none());
    let series_key = format!("instance-load:{}", instance2.fleet.instance_id());
    assert_eq!(store.zcard(&series_key).await.unwrap(), 0);
}

#[tokio::test]
async fn test_least_loaded_ranks_by_composite_score() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let cool = TestContext::over_store("cool-host", clock.clone(), store.clone());
    let hot = TestContext::over_store("hot-host", clock.clone(), store);

    cool.sampler.set(10.0, 10.0);
    hot.sampler.set(80.0, 70.0);
    cool.fleet.register().await.unwrap();
    hot.fleet.register().await.unwrap();
    cool.fleet.heartbeat(5).await.unwrap();
    hot.fleet.heartbeat(5).await.unwrap();

    let best = cool
        .fleet
        .least_loaded()
        .await
        .unwrap()
        .expect("two instances registered");
    assert_eq!(best.instance_id, cool.fleet.instance_id());
}

#[tokio::test]
async fn test_total_connections_sums_the_fleet() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let instance1 = TestContext::over_store("host-1", clock.clone(), store.clone());
    let instance2 = TestContext::over_store("host-2", clock.clone(), store);

    instance1.fleet.register().await.unwrap();
    instance2.fleet.register().await.unwrap();
    instance1.fleet.heartbeat(12).await.unwrap();
    instance2.fleet.heartbeat(30).await.unwrap();

    assert_eq!(instance1.fleet.total_connections().await.unwrap(), 42);
}

#[tokio::test]
async fn test_deregister_removes_the_record() {
    let ctx = TestContext::new();
    ctx.fleet.register().await.unwrap();
    ctx.fleet.deregister().await.unwrap();
    assert!(ctx.fleet.healthy_instances().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_load_series_is_capped() {
    let ctx = TestContext::new();
    for _ in 0..110 {
        ctx.fleet.heartbeat(1).await.unwrap();
        ctx.clock.advance_ms(1_000);
    }
    let series_key = format!("instance-load:{}", ctx.fleet.instance_id());
    let len = ctx.store.zcard(&series_key).await.unwrap();
    assert!(len <= 100, "series grew to {len}");
    assert!(len >= 90, "series unexpectedly small: {len}");
}
