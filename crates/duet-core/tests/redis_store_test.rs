// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract tests for the redis store backend.
//!
//! These run only when `DUET_TEST_REDIS_URL` points at a disposable
//! redis instance; without it every test skips.

use std::time::Duration;

use uuid::Uuid;

use duet_core::store::{RedisStore, SharedStore};

/// Helper macro to skip tests if the redis URL is not set.
macro_rules! skip_if_no_redis {
    () => {
        if std::env::var("DUET_TEST_REDIS_URL").is_err() {
            eprintln!("Skipping test: DUET_TEST_REDIS_URL not set");
            return;
        }
    };
}

async fn connect() -> RedisStore {
    let url = std::env::var("DUET_TEST_REDIS_URL").unwrap();
    RedisStore::connect(&url, Duration::from_secs(5))
        .await
        .expect("redis reachable")
}

fn key(name: &str) -> String {
    format!("duet-test:{}:{name}", Uuid::new_v4())
}

#[tokio::test]
async fn test_strings_and_ttl() {
    skip_if_no_redis!();
    let store = connect().await;
    let k = key("string");

    store.set(&k, "v1", None).await.unwrap();
    assert_eq!(store.get(&k).await.unwrap().as_deref(), Some("v1"));
    assert!(!store.set_nx(&k, "v2", None).await.unwrap());
    assert!(store.delete(&k).await.unwrap());
    assert!(store.set_nx(&k, "v2", Some(Duration::from_millis(80))).await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(store.get(&k).await.unwrap().is_none());
}

#[tokio::test]
async fn test_ordered_set_contract() {
    skip_if_no_redis!();
    let store = connect().await;
    let k = key("zset");

    store.zadd(&k, "b", 2.0).await.unwrap();
    store.zadd(&k, "a", 1.0).await.unwrap();
    store.zadd(&k, "c", 1.0).await.unwrap();

    // Score then lexicographic member.
    let all = store.zrange(&k, 0, -1).await.unwrap();
    let members: Vec<&str> = all.iter().map(|m| m.member.as_str()).collect();
    assert_eq!(members, vec!["a", "c", "b"]);

    assert_eq!(store.zrank(&k, "c").await.unwrap(), Some(1));
    assert_eq!(store.zcard(&k).await.unwrap(), 3);
    assert_eq!(store.zscore(&k, "b").await.unwrap(), Some(2.0));

    let early = store
        .zrange_by_score(&k, f64::NEG_INFINITY, 1.5)
        .await
        .unwrap();
    assert_eq!(early.len(), 2);

    assert_eq!(
        store
            .zrem(&k, &["a".to_string(), "missing".to_string()])
            .await
            .unwrap(),
        1
    );
    store.delete(&k).await.unwrap();
}

#[tokio::test]
async fn test_lock_contract() {
    skip_if_no_redis!();
    let store = connect().await;
    let k = key("lock");

    let token = store
        .try_acquire(&k, Duration::from_secs(5))
        .await
        .unwrap()
        .expect("first acquire");
    assert!(store.try_acquire(&k, Duration::from_secs(5)).await.unwrap().is_none());
    assert!(!store.release(&k, "wrong-token").await.unwrap());
    assert!(store.release(&k, &token).await.unwrap());
    assert!(store.try_acquire(&k, Duration::from_secs(5)).await.unwrap().is_some());
    store.delete(&k).await.unwrap();
}

#[tokio::test]
async fn test_pubsub_contract() {
    skip_if_no_redis!();
    let store = connect().await;
    let channel = key("channel");

    let mut subscription = store.subscribe(&channel).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    store.publish(&channel, "one").await.unwrap();
    store.publish(&channel, "two").await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await
        .expect("message arrives");
    assert_eq!(first.as_deref(), Some("one"));
    let second = tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await
        .expect("message arrives");
    assert_eq!(second.as_deref(), Some("two"));
}

#[tokio::test]
async fn test_scan_contract() {
    skip_if_no_redis!();
    let store = connect().await;
    let prefix = key("scan");

    for i in 0..5 {
        store
            .set(&format!("{prefix}:{i}"), "x", Some(Duration::from_secs(30)))
            .await
            .unwrap();
    }
    let keys = store.scan(&format!("{prefix}:*")).await.unwrap();
    assert_eq!(keys.len(), 5);
    for k in keys {
        store.delete(&k).await.unwrap();
    }
}
