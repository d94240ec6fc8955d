// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests over a real WebSocket connection.
//!
//! Each test boots a full runtime on an ephemeral port with the in-memory
//! store and guest auth, then drives it with plain tokio-tungstenite
//! clients speaking raw JSON frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use duet_core::config::Config;
use duet_core::fleet::StaticSampler;
use duet_core::runtime::{CoreRuntime, RunningCore};

fn test_config() -> Config {
    let mut config = Config::default();
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.heartbeat_interval = Duration::from_millis(100);
    config.match_interval = Duration::from_millis(100);
    config
}

async fn start_core(sampler: StaticSampler) -> RunningCore {
    CoreRuntime::builder()
        .config(test_config())
        .sampler(Arc::new(sampler))
        .build()
        .start()
        .await
        .expect("runtime starts")
}

struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (stream, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("websocket connects");
        Self { stream }
    }

    /// Connect and complete the guest handshake.
    async fn login(addr: SocketAddr, name: &str) -> (Self, String) {
        let mut client = Self::connect(addr).await;
        client
            .send(json!({"type": "auth", "token": format!("guest:{}:{name}", Uuid::new_v4())}))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["type"], "auth:success", "handshake failed: {reply}");
        let user_id = reply["userId"].as_str().expect("user id").to_string();
        (client, user_id)
    }

    async fn send(&mut self, frame: Value) {
        self.stream
            .send(Message::Text(frame.to_string().into()))
            .await
            .expect("websocket send");
    }

    async fn recv(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), self.stream.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("websocket error");
            match message {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Close(_) => panic!("connection closed while waiting for a frame"),
                _ => continue,
            }
        }
    }

    /// Skip frames until one of the given type arrives.
    async fn recv_type(&mut self, ty: &str) -> Value {
        for _ in 0..20 {
            let frame = self.recv().await;
            if frame["type"] == ty {
                return frame;
            }
        }
        panic!("frame of type {ty} never arrived");
    }

    async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[tokio::test]
async fn test_quick_match_and_chat_end_to_end() {
    let core = start_core(StaticSampler::new(10.0, 10.0)).await;
    let addr = core.local_addr();

    let (mut alice, alice_id) = WsClient::login(addr, "Alice").await;
    let (mut bob, _bob_id) = WsClient::login(addr, "Bob").await;

    alice.send(json!({"type": "queue:join", "sessionType": "text"})).await;
    let position = alice.recv_type("queue:position").await;
    assert_eq!(position["position"], 1);

    bob.send(json!({"type": "queue:join", "sessionType": "text"})).await;

    let found_a = alice.recv_type("match:found").await;
    let found_b = bob.recv_type("match:found").await;
    assert_eq!(found_a["sessionId"], found_b["sessionId"]);
    assert_eq!(found_b["partnerUsername"], "Alice");
    assert_eq!(found_a["sessionType"], "text");

    alice.send(json!({"type": "chat:message", "text": "hi"})).await;
    let chat = bob.recv_type("chat:message").await;
    assert_eq!(chat["text"], "hi");
    assert_eq!(chat["senderId"], Value::String(alice_id));

    alice.close().await;
    bob.close().await;
    core.shutdown().await;
}

#[tokio::test]
async fn test_skip_notifies_partner_and_requeues() {
    let core = start_core(StaticSampler::new(10.0, 10.0)).await;
    let addr = core.local_addr();

    let (mut alice, _) = WsClient::login(addr, "Alice").await;
    let (mut bob, _) = WsClient::login(addr, "Bob").await;

    alice.send(json!({"type": "queue:join", "sessionType": "video"})).await;
    bob.send(json!({"type": "queue:join", "sessionType": "video"})).await;
    alice.recv_type("match:found").await;
    bob.recv_type("match:found").await;

    alice.send(json!({"type": "match:next"})).await;
    let gone = bob.recv_type("match:disconnected").await;
    assert_eq!(gone["reason"], "skip");

    // Alice is waiting again.
    let position = alice.recv_type("queue:position").await;
    assert_eq!(position["position"], 1);

    alice.close().await;
    bob.close().await;
    core.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_cascade_cleans_queue_and_session() {
    let core = start_core(StaticSampler::new(10.0, 10.0)).await;
    let addr = core.local_addr();

    // A queues alone and vanishes.
    let (mut alone, _) = WsClient::login(addr, "Alone").await;
    alone.send(json!({"type": "queue:join", "sessionType": "video"})).await;
    alone.recv_type("queue:position").await;
    alone.close().await;
    // Give the disconnect cascade a moment to clear the queue.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The cascade ran: the next two joiners match each other, not A.
    let (mut bob, bob_id) = WsClient::login(addr, "Bob").await;
    let (mut carol, carol_id) = WsClient::login(addr, "Carol").await;
    bob.send(json!({"type": "queue:join", "sessionType": "video"})).await;
    carol.send(json!({"type": "queue:join", "sessionType": "video"})).await;
    let found = bob.recv_type("match:found").await;
    assert_eq!(found["partnerId"], Value::String(carol_id));
    carol.recv_type("match:found").await;

    // A partner dropping mid-session notifies the survivor.
    bob.close().await;
    let gone = carol.recv_type("match:disconnected").await;
    assert_eq!(gone["reason"], "disconnect");
    let _ = bob_id;

    carol.close().await;
    core.shutdown().await;
}

#[tokio::test]
async fn test_invalid_token_is_refused() {
    let core = start_core(StaticSampler::new(10.0, 10.0)).await;
    let addr = core.local_addr();

    let mut client = WsClient::connect(addr).await;
    client.send(json!({"type": "auth", "token": "not-a-guest-token"})).await;
    let reply = client.recv().await;
    assert_eq!(reply["type"], "auth:error");

    core.shutdown().await;
}

#[tokio::test]
async fn test_overloaded_instance_refuses_new_upgrades_only() {
    let core = start_core(StaticSampler::new(95.0, 50.0)).await;
    let addr = core.local_addr();

    let error = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect_err("upgrade should be refused");
    match error {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 503);
        }
        other => panic!("expected an HTTP refusal, got {other:?}"),
    }

    core.shutdown().await;
}

#[tokio::test]
async fn test_overload_spares_existing_connections() {
    let sampler = Arc::new(StaticSampler::new(10.0, 10.0));
    let core = CoreRuntime::builder()
        .config(test_config())
        .sampler(sampler.clone())
        .build()
        .start()
        .await
        .expect("runtime starts");
    let addr = core.local_addr();

    let (mut alice, _) = WsClient::login(addr, "Alice").await;

    // Load spikes; the next heartbeat notices.
    sampler.set(95.0, 50.0);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());

    // Alice's socket still works.
    alice.send(json!({"type": "queue:join", "sessionType": "audio"})).await;
    let position = alice.recv_type("queue:position").await;
    assert_eq!(position["position"], 1);

    alice.close().await;
    core.shutdown().await;
}

#[tokio::test]
async fn test_validation_errors_keep_the_socket_open() {
    let core = start_core(StaticSampler::new(10.0, 10.0)).await;
    let addr = core.local_addr();

    let (mut alice, _) = WsClient::login(addr, "Alice").await;

    // Chat with no session: a typed error, not a disconnect.
    alice.send(json!({"type": "chat:message", "text": "hello?"})).await;
    let error = alice.recv_type("error").await;
    assert_eq!(error["code"], "NOT_IN_SESSION");

    // Garbage: still a typed error.
    alice.send(json!({"type": "no:such:type"})).await;
    let error = alice.recv_type("error").await;
    assert_eq!(error["code"], "VALIDATION");

    // The socket survived both.
    alice.send(json!({"type": "queue:join", "sessionType": "text"})).await;
    alice.recv_type("queue:position").await;

    alice.close().await;
    core.shutdown().await;
}

#[tokio::test]
async fn test_queue_join_rate_limit() {
    let core = start_core(StaticSampler::new(10.0, 10.0)).await;
    let addr = core.local_addr();

    let (mut alice, _) = WsClient::login(addr, "Alice").await;

    // Three joins in five seconds are allowed (leaving between joins);
    // the fourth is refused.
    for _ in 0..3 {
        alice.send(json!({"type": "queue:join", "sessionType": "text"})).await;
        alice.recv_type("queue:position").await;
        alice.send(json!({"type": "queue:leave", "sessionType": "text"})).await;
    }
    alice.send(json!({"type": "queue:join", "sessionType": "text"})).await;
    let error = alice.recv_type("queue:error").await;
    assert!(error["message"].as_str().unwrap().contains("slow down"));

    alice.close().await;
    core.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_notifies_active_sessions() {
    let core = start_core(StaticSampler::new(10.0, 10.0)).await;
    let addr = core.local_addr();

    let (mut alice, _) = WsClient::login(addr, "Alice").await;
    let (mut bob, _) = WsClient::login(addr, "Bob").await;
    alice.send(json!({"type": "queue:join", "sessionType": "text"})).await;
    bob.send(json!({"type": "queue:join", "sessionType": "text"})).await;
    alice.recv_type("match:found").await;
    bob.recv_type("match:found").await;

    let shutdown = tokio::spawn(core.shutdown());
    let gone = alice.recv_type("match:disconnected").await;
    assert_eq!(gone["reason"], "shutdown");
    shutdown.await.unwrap();
}
