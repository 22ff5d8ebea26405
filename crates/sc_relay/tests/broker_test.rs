//! Broker behavior without sockets: routing, acks, backpressure,
//! supersession, rate limiting, statistics.

use std::time::Duration;

use tokio::time::timeout;

use sc_proto::{
    payloads::{AckPayload, ErrorCode, ErrorPayload},
    Frame, FrameType,
};
use sc_relay::{broker::Broker, BrokerConfig, RateConfig, RelayError};

fn chat_frame(id: &str, from: &str, to: &str) -> Frame {
    let payload = serde_json::json!({
        "id": id,
        "from": from,
        "to": to,
        "ciphertext": "b3BhcXVl",
    });
    Frame::new(FrameType::Chat, serde_json::to_vec(&payload).unwrap())
}

async fn recv_frame(rx: &mut tokio::sync::mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("queue closed")
}

fn parse_error(frame: &Frame) -> ErrorPayload {
    assert_eq!(frame.frame_type, FrameType::Error);
    serde_json::from_slice(&frame.payload).unwrap()
}

#[tokio::test]
async fn routes_between_authenticated_users_and_acks_sender() {
    let broker = Broker::start(BrokerConfig::default());

    let mut alice = broker.register();
    broker.authenticate(&alice.client_id, "alice").unwrap();
    let mut bob = broker.register();
    broker.authenticate(&bob.client_id, "bob").unwrap();

    broker
        .submit("alice", "env-1", "bob", chat_frame("env-1", "alice", "bob"))
        .unwrap();

    let delivered = recv_frame(&mut bob.outbound_rx).await;
    assert_eq!(delivered.frame_type, FrameType::Chat);

    let ack = recv_frame(&mut alice.outbound_rx).await;
    assert_eq!(ack.frame_type, FrameType::Ack);
    let ack: AckPayload = serde_json::from_slice(&ack.payload).unwrap();
    assert_eq!(ack.ref_id, "env-1");

    let stats = broker.snapshot();
    assert_eq!(stats.connected_clients, 2);
    assert_eq!(stats.authenticated_users, 2);
    assert_eq!(stats.messages_routed, 1);
}

#[tokio::test]
async fn offline_destination_bounces_user_offline() {
    let broker = Broker::start(BrokerConfig::default());
    let mut alice = broker.register();
    broker.authenticate(&alice.client_id, "alice").unwrap();

    broker
        .submit(
            "alice",
            "env-7",
            "carol",
            chat_frame("env-7", "alice", "carol"),
        )
        .unwrap();

    let error = parse_error(&recv_frame(&mut alice.outbound_rx).await);
    assert_eq!(error.code, ErrorCode::UserOffline);
    assert_eq!(error.ref_id.as_deref(), Some("env-7"));
}

#[tokio::test]
async fn full_destination_queue_bounces_queue_full_until_drained() {
    let config = BrokerConfig {
        outbound_queue: 2,
        ..Default::default()
    };
    let broker = Broker::start(config);

    let mut alice = broker.register();
    broker.authenticate(&alice.client_id, "alice").unwrap();
    let mut bob = broker.register();
    broker.authenticate(&bob.client_id, "bob").unwrap();

    // Fill bob's queue without draining it.
    for i in 0..2 {
        broker
            .submit(
                "alice",
                &format!("env-{i}"),
                "bob",
                chat_frame(&format!("env-{i}"), "alice", "bob"),
            )
            .unwrap();
        let ack = recv_frame(&mut alice.outbound_rx).await;
        assert_eq!(ack.frame_type, FrameType::Ack);
    }

    broker
        .submit("alice", "env-x", "bob", chat_frame("env-x", "alice", "bob"))
        .unwrap();
    let error = parse_error(&recv_frame(&mut alice.outbound_rx).await);
    assert_eq!(error.code, ErrorCode::QueueFull);
    assert_eq!(error.ref_id.as_deref(), Some("env-x"));

    // One read frees one slot; the next enqueue succeeds.
    let _ = recv_frame(&mut bob.outbound_rx).await;
    broker
        .submit("alice", "env-y", "bob", chat_frame("env-y", "alice", "bob"))
        .unwrap();
    let ack = recv_frame(&mut alice.outbound_rx).await;
    assert_eq!(ack.frame_type, FrameType::Ack);
}

#[tokio::test]
async fn second_login_supersedes_the_first() {
    let broker = Broker::start(BrokerConfig::default());

    let mut first = broker.register();
    broker.authenticate(&first.client_id, "alice").unwrap();

    let mut second = broker.register();
    broker.authenticate(&second.client_id, "alice").unwrap();

    // The earlier record is told to close with the superseded error.
    timeout(Duration::from_millis(100), first.close_rx.changed())
        .await
        .expect("supersession must land within 100 ms")
        .unwrap();
    let close = first.close_rx.borrow().clone().expect("close reason set");
    assert_eq!(close.reason, "superseded");
    assert_eq!(
        close.error.as_ref().map(|e| e.code),
        Some(ErrorCode::Superseded)
    );

    // Traffic for alice now lands on the newer connection.
    let mut bob = broker.register();
    broker.authenticate(&bob.client_id, "bob").unwrap();
    broker
        .submit("bob", "env-1", "alice", chat_frame("env-1", "bob", "alice"))
        .unwrap();
    let delivered = recv_frame(&mut second.outbound_rx).await;
    assert_eq!(delivered.frame_type, FrameType::Chat);

    // After the superseded actor unregisters, only one record remains for
    // alice in the user index.
    broker.unregister(&first.client_id);
    let stats = broker.snapshot();
    assert_eq!(stats.authenticated_users, 2);
}

#[tokio::test]
async fn rate_limit_kicks_in_after_the_burst() {
    let config = BrokerConfig {
        rate: RateConfig {
            per_minute: 60,
            burst: 5,
        },
        ..Default::default()
    };
    let broker = Broker::start(config);

    let mut alice = broker.register();
    broker.authenticate(&alice.client_id, "alice").unwrap();
    let _bob_ports = {
        let bob = broker.register();
        broker.authenticate(&bob.client_id, "bob").unwrap();
        bob
    };

    for i in 0..5 {
        broker
            .submit(
                "alice",
                &format!("env-{i}"),
                "bob",
                chat_frame(&format!("env-{i}"), "alice", "bob"),
            )
            .unwrap();
    }
    let err = broker
        .submit("alice", "env-6", "bob", chat_frame("env-6", "alice", "bob"))
        .unwrap_err();
    assert!(matches!(err, RelayError::RateLimited));

    // Another user is unaffected.
    broker
        .submit("bob", "env-b", "alice", chat_frame("env-b", "bob", "alice"))
        .unwrap();
    let delivered = recv_frame(&mut alice.outbound_rx).await;
    assert_eq!(delivered.frame_type, FrameType::Chat);
}

#[tokio::test]
async fn unregister_clears_the_user_index() {
    let broker = Broker::start(BrokerConfig::default());
    let alice = broker.register();
    broker.authenticate(&alice.client_id, "alice").unwrap();
    assert_eq!(broker.snapshot().authenticated_users, 1);

    broker.unregister(&alice.client_id);
    let stats = broker.snapshot();
    assert_eq!(stats.connected_clients, 0);
    assert_eq!(stats.authenticated_users, 0);
}
