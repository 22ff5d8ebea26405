//! End-to-end engine flow over in-process channels: two engines wired
//! through a test router standing in for the relay.

use std::{sync::Arc, time::Duration};

use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use sc_client::{
    engine::{ChatEngine, Command},
    transport::TransportEvent,
    Config, EngineEvent,
};
use sc_proto::{Frame, FrameType, RoutingInfo};
use sc_store::{MemoryStore, Storage};

struct TestPeer {
    inbound: mpsc::Sender<TransportEvent>,
    commands: mpsc::Sender<Command>,
    events: broadcast::Receiver<EngineEvent>,
}

fn spawn_engine(user_id: &str) -> (TestPeer, mpsc::Receiver<Frame>) {
    let store: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);

    let config = Config::new(user_id, vec!["ws://relay.test/ws".into()]);
    let engine = ChatEngine::new(config, store, outbound_tx, commands_tx.clone()).unwrap();
    let events = engine.subscribe();
    tokio::spawn(engine.run(inbound_rx, commands_rx));

    (
        TestPeer {
            inbound: inbound_tx,
            commands: commands_tx,
            events,
        },
        outbound_rx,
    )
}

/// Route chat/key_exchange frames between the two engines by their `to`
/// field, exactly as the relay would; drop everything else.
fn spawn_router(
    mut alice_out: mpsc::Receiver<Frame>,
    mut bob_out: mpsc::Receiver<Frame>,
    alice_in: mpsc::Sender<TransportEvent>,
    bob_in: mpsc::Sender<TransportEvent>,
) {
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                f = alice_out.recv() => f,
                f = bob_out.recv() => f,
            };
            let Some(frame) = frame else { break };
            if !matches!(frame.frame_type, FrameType::Chat | FrameType::KeyExchange) {
                continue;
            }
            let Ok(route) = RoutingInfo::from_payload(&frame.payload) else {
                continue;
            };
            let target = match route.to.as_str() {
                "alice" => &alice_in,
                "bob" => &bob_in,
                _ => continue,
            };
            let _ = target.send(TransportEvent::Frame(frame)).await;
        }
    });
}

async fn next_matching<F>(
    events: &mut broadcast::Receiver<EngineEvent>,
    mut predicate: F,
) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn first_message_establishes_session_and_delivers() {
    let (mut alice, alice_out) = spawn_engine("alice");
    let (mut bob, bob_out) = spawn_engine("bob");
    spawn_router(alice_out, bob_out, alice.inbound.clone(), bob.inbound.clone());

    alice
        .commands
        .send(Command::SendText {
            to: "bob".into(),
            body: "hi".into(),
        })
        .await
        .unwrap();

    // Bundle request/response completes and the buffered message flushes.
    next_matching(&mut alice.events, |e| {
        matches!(e, EngineEvent::SessionEstablished { user_id } if user_id == "bob")
    })
    .await;

    let received = next_matching(&mut bob.events, |e| {
        matches!(e, EngineEvent::MessageReceived { .. })
    })
    .await;
    match received {
        EngineEvent::MessageReceived { from, plaintext, .. } => {
            assert_eq!(from, "alice");
            assert_eq!(plaintext, "hi");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn reply_flows_back_over_the_established_session() {
    let (mut alice, alice_out) = spawn_engine("alice");
    let (mut bob, bob_out) = spawn_engine("bob");
    spawn_router(alice_out, bob_out, alice.inbound.clone(), bob.inbound.clone());

    alice
        .commands
        .send(Command::SendText {
            to: "bob".into(),
            body: "ping".into(),
        })
        .await
        .unwrap();
    next_matching(&mut bob.events, |e| {
        matches!(e, EngineEvent::MessageReceived { .. })
    })
    .await;

    bob.commands
        .send(Command::SendText {
            to: "alice".into(),
            body: "pong".into(),
        })
        .await
        .unwrap();
    let reply = next_matching(&mut alice.events, |e| {
        matches!(e, EngineEvent::MessageReceived { .. })
    })
    .await;
    match reply {
        EngineEvent::MessageReceived { from, plaintext, .. } => {
            assert_eq!(from, "bob");
            assert_eq!(plaintext, "pong");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn several_messages_keep_decrypting_in_both_directions() {
    let (mut alice, alice_out) = spawn_engine("alice");
    let (mut bob, bob_out) = spawn_engine("bob");
    spawn_router(alice_out, bob_out, alice.inbound.clone(), bob.inbound.clone());

    alice
        .commands
        .send(Command::SendText {
            to: "bob".into(),
            body: "m0".into(),
        })
        .await
        .unwrap();
    next_matching(&mut bob.events, |e| {
        matches!(e, EngineEvent::MessageReceived { plaintext, .. } if plaintext == "m0")
    })
    .await;

    for i in 1..4 {
        let body = format!("m{i}");
        alice
            .commands
            .send(Command::SendText {
                to: "bob".into(),
                body: body.clone(),
            })
            .await
            .unwrap();
        next_matching(&mut bob.events, |e| {
            matches!(e, EngineEvent::MessageReceived { plaintext, .. } if *plaintext == body)
        })
        .await;

        let reply = format!("r{i}");
        bob.commands
            .send(Command::SendText {
                to: "alice".into(),
                body: reply.clone(),
            })
            .await
            .unwrap();
        next_matching(&mut alice.events, |e| {
            matches!(e, EngineEvent::MessageReceived { plaintext, .. } if *plaintext == reply)
        })
        .await;
    }
}
