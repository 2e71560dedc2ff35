//! Integration tests for end-to-end collaboration.
//!
//! These tests start a real relay server and connect real clients,
//! verifying join, change propagation, ack ordering, resync, and the
//! signaling pass-through.

use std::sync::Arc;

use devpad_collab::change::{ChangeDescriptor, EditEvent};
use devpad_collab::client::{CollabClient, CollabEvent, ConnectionState};
use devpad_collab::protocol::Message;
use devpad_collab::relay::{IdentityHook, RelayConfig, RelayServer, SnapshotHook};
use devpad_collab::signal::SignalMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server with the given config on a free port, return the port.
async fn start_server_with(mut config: RelayConfig) -> u16 {
    let port = free_port().await;
    config.bind_addr = format!("127.0.0.1:{port}");
    let server = RelayServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the server time to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn start_test_server() -> u16 {
    start_server_with(RelayConfig::default()).await
}

/// Snapshot hook serving "hello" for every session.
fn hello_snapshot() -> SnapshotHook {
    Arc::new(|_session| Box::pin(async move { Some("hello".to_string()) }))
}

/// Wait for the first event matching the predicate, skipping others.
async fn expect_event<F>(rx: &mut mpsc::Receiver<CollabEvent>, mut pred: F) -> CollabEvent
where
    F: FnMut(&CollabEvent) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Read the next protocol message from a raw socket, skipping transport
/// frames.
async fn read_message(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> Message {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("websocket error");
        if let WsMessage::Binary(data) = frame {
            let bytes: Vec<u8> = data.into();
            return Message::decode(&bytes).unwrap();
        }
    }
}

async fn send_message(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>, msg: &Message) {
    ws.send(WsMessage::Binary(msg.encode().unwrap().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_receives_cold_start_snapshot() {
    let config = RelayConfig {
        load_snapshot: Some(hello_snapshot()),
        ..RelayConfig::default()
    };
    let port = start_server_with(config).await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = CollabClient::new("project-1", "tok", &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let synced = expect_event(&mut events, |e| matches!(e, CollabEvent::StateSynced { .. })).await;
    match synced {
        CollabEvent::StateSynced { revision, text } => {
            assert_eq!(revision, 0);
            assert_eq!(text, "hello");
        }
        _ => unreachable!(),
    }

    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(client.document().await, "hello");
}

#[tokio::test]
async fn test_second_joiner_notifies_peers() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client1 = CollabClient::new("doc1", "tok", &url);
    let mut events1 = client1.take_event_rx().unwrap();
    client1.connect().await.unwrap();
    expect_event(&mut events1, |e| matches!(e, CollabEvent::StateSynced { .. })).await;

    let mut client2 = CollabClient::new("doc1", "tok", &url);
    let mut events2 = client2.take_event_rx().unwrap();
    client2.connect().await.unwrap();
    expect_event(&mut events2, |e| matches!(e, CollabEvent::StateSynced { .. })).await;

    let joined = expect_event(&mut events1, |e| matches!(e, CollabEvent::PeerJoined(_))).await;
    match joined {
        CollabEvent::PeerJoined(peer) => assert_eq!(peer, client2.connection_id()),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_edit_propagates_and_acks() {
    let config = RelayConfig {
        load_snapshot: Some(hello_snapshot()),
        ..RelayConfig::default()
    };
    let port = start_server_with(config).await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut alice = CollabClient::new("doc1", "tok", &url);
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    expect_event(&mut alice_events, |e| matches!(e, CollabEvent::StateSynced { .. })).await;

    let mut bob = CollabClient::new("doc1", "tok", &url);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    expect_event(&mut bob_events, |e| matches!(e, CollabEvent::StateSynced { .. })).await;

    // Let the join notifications settle.
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.local_edit(EditEvent::new(5, 5, " world")).await.unwrap();

    let confirmed = expect_event(&mut alice_events, |e| {
        matches!(e, CollabEvent::EditConfirmed { .. })
    })
    .await;
    match confirmed {
        CollabEvent::EditConfirmed { revision } => assert_eq!(revision, 1),
        _ => unreachable!(),
    }

    let remote = expect_event(&mut bob_events, |e| matches!(e, CollabEvent::RemoteEdit { .. })).await;
    match remote {
        CollabEvent::RemoteEdit {
            instruction,
            revision,
            originator,
        } => {
            assert_eq!(instruction.from_offset, 5);
            assert_eq!(instruction.inserted_text, " world");
            assert_eq!(revision, 1);
            assert_eq!(originator, alice.connection_id());
        }
        _ => unreachable!(),
    }

    assert_eq!(alice.document().await, "hello world");
    assert_eq!(bob.document().await, "hello world");
}

#[tokio::test]
async fn test_revisions_strictly_sequential() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = CollabClient::new("doc1", "tok", &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    expect_event(&mut events, |e| matches!(e, CollabEvent::StateSynced { .. })).await;

    // Fire three edits back to back; the second and third queue behind the
    // outstanding one and are sent as the acks come in.
    client.local_edit(EditEvent::new(0, 0, "a")).await.unwrap();
    client.local_edit(EditEvent::new(1, 1, "b")).await.unwrap();
    client.local_edit(EditEvent::new(2, 2, "c")).await.unwrap();

    let mut revisions = Vec::new();
    for _ in 0..3 {
        let event = expect_event(&mut events, |e| {
            matches!(e, CollabEvent::EditConfirmed { .. })
        })
        .await;
        if let CollabEvent::EditConfirmed { revision } = event {
            revisions.push(revision);
        }
    }

    assert_eq!(revisions, vec![1, 2, 3]);
    assert_eq!(client.document().await, "abc");
    assert_eq!(client.last_seen_revision().await, 3);
}

#[tokio::test]
async fn test_reconnect_without_missed_changes_needs_no_resync() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = CollabClient::new("doc1", "tok", &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    expect_event(&mut events, |e| matches!(e, CollabEvent::StateSynced { .. })).await;

    // Reconnect while the membership is still live: the join resumes
    // silently and the resync request comes back as a no-op.
    client.reconnect(3).await.unwrap();
    expect_event(&mut events, |e| matches!(e, CollabEvent::Connected)).await;

    let extra_snapshot = timeout(Duration::from_millis(300), async {
        loop {
            if let Some(CollabEvent::StateSynced { .. }) = events.recv().await {
                break;
            }
        }
    })
    .await;
    assert!(extra_snapshot.is_err(), "matching revisions should not resync");
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(client.last_seen_revision().await, 0);
}

#[tokio::test]
async fn test_reconnect_after_missed_changes_resyncs() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut alice = CollabClient::new("doc1", "tok", &url);
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    expect_event(&mut alice_events, |e| matches!(e, CollabEvent::StateSynced { .. })).await;

    let mut bob = CollabClient::new("doc1", "tok", &url);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    expect_event(&mut bob_events, |e| matches!(e, CollabEvent::StateSynced { .. })).await;

    // Alice leaves; Bob keeps editing.
    alice.disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob.local_edit(EditEvent::new(0, 0, "bob was here: ")).await.unwrap();
    expect_event(&mut bob_events, |e| matches!(e, CollabEvent::EditConfirmed { .. })).await;

    // Alice reconnects behind revision 1 and gets the full snapshot.
    alice.reconnect(3).await.unwrap();
    let synced = expect_event(&mut alice_events, |e| {
        matches!(e, CollabEvent::StateSynced { revision, .. } if *revision == 1)
    })
    .await;
    match synced {
        CollabEvent::StateSynced { text, .. } => assert_eq!(text, "bob was here: "),
        _ => unreachable!(),
    }
    assert_eq!(alice.document().await, "bob was here: ");
}

#[tokio::test]
async fn test_session_state_survives_brief_disconnect() {
    let config = RelayConfig {
        teardown_grace: Duration::from_millis(300),
        ..RelayConfig::default()
    };
    let port = start_server_with(config).await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = CollabClient::new("doc1", "tok", &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    expect_event(&mut events, |e| matches!(e, CollabEvent::StateSynced { .. })).await;

    client.local_edit(EditEvent::new(0, 0, "kept")).await.unwrap();
    expect_event(&mut events, |e| matches!(e, CollabEvent::EditConfirmed { .. })).await;

    // Leave and come back inside the grace window.
    client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.reconnect(3).await.unwrap();

    let synced = expect_event(&mut events, |e| matches!(e, CollabEvent::StateSynced { .. })).await;
    match synced {
        CollabEvent::StateSynced { revision, text } => {
            assert_eq!(revision, 1, "revision state should survive the grace window");
            assert_eq!(text, "kept");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_rejected_identity_surfaces_session_unavailable() {
    let authenticate: IdentityHook = Arc::new(|token| {
        Box::pin(async move {
            if token == "valid" {
                Some("user-1".to_string())
            } else {
                None
            }
        })
    });
    let config = RelayConfig {
        authenticate: Some(authenticate),
        ..RelayConfig::default()
    };
    let port = start_server_with(config).await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = CollabClient::new("doc1", "expired-token", &url);
    let mut events = client.take_event_rx().unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, devpad_collab::protocol::ProtocolError::AuthRequired));

    let rejected = expect_event(&mut events, |e| {
        matches!(e, CollabEvent::SessionRejected { .. })
    })
    .await;
    match rejected {
        CollabEvent::SessionRejected { reason } => {
            assert_eq!(reason, "identity token rejected")
        }
        _ => unreachable!(),
    }
    assert_eq!(
        client.connection_state().await,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_signal_relayed_to_addressee() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut alice = CollabClient::new("doc1", "tok", &url);
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    expect_event(&mut alice_events, |e| matches!(e, CollabEvent::StateSynced { .. })).await;

    let mut bob = CollabClient::new("doc1", "tok", &url);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    expect_event(&mut bob_events, |e| matches!(e, CollabEvent::StateSynced { .. })).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let offer = SignalMessage::Offer {
        from: alice.connection_id(),
        to: bob.connection_id(),
        sdp: "v=0".to_string(),
    };
    alice.send_signal(&offer).await.unwrap();

    let received = expect_event(&mut bob_events, |e| matches!(e, CollabEvent::Signal(_))).await;
    match received {
        CollabEvent::Signal(signal) => {
            assert_eq!(signal, offer);
            assert_eq!(signal.from(), alice.connection_id());
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_unacceptable_change_burns_no_revision() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let conn = Uuid::new_v4();
    send_message(
        &mut ws,
        &Message::JoinSession {
            session_id: "doc1".to_string(),
            connection_id: conn,
            identity_token: "tok".to_string(),
        },
    )
    .await;
    assert!(matches!(
        read_message(&mut ws).await,
        Message::SessionState { revision: 0, .. }
    ));

    // Offsets far beyond the empty document: not accepted, answered with a
    // fresh snapshot instead of an ack, and never fanned out.
    send_message(
        &mut ws,
        &Message::Change {
            descriptor: ChangeDescriptor {
                from_offset: 50,
                to_offset: 60,
                inserted_text: "x".to_string(),
                origin_revision: 0,
                originator: conn,
            },
        },
    )
    .await;
    assert!(matches!(
        read_message(&mut ws).await,
        Message::SessionState { revision: 0, .. }
    ));

    // The revision counter did not advance: a valid change still gets 1.
    send_message(
        &mut ws,
        &Message::Change {
            descriptor: ChangeDescriptor {
                from_offset: 0,
                to_offset: 0,
                inserted_text: "a".to_string(),
                origin_revision: 0,
                originator: conn,
            },
        },
    )
    .await;
    assert!(matches!(
        read_message(&mut ws).await,
        Message::ChangeAck {
            assigned_revision: 1
        }
    ));
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut alice = CollabClient::new("doc1", "tok", &url);
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    expect_event(&mut alice_events, |e| matches!(e, CollabEvent::StateSynced { .. })).await;

    let mut carol = CollabClient::new("doc2", "tok", &url);
    let mut carol_events = carol.take_event_rx().unwrap();
    carol.connect().await.unwrap();
    expect_event(&mut carol_events, |e| matches!(e, CollabEvent::StateSynced { .. })).await;

    alice.local_edit(EditEvent::new(0, 0, "only doc1")).await.unwrap();
    expect_event(&mut alice_events, |e| matches!(e, CollabEvent::EditConfirmed { .. })).await;

    // Carol is in a different session and must see nothing.
    let leaked = timeout(Duration::from_millis(300), async {
        loop {
            if let Some(CollabEvent::RemoteEdit { .. }) = carol_events.recv().await {
                break;
            }
        }
    })
    .await;
    assert!(leaked.is_err(), "doc2 must not receive doc1 changes");
    assert_eq!(carol.document().await, "");
}
