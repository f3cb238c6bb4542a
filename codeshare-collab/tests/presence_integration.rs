//! Integration tests for cursor presence over a real server.
//!
//! Two or three clients join a session and check colors, cursor markers
//! and the outgoing cursor rate limit through the full network stack.

use std::sync::Arc;

use codeshare_collab::client::{ClientConfig, SyncClient};
use codeshare_collab::presence::{PeerColor, PALETTE};
use codeshare_collab::replica::{HeadlessView, SyncEvent};
use codeshare_collab::server::{ServerConfig, SyncServer};
use codeshare_core::Position;
use tokio::time::{timeout, Duration};

/// Start a server on a free port, return its URL.
async fn start_test_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        heartbeat_interval: Duration::from_secs(30),
    }));
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    format!("ws://127.0.0.1:{port}")
}

/// Connect and wait for the join to complete.
async fn connect_client(url: &str, user: &str, cursor_interval: Duration) -> SyncClient {
    let config = ClientConfig {
        cursor_interval,
        ..ClientConfig::new(url, "presence", user)
    };
    let mut client = SyncClient::connect(config, HeadlessView::default()).await.unwrap();
    client.wait_joined().await.unwrap();
    client
}

async fn wait_for(client: &mut SyncClient, mut matches: impl FnMut(&SyncEvent) -> bool) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match client.next_event().await {
                Some(event) if matches(&event) => return event,
                Some(_) => {}
                None => panic!("connection ended while waiting"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_cursor_reaches_peer() {
    let url = start_test_server().await;
    let mut alice = connect_client(&url, "alice", Duration::ZERO).await;
    let mut bob = connect_client(&url, "bob", Duration::ZERO).await;
    wait_for(&mut alice, |e| matches!(e, SyncEvent::PeerJoined { .. })).await;

    assert!(alice.move_cursor(Position::new(2, 7)).await.unwrap());

    let moved = wait_for(&mut bob, |e| matches!(e, SyncEvent::CursorMoved { .. })).await;
    assert_eq!(
        moved,
        SyncEvent::CursorMoved {
            user: "alice".to_string(),
            position: Position::new(2, 7)
        }
    );

    let marker = bob.view().markers.get("alice").expect("marker for alice");
    assert_eq!(marker.position, Position::new(2, 7));
    assert_eq!(marker.label(), "alice");
    assert_eq!(marker.color, PALETTE[0]);
}

#[tokio::test]
async fn test_marker_follows_latest_cursor() {
    let url = start_test_server().await;
    let mut alice = connect_client(&url, "alice", Duration::ZERO).await;
    let mut bob = connect_client(&url, "bob", Duration::ZERO).await;
    wait_for(&mut alice, |e| matches!(e, SyncEvent::PeerJoined { .. })).await;

    alice.move_cursor(Position::new(0, 1)).await.unwrap();
    wait_for(&mut bob, |e| matches!(e, SyncEvent::CursorMoved { .. })).await;
    alice.move_cursor(Position::new(4, 0)).await.unwrap();
    wait_for(&mut bob, |e| matches!(e, SyncEvent::CursorMoved { .. })).await;

    // One marker per peer, at its most recent position.
    assert_eq!(bob.view().markers.len(), 1);
    assert_eq!(bob.view().markers["alice"].position, Position::new(4, 0));
}

#[tokio::test]
async fn test_colors_unique_within_session() {
    let url = start_test_server().await;
    let mut alice = connect_client(&url, "alice", Duration::ZERO).await;
    let bob = connect_client(&url, "bob", Duration::ZERO).await;
    let carol = connect_client(&url, "carol", Duration::ZERO).await;
    wait_for(&mut alice, |e| matches!(e, SyncEvent::PeerJoined { user, .. } if user == "carol")).await;

    let presence = alice.replica().presence();
    let bob_color = presence.peer("bob").unwrap().color;
    let carol_color = presence.peer("carol").unwrap().color;
    assert_ne!(bob_color, carol_color);
    assert_eq!(bob_color, PALETTE[1]);
    assert_eq!(carol_color, PALETTE[2]);

    // Everyone agrees on the colors.
    let seen_by_carol: PeerColor = carol.replica().presence().peer("bob").unwrap().color;
    assert_eq!(seen_by_carol, bob_color);
    assert_eq!(bob.replica().presence().peer("alice").unwrap().color, PALETTE[0]);
}

#[tokio::test]
async fn test_late_joiner_sees_existing_cursors() {
    let url = start_test_server().await;
    let mut alice = connect_client(&url, "alice", Duration::ZERO).await;
    let mut bob = connect_client(&url, "bob", Duration::ZERO).await;
    wait_for(&mut alice, |e| matches!(e, SyncEvent::PeerJoined { .. })).await;

    alice.move_cursor(Position::new(3, 3)).await.unwrap();
    // Once bob has seen it, the server has recorded it.
    wait_for(&mut bob, |e| matches!(e, SyncEvent::CursorMoved { .. })).await;

    let carol = connect_client(&url, "carol", Duration::ZERO).await;
    let markers = &carol.view().markers;
    assert_eq!(markers.len(), 1);
    assert_eq!(markers["alice"].position, Position::new(3, 3));
    assert_eq!(carol.replica().presence().peer_count(), 2);
}

#[tokio::test]
async fn test_departed_peer_marker_removed() {
    let url = start_test_server().await;
    let mut alice = connect_client(&url, "alice", Duration::ZERO).await;
    let mut bob = connect_client(&url, "bob", Duration::ZERO).await;

    bob.move_cursor(Position::new(1, 1)).await.unwrap();
    wait_for(&mut alice, |e| matches!(e, SyncEvent::CursorMoved { .. })).await;
    assert!(alice.view().markers.contains_key("bob"));

    bob.leave().await;
    wait_for(&mut alice, |e| matches!(e, SyncEvent::PeerLeft { .. })).await;
    assert!(alice.view().markers.is_empty());
}

#[tokio::test]
async fn test_cursor_rate_limited() {
    let url = start_test_server().await;
    let mut alice = connect_client(&url, "alice", Duration::from_secs(60)).await;

    assert!(alice.move_cursor(Position::new(0, 1)).await.unwrap());
    assert!(!alice.move_cursor(Position::new(0, 2)).await.unwrap());
    assert!(!alice.move_cursor(Position::new(0, 3)).await.unwrap());
    assert_eq!(alice.replica().presence().local_cursor(), Position::new(0, 3));
}

#[tokio::test]
async fn test_own_cursor_not_echoed() {
    let url = start_test_server().await;
    let mut alice = connect_client(&url, "alice", Duration::ZERO).await;

    alice.move_cursor(Position::new(5, 5)).await.unwrap();
    let echoed = timeout(Duration::from_millis(200), async {
        loop {
            match alice.next_event().await {
                Some(SyncEvent::CursorMoved { .. }) => return,
                Some(_) => {}
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(echoed.is_err());
    assert!(alice.view().markers.is_empty());
}
