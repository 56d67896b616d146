//! Awareness propagation and peer links over real transports.

mod common;

use common::{eventually, start_relay, Client};
use peer_collab::{MemoryNetwork, SessionEvent, SessionOptions, TcpTransportFactory};
use serde_json::json;
use tokio::time::{timeout, Duration};

#[tokio::test]
async fn test_presence_reaches_peer() {
    let relay = start_relay().await;
    let net = MemoryNetwork::new();
    let alice = Client::new();
    let bob = Client::new();

    alice
        .awareness
        .set_local_state(Some(json!({"user": {"name": "alice"}, "cursor": null})));
    let a = alice.join("cursors", &relay, &net, None);
    let b = bob.join("cursors", &relay, &net, None);

    let alice_id = alice.awareness.client_id();
    eventually("bob sees alice", 10, || {
        bob.awareness.states().get(&alice_id).map(|s| s["user"]["name"] == "alice") == Some(true)
    })
    .await;

    // Later changes are pushed too
    alice
        .awareness
        .set_local_state(Some(json!({"user": {"name": "alice"}, "cursor": 7})));
    eventually("bob sees the cursor move", 10, || {
        bob.awareness.states().get(&alice_id).map(|s| s["cursor"] == 7) == Some(true)
    })
    .await;

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_presence_removed_when_peer_leaves() {
    let relay = start_relay().await;
    let net = MemoryNetwork::new();
    let alice = Client::new();
    let bob = Client::new();

    alice.awareness.set_local_state(Some(json!({"name": "alice"})));
    bob.awareness.set_local_state(Some(json!({"name": "bob"})));
    let a = alice.join("leaving", &relay, &net, None);
    let b = bob.join("leaving", &relay, &net, None);

    let alice_id = alice.awareness.client_id();
    let bob_id = bob.awareness.client_id();
    eventually("both see each other", 10, || {
        alice.awareness.states().contains_key(&bob_id)
            && bob.awareness.states().contains_key(&alice_id)
    })
    .await;

    a.close().await.unwrap();

    // Well before the outdated timeout would kick in
    eventually("alice gone from bob", 5, || {
        !bob.awareness.states().contains_key(&alice_id)
    })
    .await;
    // Closing keeps the local state on alice's side
    assert!(alice.awareness.local_state().is_some());

    b.close().await.unwrap();
}

#[tokio::test]
async fn test_tcp_transport_end_to_end() {
    let relay = start_relay().await;
    let alice = Client::new();
    let bob = Client::new();

    alice.push("over tcp");
    alice.awareness.set_local_state(Some(json!({"name": "alice"})));

    let open = |c: &Client| {
        let options = SessionOptions::new()
            .with_signaling_urls([relay.as_str()])
            .with_transport(TcpTransportFactory::default());
        c.hub
            .open("wire", c.doc.clone(), c.awareness.clone(), options)
            .unwrap()
    };
    let a = open(&alice);
    let b = open(&bob);

    eventually("document over tcp", 10, || bob.text() == "over tcp").await;
    let alice_id = alice.awareness.client_id();
    eventually("presence over tcp", 10, || {
        bob.awareness.states().contains_key(&alice_id)
    })
    .await;

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_peer_does_not_pin_unsynced() {
    let relay = start_relay().await;
    let alice = Client::new();
    let bob = Client::new();

    // Offers advertise an address nobody listens on
    let open = |c: &Client| {
        let transport = TcpTransportFactory::new("127.0.0.1", "127.0.0.2")
            .with_connect_timeout(Duration::from_millis(300));
        let options = SessionOptions::new()
            .with_signaling_urls([relay.as_str()])
            .with_transport(transport);
        c.hub
            .open("unreachable", c.doc.clone(), c.awareness.clone(), options)
            .unwrap()
    };
    let mut a = open(&alice);
    let mut b = open(&bob);

    // Each side sees its link appear and then go away again
    for session in [&mut a, &mut b] {
        let mut events = session.events().unwrap();
        let mut seen = Vec::new();
        while !seen.windows(2).any(|w| w == [false, true]) {
            match timeout(Duration::from_secs(10), events.recv()).await {
                Ok(Some(SessionEvent::Synced { synced })) => seen.push(synced),
                other => panic!("no recovery, saw {seen:?} then {other:?}"),
            }
        }
    }

    a.close().await.unwrap();
    b.close().await.unwrap();
}
