//! Two (or more) coordination loops wired together with in-memory duplex
//! streams standing in for authenticated libp2p streams.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use ychat_net::{
    Direction, Event, EventBus, EventKind, InboundStream, Multiaddr, NetError, NodeConfig, PeerId,
    PeerStatus, Server, ServerHandle,
};
use ychat_shared::{Envelope, HandShake, UserInfo};
use ychat_store::{MemoryStore, RequestStatus, Storage};

struct Node {
    id: PeerId,
    addr: Multiaddr,
    handle: ServerHandle,
    store: Arc<MemoryStore>,
    events: mpsc::UnboundedReceiver<Event>,
}

fn node(name: &str, version: &str) -> Node {
    node_with_timeout(name, version, Duration::from_secs(5))
}

fn node_with_timeout(name: &str, version: &str, dial_timeout: Duration) -> Node {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new());
    let (tx, events) = mpsc::unbounded_channel();
    for kind in [
        EventKind::NewConnectionRequest,
        EventKind::ThreadListUpdated,
        EventKind::NewMessage,
    ] {
        let tx = tx.clone();
        bus.subscribe(kind, move |e| {
            let _ = tx.send(e);
        });
    }

    let config = NodeConfig {
        node_name: name.into(),
        version: version.into(),
        dial_timeout,
        ..NodeConfig::default()
    };
    let id = PeerId::random();
    let addr = format!("/ip4/10.0.0.1/tcp/3000/p2p/{id}").parse().unwrap();
    let handle = Server::new(config, store.clone(), bus).start_loop(id);

    Node {
        id,
        addr,
        handle,
        store,
        events,
    }
}

/// `a` dials `b`: b gets an inbound stream, a registers the outbound side
/// and sends its handshake.
async fn dial(a: &Node, b: &Node) {
    let (a_side, b_side) = tokio::io::duplex(64 * 1024);
    b.handle
        .attach_inbound(InboundStream {
            peer_id: a.id,
            address: Some(a.addr.clone()),
            stream: Box::new(b_side),
        })
        .await
        .unwrap();
    a.handle
        .connect_stream(b.id, Some(b.addr.clone()), Box::new(a_side))
        .await
        .unwrap();
}

async fn wait_for(rx: &mut mpsc::UnboundedReceiver<Event>, kind: EventKind) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("bus alive");
            if event.kind() == kind {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind} event"))
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held: {what}");
}

async fn registered(node: &Node, peer: &PeerId) {
    for _ in 0..100 {
        if node.handle.get_peer(peer).await.unwrap().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{peer} never registered");
}

fn request_status(store: &MemoryStore, peer: &PeerId, status: RequestStatus) -> bool {
    store
        .find_connection_request(&peer.to_string(), status)
        .unwrap()
        .is_some()
}

#[tokio::test]
async fn matching_versions_accept_flow() {
    let mut a = node("alice", "1.0");
    let mut b = node("bob", "1.0");

    dial(&a, &b).await;
    assert!(request_status(&a.store, &b.id, RequestStatus::Sent));

    match wait_for(&mut b.events, EventKind::NewConnectionRequest).await {
        Event::NewConnectionRequest(e) => {
            assert_eq!(e.peer_id, a.id.to_string());
            assert_eq!(e.username, "alice");
        }
        other => panic!("unexpected {other:?}"),
    }
    let pending = b.handle.pending_requests().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].address, a.addr.to_string());

    b.handle.accept_request(&a.id).await.unwrap();

    wait_for(&mut a.events, EventKind::ThreadListUpdated).await;
    let accepted = a
        .store
        .find_connection_request(&b.id.to_string(), RequestStatus::Accepted)
        .unwrap()
        .expect("sent -> accepted");
    assert_eq!(accepted.username, "bob");
    assert!(!request_status(&a.store, &b.id, RequestStatus::Sent));

    let contact = a.store.find_peer_info(&b.id.to_string()).unwrap().unwrap();
    assert_eq!(contact.username, "bob");
    assert_eq!(contact.address, b.addr.to_string());

    assert_eq!(b.handle.contacts().unwrap().len(), 1);
    assert!(b.handle.pending_requests().unwrap().is_empty());

    let a_view = a.handle.get_peer(&b.id).await.unwrap().unwrap();
    let b_view = b.handle.get_peer(&a.id).await.unwrap().unwrap();
    assert_eq!(a_view.status(), PeerStatus::Active);
    assert_eq!(b_view.status(), PeerStatus::Active);
}

#[tokio::test]
async fn version_mismatch_is_rejected() {
    let a = node("alice", "1.0");
    let c = node("carol", "2.0");

    dial(&a, &c).await;

    let a_store = a.store.clone();
    let c_id = c.id;
    eventually("a's request rejected", || {
        request_status(&a_store, &c_id, RequestStatus::Rejected)
    })
    .await;

    assert!(!request_status(&a.store, &c.id, RequestStatus::Accepted));
    assert!(a.store.find_peer_info(&c.id.to_string()).unwrap().is_none());
    assert!(c.store.connection_requests_for_peer(&a.id.to_string()).unwrap().is_empty());
}

#[tokio::test]
async fn local_rejection_reaches_dialer() {
    let a = node("alice", "1.0");
    let mut b = node("bob", "1.0");

    dial(&a, &b).await;
    wait_for(&mut b.events, EventKind::NewConnectionRequest).await;
    b.handle.reject_request(&a.id).await.unwrap();

    assert!(request_status(&b.store, &a.id, RequestStatus::Rejected));
    let a_store = a.store.clone();
    let b_id = b.id;
    eventually("a's request rejected", || {
        request_status(&a_store, &b_id, RequestStatus::Rejected)
    })
    .await;
    assert!(b.store.find_peer_info(&a.id.to_string()).unwrap().is_none());

    assert!(matches!(
        b.handle.accept_request(&a.id).await,
        Err(NetError::NoPendingRequest(_))
    ));
}

#[tokio::test]
async fn chat_after_acceptance() {
    let mut a = node("alice", "1.0");
    let mut b = node("bob", "1.0");

    dial(&a, &b).await;
    wait_for(&mut b.events, EventKind::NewConnectionRequest).await;
    b.handle.accept_request(&a.id).await.unwrap();
    wait_for(&mut a.events, EventKind::ThreadListUpdated).await;

    a.handle.send_chat(&b.id, "hi").await.unwrap();

    match wait_for(&mut b.events, EventKind::NewMessage).await {
        Event::NewMessage(m) => {
            assert_eq!(m.from, a.id.to_string());
            assert_eq!(m.message, "hi");
        }
        other => panic!("unexpected {other:?}"),
    }

    let history = a.handle.chat_history(&b.id, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].to, b.id.to_string());
    assert!(b.store.list_chat_messages(&a.id.to_string(), 10).unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_inbound_registrations() {
    let server = node("hub", "1.0");
    let mut remotes = Vec::new();
    let mut tasks = Vec::new();

    for _ in 0..16 {
        let (local, remote) = tokio::io::duplex(1024);
        remotes.push(remote);
        let handle = server.handle.clone();
        tasks.push(tokio::spawn(async move {
            handle
                .attach_inbound(InboundStream {
                    peer_id: PeerId::random(),
                    address: None,
                    stream: Box::new(local),
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let mut peers = Vec::new();
    for _ in 0..100 {
        peers = server.handle.get_peers().await.unwrap();
        if peers.len() == 16 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(peers.len(), 16);
    assert!(peers.iter().all(|p| p.status() == PeerStatus::Pending));
}

#[tokio::test]
async fn closed_stream_leaves_registry() {
    let server = node("hub", "1.0");
    let (local, remote) = tokio::io::duplex(1024);
    let id = PeerId::random();
    server
        .handle
        .attach_inbound(InboundStream {
            peer_id: id,
            address: None,
            stream: Box::new(local),
        })
        .await
        .unwrap();

    for _ in 0..100 {
        if server.handle.get_peer(&id).await.unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    drop(remote);

    for _ in 0..100 {
        if server.handle.get_peer(&id).await.unwrap().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("peer was never removed");
}

#[tokio::test]
async fn newer_stream_replaces_older_one() {
    let server = node("hub", "1.0");
    let id = PeerId::random();

    let (first_local, mut first_remote) = tokio::io::duplex(1024);
    server
        .handle
        .attach_inbound(InboundStream {
            peer_id: id,
            address: None,
            stream: Box::new(first_local),
        })
        .await
        .unwrap();
    let (second_local, _second_remote) = tokio::io::duplex(1024);
    server
        .handle
        .attach_inbound(InboundStream {
            peer_id: id,
            address: None,
            stream: Box::new(second_local),
        })
        .await
        .unwrap();

    // The older stream is shut down by the server.
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), first_remote.read_to_end(&mut buf))
        .await
        .expect("old stream closed");
    assert!(read.is_ok());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let peers = server.handle.get_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id(), id);
    assert!(!peers[0].is_closed());
}

#[tokio::test]
async fn decisions_need_a_live_peer() {
    let a = node("alice", "1.0");
    let mut b = node("bob", "1.0");

    let (a_side, b_side) = tokio::io::duplex(64 * 1024);
    b.handle
        .attach_inbound(InboundStream {
            peer_id: a.id,
            address: None,
            stream: Box::new(b_side),
        })
        .await
        .unwrap();
    a.handle
        .connect_stream(b.id, None, Box::new(a_side))
        .await
        .unwrap();
    wait_for(&mut b.events, EventKind::NewConnectionRequest).await;

    a.handle.shutdown().await;
    for _ in 0..100 {
        if b.handle.get_peer(&a.id).await.unwrap().is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(matches!(
        b.handle.accept_request(&a.id).await,
        Err(NetError::PeerNotConnected(_))
    ));
    assert!(request_status(&b.store, &a.id, RequestStatus::AwaitingDecision));

    assert!(matches!(
        b.handle.send_chat(&a.id, "anyone?").await,
        Err(NetError::PeerNotConnected(_))
    ));
}

#[tokio::test]
async fn operations_after_shutdown_fail_cleanly() {
    let a = node("alice", "1.0");
    a.handle.shutdown().await;

    assert!(matches!(a.handle.get_peers().await, Err(NetError::Shutdown)));
    assert!(matches!(
        a.handle.connect("/ip4/127.0.0.1/tcp/3000").await,
        Err(NetError::InvalidAddress { .. }) | Err(NetError::NotListening)
    ));
    assert_eq!(a.handle.node_id(), a.id);
    assert!(a.handle.full_addresses().is_empty());
}

#[tokio::test]
async fn accepting_a_stalled_peer_keeps_the_loop_responsive() {
    let mut b = node_with_timeout("bob", "1.0", Duration::from_millis(500));
    let remote_id = PeerId::random();
    let (local, mut remote) = tokio::io::duplex(8);
    b.handle
        .attach_inbound(InboundStream {
            peer_id: remote_id,
            address: None,
            stream: Box::new(local),
        })
        .await
        .unwrap();

    // The remote introduces itself and then never reads.
    let hs = Envelope::handshake(&HandShake {
        version: "1.0".into(),
        user_info: UserInfo {
            username: "mallory".into(),
            avatar_url: String::new(),
        },
    });
    let writer = tokio::spawn(async move {
        remote.write_all(&hs.to_frame().unwrap()).await.unwrap();
        remote
    });
    wait_for(&mut b.events, EventKind::NewConnectionRequest).await;
    let _remote = writer.await.unwrap();

    let handle = b.handle.clone();
    let accept = tokio::spawn(async move { handle.accept_request(&remote_id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let peers = tokio::time::timeout(Duration::from_millis(200), b.handle.get_peers())
        .await
        .expect("loop answers while the ack is blocked")
        .unwrap();
    assert_eq!(peers.len(), 1);

    assert!(matches!(accept.await.unwrap(), Err(NetError::Timeout(_))));
    assert!(request_status(&b.store, &remote_id, RequestStatus::Accepted));
    assert!(b.store.find_peer_info(&remote_id.to_string()).unwrap().is_some());
}

#[tokio::test]
async fn crossing_streams_keep_the_lower_dialer() {
    let server = node("hub", "1.0");
    let remote = PeerId::random();

    let (in_local, in_remote) = tokio::io::duplex(64 * 1024);
    server
        .handle
        .attach_inbound(InboundStream {
            peer_id: remote,
            address: None,
            stream: Box::new(in_local),
        })
        .await
        .unwrap();
    registered(&server, &remote).await;

    let (out_local, out_remote) = tokio::io::duplex(64 * 1024);
    server
        .handle
        .connect_stream(remote, None, Box::new(out_local))
        .await
        .unwrap();

    let (expected, mut dropped, _winner) = if server.id < remote {
        (Direction::Outbound, in_remote, out_remote)
    } else {
        (Direction::Inbound, out_remote, in_remote)
    };
    let kept = server.handle.get_peer(&remote).await.unwrap().unwrap();
    assert_eq!(kept.direction(), expected);
    assert!(!kept.is_closed());

    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), dropped.read_to_end(&mut buf))
        .await
        .expect("losing stream closed")
        .unwrap();
    assert!(!server.handle.get_peer(&remote).await.unwrap().unwrap().is_closed());
}

#[tokio::test]
async fn simultaneous_dials_settle_on_one_request() {
    let mut a = node("alice", "1.0");
    let mut b = node("bob", "1.0");

    let (a_out, b_in) = tokio::io::duplex(64 * 1024);
    let (b_out, a_in) = tokio::io::duplex(64 * 1024);
    let (a_connect, b_connect) = tokio::join!(
        async {
            a.handle
                .attach_inbound(InboundStream {
                    peer_id: b.id,
                    address: Some(b.addr.clone()),
                    stream: Box::new(a_in),
                })
                .await
                .unwrap();
            a.handle
                .connect_stream(b.id, Some(b.addr.clone()), Box::new(a_out))
                .await
        },
        async {
            b.handle
                .attach_inbound(InboundStream {
                    peer_id: a.id,
                    address: Some(a.addr.clone()),
                    stream: Box::new(b_in),
                })
                .await
                .unwrap();
            b.handle
                .connect_stream(a.id, Some(a.addr.clone()), Box::new(b_out))
                .await
        },
    );
    // The lower id dials on the stream both sides keep.
    if a.id < b.id {
        a_connect.unwrap();
    } else {
        b_connect.unwrap();
    }

    let (a_store, b_store, a_id, b_id) = (a.store.clone(), b.store.clone(), a.id, b.id);
    eventually("one side awaits a decision", || {
        request_status(&a_store, &b_id, RequestStatus::AwaitingDecision)
            || request_status(&b_store, &a_id, RequestStatus::AwaitingDecision)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let a_decides = request_status(&a.store, &b.id, RequestStatus::AwaitingDecision);
    let (decider, asker) = if a_decides { (&mut a, &mut b) } else { (&mut b, &mut a) };
    assert!(!request_status(&asker.store, &decider.id, RequestStatus::AwaitingDecision));
    assert!(request_status(&asker.store, &decider.id, RequestStatus::Sent));
    assert!(!request_status(&decider.store, &asker.id, RequestStatus::Sent));

    match wait_for(&mut decider.events, EventKind::NewConnectionRequest).await {
        Event::NewConnectionRequest(e) => assert_eq!(e.peer_id, asker.id.to_string()),
        other => panic!("unexpected {other:?}"),
    }

    decider.handle.accept_request(&asker.id).await.unwrap();
    wait_for(&mut asker.events, EventKind::ThreadListUpdated).await;

    assert!(request_status(&asker.store, &decider.id, RequestStatus::Accepted));
    assert!(asker.store.find_peer_info(&decider.id.to_string()).unwrap().is_some());
    assert!(decider.store.find_peer_info(&asker.id.to_string()).unwrap().is_some());
    while let Ok(event) = asker.events.try_recv() {
        assert_ne!(event.kind(), EventKind::NewConnectionRequest);
    }
}

#[tokio::test]
async fn undelivered_handshake_does_not_hide_a_later_request() {
    let mut a = node("alice", "1.0");
    let b = node("bob", "1.0");

    let (a_side, b_side) = tokio::io::duplex(1024);
    drop(b_side);
    assert!(a
        .handle
        .connect_stream(b.id, Some(b.addr.clone()), Box::new(a_side))
        .await
        .is_err());
    assert!(!request_status(&a.store, &b.id, RequestStatus::Sent));

    dial(&b, &a).await;
    match wait_for(&mut a.events, EventKind::NewConnectionRequest).await {
        Event::NewConnectionRequest(e) => assert_eq!(e.peer_id, b.id.to_string()),
        other => panic!("unexpected {other:?}"),
    }
    assert!(request_status(&a.store, &b.id, RequestStatus::AwaitingDecision));
}
