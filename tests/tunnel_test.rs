//! Integration tests for the tunnel
//!
//! All scenarios run over the in-memory transport with compressed
//! housekeeping intervals. Unicast dials only complete once the remote
//! listener accepts, so the accepting side runs in its own task.

use std::sync::Arc;
use std::time::Duration;
use weft::transport::MemoryTransport;
use weft::{DialOptions, Error, ListenOptions, Message, Mode, Tunnel, TunnelOptions};

fn options(transport: &MemoryTransport, addr: &str, nodes: Vec<String>) -> TunnelOptions {
    TunnelOptions::new()
        .with_address(addr)
        .with_nodes(nodes)
        .with_transport(Arc::new(transport.clone()))
        .with_dial_timeout(Duration::from_secs(2))
        .with_intervals(
            Duration::from_millis(200), // discover
            Duration::from_millis(200), // keepalive
            Duration::from_millis(100), // reconnect
            Duration::from_secs(60),    // maintenance
        )
}

/// A single tunnel dialing its own listener over the loopback link
#[tokio::test]
async fn test_loopback_listen_dial() {
    let transport = MemoryTransport::new();

    let tunnel = Tunnel::new(options(&transport, "node-a", vec!["node-a".to_string()]));
    tunnel.connect().await.unwrap();

    let listener = tunnel.listen("chat", ListenOptions::new()).await.unwrap();

    let accept_task = tokio::spawn(async move {
        let accepted = listener.accept().await.unwrap();
        let msg = accepted.recv().await.unwrap();
        assert_eq!(&msg.body[..], b"hello");

        // and back over the loopback link
        accepted.send(Message::from_body("hi there")).await.unwrap();
    });

    let session = tunnel.dial("chat", DialOptions::new()).await.unwrap();
    session.send(Message::from_body("hello")).await.unwrap();

    let reply = session.recv().await.unwrap();
    assert_eq!(&reply.body[..], b"hi there");

    tokio::time::timeout(Duration::from_secs(2), accept_task)
        .await
        .expect("accept timed out")
        .unwrap();

    tunnel.close().await.unwrap();
}

/// Two nodes, unicast: payloads flow, a remote close surfaces as EOF
/// and dead links are reaped
#[tokio::test]
async fn test_two_node_unicast() {
    let transport = MemoryTransport::new();

    let a = Tunnel::new(options(&transport, "node-a", vec![]));
    a.connect().await.unwrap();
    let listener = a.listen("svc", ListenOptions::new()).await.unwrap();

    let b = Tunnel::new(options(&transport, "node-b", vec!["node-a".to_string()]));
    b.connect().await.unwrap();

    let accept_task = tokio::spawn(async move {
        let accepted = listener.accept().await.unwrap();
        let msg = accepted.recv().await.unwrap();
        assert_eq!(&msg.body[..], b"x");

        // remote close reaches the dialer as EOF on its next recv
        accepted.close().await.unwrap();
    });

    let session = b.dial("svc", DialOptions::new()).await.unwrap();
    session.send(Message::from_body("x")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), accept_task)
        .await
        .expect("accept timed out")
        .unwrap();

    assert!(matches!(session.recv().await, Err(Error::Closed)));

    // sends on the closed session fail
    assert!(session.send(Message::from_body("x")).await.is_err());

    // the whole remote node goes away; B's link is reaped
    a.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(b.links().is_empty());

    b.close().await.unwrap();
}

/// Multicast reaches every listener of the channel, exactly once each
#[tokio::test]
async fn test_multicast_announce() {
    let transport = MemoryTransport::new();

    let a = Tunnel::new(options(&transport, "node-a", vec![]));
    a.connect().await.unwrap();
    let listener_a = a.listen("news", ListenOptions::new()).await.unwrap();

    let c = Tunnel::new(options(&transport, "node-c", vec![]));
    c.connect().await.unwrap();
    let listener_c = c.listen("news", ListenOptions::new()).await.unwrap();

    let b = Tunnel::new(options(
        &transport,
        "node-b",
        vec!["node-a".to_string(), "node-c".to_string()],
    ));
    b.connect().await.unwrap();

    // let the connect-time announces land
    tokio::time::sleep(Duration::from_millis(300)).await;

    let session = b
        .dial("news", DialOptions::new().with_mode(Mode::Multicast))
        .await
        .unwrap();
    session.send(Message::from_body("hi")).await.unwrap();

    // exactly one delivery per listening node
    for listener in [&listener_a, &listener_c] {
        let accepted = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("accept timed out")
            .unwrap();
        let msg = accepted.recv().await.unwrap();
        assert_eq!(&msg.body[..], b"hi");
    }

    for tunnel in [a, b, c] {
        tunnel.close().await.unwrap();
    }
}

/// Dialing a channel nobody hosts fails with a discover error
#[tokio::test]
async fn test_discover_timeout() {
    let transport = MemoryTransport::new();

    let a = Tunnel::new(options(&transport, "node-a", vec![]));
    a.connect().await.unwrap();

    let b = Tunnel::new(options(&transport, "node-b", vec!["node-a".to_string()]));
    b.connect().await.unwrap();

    let result = b
        .dial(
            "missing",
            DialOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .await;
    assert!(matches!(result, Err(Error::DiscoverChannel)));

    // the session was removed, an identical dial behaves the same
    let result = b
        .dial(
            "missing",
            DialOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .await;
    assert!(matches!(result, Err(Error::DiscoverChannel)));

    a.close().await.unwrap();
    b.close().await.unwrap();
}

/// Pinning a nonexistent link id fails fast and leaves no session
#[tokio::test]
async fn test_dial_missing_link() {
    let transport = MemoryTransport::new();

    let a = Tunnel::new(options(&transport, "node-a", vec![]));
    a.connect().await.unwrap();
    let listener = a.listen("svc", ListenOptions::new()).await.unwrap();

    let b = Tunnel::new(options(&transport, "node-b", vec!["node-a".to_string()]));
    b.connect().await.unwrap();

    let result = b.dial("svc", DialOptions::new().with_link("bogus")).await;
    assert!(matches!(result, Err(Error::LinkNotFound)));

    // the failed dial left nothing behind; a fresh dial succeeds
    let accept_task = tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let session = b.dial("svc", DialOptions::new()).await.unwrap();
    session.close().await.unwrap();
    accept_task.await.unwrap();

    a.close().await.unwrap();
    b.close().await.unwrap();
}

/// Application headers and body survive the tunnel unchanged, with the
/// tunnel's own headers stripped
#[tokio::test]
async fn test_header_round_trip() {
    let transport = MemoryTransport::new();

    let a = Tunnel::new(options(&transport, "node-a", vec![]));
    a.connect().await.unwrap();
    let listener = a.listen("svc", ListenOptions::new()).await.unwrap();

    let b = Tunnel::new(options(&transport, "node-b", vec!["node-a".to_string()]));
    b.connect().await.unwrap();

    let accept_task = tokio::spawn(async move {
        let accepted = listener.accept().await.unwrap();
        accepted.recv().await.unwrap()
    });

    let session = b.dial("svc", DialOptions::new()).await.unwrap();

    let original = Message::from_body("payload")
        .with_header("Content-Type", "text/plain")
        .with_header("X-Seq", "7");
    session.send(original.clone()).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(2), accept_task)
        .await
        .expect("recv timed out")
        .unwrap();

    assert_eq!(got, original);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

/// Close is idempotent on sessions, listeners and tunnels
#[tokio::test]
async fn test_idempotent_close() {
    let transport = MemoryTransport::new();

    let tunnel = Tunnel::new(options(&transport, "node-a", vec!["node-a".to_string()]));
    tunnel.connect().await.unwrap();

    let listener = tunnel.listen("chat", ListenOptions::new()).await.unwrap();

    // multicast sessions open without waiting for an accept
    let session = tunnel
        .dial("chat", DialOptions::new().with_mode(Mode::Multicast))
        .await
        .unwrap();

    session.close().await.unwrap();
    session.close().await.unwrap();

    listener.close().await.unwrap();
    listener.close().await.unwrap();

    tunnel.close().await.unwrap();
    tunnel.close().await.unwrap();
}

/// Listening twice on the same channel is rejected
#[tokio::test]
async fn test_already_listening() {
    let transport = MemoryTransport::new();

    let tunnel = Tunnel::new(options(&transport, "node-a", vec![]));
    tunnel.connect().await.unwrap();

    let _listener = tunnel.listen("chat", ListenOptions::new()).await.unwrap();

    assert!(matches!(
        tunnel.listen("chat", ListenOptions::new()).await,
        Err(Error::AlreadyListening(_))
    ));

    tunnel.close().await.unwrap();
}

/// Connect is idempotent and the address reflects the bound listener
#[tokio::test]
async fn test_connect_address() {
    let transport = MemoryTransport::new();

    let tunnel = Tunnel::new(options(&transport, "node-a", vec![]));
    assert_eq!(tunnel.address(), "node-a");

    tunnel.connect().await.unwrap();
    tunnel.connect().await.unwrap();
    assert_eq!(tunnel.address(), "node-a");
    assert_eq!(tunnel.to_string(), "weft");

    tunnel.close().await.unwrap();
}

/// A peer that reconnects gets a fresh link within the reconnect window
#[tokio::test]
async fn test_link_reconnect() {
    let transport = MemoryTransport::new();

    let a = Tunnel::new(options(&transport, "node-a", vec![]));
    a.connect().await.unwrap();

    let b = Tunnel::new(options(&transport, "node-b", vec!["node-a".to_string()]));
    b.connect().await.unwrap();
    assert_eq!(b.links().len(), 1);

    // node-a goes away and comes back
    a.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(b.links().is_empty());

    let a = Tunnel::new(options(&transport, "node-a", vec![]));
    a.connect().await.unwrap();

    // the monitor redials within its tick
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(b.links().len(), 1);

    a.close().await.unwrap();
    b.close().await.unwrap();
}
