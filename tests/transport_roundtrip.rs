//! Upload, info and message channel over real loopback sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use zerocloud_lib::error::{ResolveError, SendError, TransportError};
use zerocloud_lib::protocol::InfoResponse;
use zerocloud_lib::resolver::Resolver;
use zerocloud_lib::sender::MessageSender;
use zerocloud_lib::transport::TransportServer;
use zerocloud_lib::{ChatMessage, Event, EventReceiver, EventSink, NodeConfig, PeerTable};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct Harness {
    server: TransportServer,
    events: EventReceiver,
    addr: SocketAddr,
    downloads: tempfile::TempDir,
}

async fn harness(identity: &str) -> Harness {
    let downloads = tempfile::tempdir().unwrap();
    let config = NodeConfig {
        identity: identity.to_string(),
        bind_address: LOCALHOST,
        port: 0,
        download_dir: downloads.path().join("incoming"),
        ..NodeConfig::default()
    };
    let (sink, mut events) = EventSink::channel();
    let server = TransportServer::new(&config, sink, CancellationToken::new());
    let addr = server.start(LOCALHOST, 0).await.unwrap();

    match next_event(&mut events).await {
        Event::MyInfo { identity: id, port, .. } => {
            assert_eq!(id, identity);
            assert_eq!(port, addr.port());
        }
        other => panic!("expected MyInfo, got {other:?}"),
    }

    Harness {
        server,
        events,
        addr,
        downloads,
    }
}

async fn next_event(rx: &mut EventReceiver) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn assert_quiet(rx: &mut EventReceiver) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "unexpected extra event");
}

fn sender() -> MessageSender {
    MessageSender::new(Duration::from_secs(2)).unwrap()
}

fn free_port() -> u16 {
    std::net::TcpListener::bind((LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn upload_saves_file_and_reports_sender() {
    let mut h = harness("desk").await;
    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("holiday photo.jpg");
    let content: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
    std::fs::write(&src, &content).unwrap();

    sender()
        .upload_file(LOCALHOST, h.addr.port(), &src, "Alice")
        .await
        .unwrap();

    match next_event(&mut h.events).await {
        Event::FileReceived {
            filename,
            sender,
            path,
        } => {
            assert_eq!(filename, "holiday photo.jpg");
            assert_eq!(sender, "Alice");
            assert!(path.starts_with(h.downloads.path()));
            assert_eq!(std::fs::read(path).unwrap(), content);
        }
        other => panic!("expected FileReceived, got {other:?}"),
    }
    assert_quiet(&mut h.events).await;
}

#[tokio::test]
async fn upload_without_sender_is_unknown_and_same_name_overwrites() {
    let mut h = harness("desk").await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/upload", h.addr);

    for body in [&b"first"[..], &b"second"[..]] {
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(body.to_vec()).file_name("notes.txt"),
        );
        let resp = client.post(&url).multipart(form).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        match next_event(&mut h.events).await {
            Event::FileReceived { sender, .. } => assert_eq!(sender, "Unknown"),
            other => panic!("expected FileReceived, got {other:?}"),
        }
    }

    let saved = h.downloads.path().join("incoming").join("notes.txt");
    assert_eq!(std::fs::read(saved).unwrap(), b"second");
}

#[tokio::test]
async fn upload_without_file_is_rejected() {
    let mut h = harness("desk").await;
    let form = reqwest::multipart::Form::new().text("sender", "Alice");
    let resp = reqwest::Client::new()
        .post(format!("http://{}/upload", h.addr))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_quiet(&mut h.events).await;
}

#[tokio::test]
async fn info_reports_identity_and_service() {
    let h = harness("desk").await;
    let info: InfoResponse = reqwest::get(format!("http://{}/info", h.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info.hostname, "desk");
    assert_eq!(info.service, "ZeroCloud");
    assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn message_arrives_unchanged() {
    let mut h = harness("desk").await;
    let message = ChatMessage {
        from: "laptop".into(),
        message: "U2FsdGVkX1+opaque/ciphertext==".into(),
    };

    sender()
        .send_message(LOCALHOST, h.addr.port(), &message)
        .await
        .unwrap();

    match next_event(&mut h.events).await {
        Event::MessageReceived { from, payload } => {
            assert_eq!(from.ip(), LOCALHOST);
            assert_eq!(payload, message);
        }
        other => panic!("expected MessageReceived, got {other:?}"),
    }
    assert_quiet(&mut h.events).await;
}

#[tokio::test]
async fn unreachable_peer_is_a_delivery_failure() {
    let mut h = harness("desk").await;
    let message = ChatMessage {
        from: "laptop".into(),
        message: "hello?".into(),
    };

    let err = sender()
        .send_message(LOCALHOST, free_port(), &message)
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::Unreachable { .. }), "{err}");
    assert_quiet(&mut h.events).await;
}

#[tokio::test]
async fn rebind_releases_old_port_and_publishes_new_one() {
    let mut h = harness("desk").await;
    let watcher = h.server.subscribe();
    let old = h.addr;

    let new = h.server.start(LOCALHOST, 0).await.unwrap();
    assert_ne!(new.port(), old.port());
    assert_eq!(*watcher.borrow(), Some(new));
    assert_eq!(h.server.local_endpoint(), Some(new));
    match next_event(&mut h.events).await {
        Event::MyInfo { port, .. } => assert_eq!(port, new.port()),
        other => panic!("expected MyInfo, got {other:?}"),
    }

    // The old socket is closed, so its port can be taken again.
    std::net::TcpListener::bind(old).expect("old port still held");
    assert!(reqwest::get(format!("http://{}/info", new)).await.is_ok());
}

#[tokio::test]
async fn start_on_occupied_port_moves_up() {
    let h = harness("desk").await;
    let holder = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    let taken = holder.local_addr().unwrap().port();

    let bound = h.server.start(LOCALHOST, taken).await.unwrap();
    assert!(bound.port() > taken);
    assert_eq!(h.server.local_endpoint(), Some(bound));
}

#[tokio::test]
async fn failed_rebind_keeps_previous_listener() {
    let mut h = harness("desk").await;
    // TEST-NET-1: never assigned to a local interface.
    let unassignable = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 55));

    let err = h.server.start(unassignable, 5000).await.unwrap_err();
    assert!(matches!(err, TransportError::Bind { .. }), "{err}");
    assert_eq!(h.server.local_endpoint(), Some(h.addr));
    assert_quiet(&mut h.events).await;

    let info: InfoResponse = reqwest::get(format!("http://{}/info", h.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info.hostname, "desk");
}

#[tokio::test]
async fn stop_clears_endpoint() {
    let h = harness("desk").await;
    let watcher = h.server.subscribe();

    h.server.stop().await;
    assert_eq!(h.server.local_endpoint(), None);
    assert_eq!(*watcher.borrow(), None);
    std::net::TcpListener::bind(h.addr).expect("port still held after stop");
}

#[tokio::test]
async fn interrupted_upload_keeps_previous_file() {
    let mut h = harness("desk").await;
    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(b"good copy".to_vec()).file_name("notes.txt"),
    );
    reqwest::Client::new()
        .post(format!("http://{}/upload", h.addr))
        .multipart(form)
        .send()
        .await
        .unwrap();
    next_event(&mut h.events).await;

    // Promise more body than is sent, then hang up mid-file.
    let body = concat!(
        "--XBOUNDARY\r\n",
        "Content-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n",
        "Content-Type: application/octet-stream\r\n\r\n",
        "half a new cop",
    );
    let head = format!(
        "POST /upload HTTP/1.1\r\nHost: {}\r\n\
         Content-Type: multipart/form-data; boundary=XBOUNDARY\r\n\
         Content-Length: {}\r\n\r\n",
        h.addr,
        body.len() + 4096
    );
    let mut stream = tokio::net::TcpStream::connect(h.addr).await.unwrap();
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(body.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut reply = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply)).await;

    let dir = h.downloads.path().join("incoming");
    assert_eq!(std::fs::read(dir.join("notes.txt")).unwrap(), b"good copy");
    let names: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names, vec!["notes.txt".to_string()]);
    assert_quiet(&mut h.events).await;
}

#[tokio::test]
async fn resolver_adds_peer_from_info_endpoint() {
    let h = harness("alpha").await;
    let table = PeerTable::new("beta");
    let (sink, mut events) = EventSink::channel();
    let resolver = Resolver::new(
        "zerocloud",
        h.addr.port(),
        Duration::from_secs(2),
        table.clone(),
        sink,
    )
    .unwrap();

    let peer = resolver.resolve(LOCALHOST).await.unwrap();
    assert_eq!(peer.identity, "alpha");
    assert_eq!(peer.socket_addr(), SocketAddr::new(LOCALHOST, h.addr.port()));
    assert_eq!(table.get("alpha").map(|p| p.port), Some(h.addr.port()));
    match next_event(&mut events).await {
        Event::PeersUpdated(list) => assert_eq!(list.len(), 1),
        other => panic!("expected PeersUpdated, got {other:?}"),
    }
}

#[tokio::test]
async fn resolver_reports_self_and_unreachable() {
    let h = harness("alpha").await;
    let (sink, _events) = EventSink::channel();

    let own = Resolver::new(
        "ZeroCloud",
        h.addr.port(),
        Duration::from_secs(2),
        PeerTable::new("alpha"),
        sink.clone(),
    )
    .unwrap();
    assert!(matches!(
        own.resolve(LOCALHOST).await,
        Err(ResolveError::SelfAddress { .. })
    ));

    let table = PeerTable::new("beta");
    let nobody = Resolver::new(
        "ZeroCloud",
        free_port(),
        Duration::from_secs(2),
        table.clone(),
        sink,
    )
    .unwrap();
    assert!(matches!(
        nobody.resolve(LOCALHOST).await,
        Err(ResolveError::Unreachable { .. })
    ));
    assert!(table.is_empty());
}

#[tokio::test]
async fn resolver_rejects_non_zerocloud_answer() {
    let app = axum::Router::new().route("/info", axum::routing::get(|| async { "nope" }));
    let listener = tokio::net::TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move { axum::serve(listener, app).await.ok() });

    let (sink, _events) = EventSink::channel();
    let table = PeerTable::new("beta");
    let resolver = Resolver::new(
        "ZeroCloud",
        port,
        Duration::from_secs(2),
        table.clone(),
        sink,
    )
    .unwrap();
    assert!(matches!(
        resolver.resolve(LOCALHOST).await,
        Err(ResolveError::InvalidResponse { .. })
    ));
    assert!(table.is_empty());
}
