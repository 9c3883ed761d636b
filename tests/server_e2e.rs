//! TCP end-to-end: real clients against the packet protocol and server.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mosaic::frame::{Resolution, ScreenFrame};
use mosaic::protocol::{
    CommandMsg, DeregisterMsg, HeartbeatMsg, Packet, PacketType, RegisterMsg, ScreenFrameMsg,
};
use mosaic::registry::SessionRegistry;
use mosaic::server;
use mosaic::stitch::NoopStitcher;
use mosaic::viewport::{LatestImages, ViewportController};

struct TestServer {
    addr: std::net::SocketAddr,
    registry: SessionRegistry,
    cancel: CancellationToken,
}

async fn start_server(liveness: Duration) -> TestServer {
    let registry = SessionRegistry::builder().liveness_timeout(liveness).build();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let controller = ViewportController::new(
        Arc::new(NoopStitcher),
        Arc::new(LatestImages::new()),
        command_tx,
    );
    let cancel = CancellationToken::new();
    controller.attach(&registry, cancel.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    {
        let registry = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = server::serve(listener, registry, command_rx, cancel).await;
        });
    }
    TestServer {
        addr,
        registry,
        cancel,
    }
}

async fn register_client(addr: std::net::SocketAddr, id: &str, name: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    Packet::control(
        PacketType::Register,
        &RegisterMsg {
            id: id.into(),
            name: name.into(),
        },
    )
    .unwrap()
    .write_to(&mut stream)
    .await
    .unwrap();
    stream
}

async fn wait_registered(registry: &SessionRegistry, id: &str) {
    let id = id.to_string();
    let registry = registry.clone();
    tokio::time::timeout(Duration::from_secs(2), async move {
        loop {
            if registry.get(&id).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client should appear in the registry");
}

async fn wait_deregistered(registry: &SessionRegistry, id: &str) {
    let id = id.to_string();
    let registry = registry.clone();
    tokio::time::timeout(Duration::from_secs(2), async move {
        loop {
            if registry.get(&id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client should disappear from the registry");
}

#[tokio::test]
async fn register_receives_send_command() {
    let server = start_server(Duration::from_secs(5)).await;

    let mut stream = register_client(server.addr, "c1", "Amy").await;
    wait_registered(&server.registry, "c1").await;

    // Entering the (previously empty) window triggers a Send command.
    let packet = tokio::time::timeout(Duration::from_secs(2), Packet::read_from(&mut stream))
        .await
        .expect("server should issue a command")
        .unwrap();
    assert_eq!(packet.packet_type, PacketType::Send);
    let msg: CommandMsg = packet.parse_json().unwrap();
    assert_eq!(msg.resolution, Resolution::new(100, 100));

    server.cancel.cancel();
}

#[tokio::test]
async fn frames_and_heartbeats_reach_the_session() {
    let server = start_server(Duration::from_secs(5)).await;

    let mut stream = register_client(server.addr, "c1", "Amy").await;
    wait_registered(&server.registry, "c1").await;

    Packet::control(
        PacketType::ScreenFrame,
        &ScreenFrameMsg {
            id: "c1".into(),
            frame: ScreenFrame::unchanged(Resolution::new(100, 100)),
        },
    )
    .unwrap()
    .write_to(&mut stream)
    .await
    .unwrap();

    Packet::control(PacketType::Heartbeat, &HeartbeatMsg { id: "c1".into() })
        .unwrap()
        .write_to(&mut stream)
        .await
        .unwrap();

    let session = server.registry.get("c1").unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if session.frame_backlog() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("frame should be buffered on the session");

    server.cancel.cancel();
}

#[tokio::test]
async fn explicit_deregister_removes_client() {
    let server = start_server(Duration::from_secs(5)).await;

    let mut stream = register_client(server.addr, "c1", "Amy").await;
    wait_registered(&server.registry, "c1").await;

    Packet::control(PacketType::Deregister, &DeregisterMsg { id: "c1".into() })
        .unwrap()
        .write_to(&mut stream)
        .await
        .unwrap();

    wait_deregistered(&server.registry, "c1").await;
    server.cancel.cancel();
}

#[tokio::test]
async fn dropped_connection_deregisters_client() {
    let server = start_server(Duration::from_secs(5)).await;

    let stream = register_client(server.addr, "c1", "Amy").await;
    wait_registered(&server.registry, "c1").await;

    drop(stream);

    wait_deregistered(&server.registry, "c1").await;
    server.cancel.cancel();
}

#[tokio::test]
async fn silent_client_is_timed_out_over_tcp() {
    let server = start_server(Duration::from_millis(100)).await;

    let _stream = register_client(server.addr, "c1", "Amy").await;
    wait_registered(&server.registry, "c1").await;

    // No heartbeats: the liveness countdown must remove the client even
    // though the connection stays open.
    wait_deregistered(&server.registry, "c1").await;
    server.cancel.cancel();
}

#[tokio::test]
async fn duplicate_id_is_rejected_without_touching_original() {
    let server = start_server(Duration::from_secs(5)).await;

    let _first = register_client(server.addr, "c1", "Amy").await;
    wait_registered(&server.registry, "c1").await;

    let _second = register_client(server.addr, "c1", "Impostor").await;
    // Give the server a moment to process and refuse the duplicate.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let session = server.registry.get("c1").expect("original stays registered");
    assert_eq!(session.name, "Amy");
    assert_eq!(server.registry.len(), 1);

    server.cancel.cancel();
}

#[tokio::test]
async fn two_clients_share_the_first_page() {
    let server = start_server(Duration::from_secs(5)).await;

    let mut zed = register_client(server.addr, "A", "Zed").await;
    wait_registered(&server.registry, "A").await;
    let mut amy = register_client(server.addr, "B", "Amy").await;
    wait_registered(&server.registry, "B").await;

    // Both end up active; each connection sees a Send command.
    for stream in [&mut zed, &mut amy] {
        let packet = tokio::time::timeout(Duration::from_secs(2), Packet::read_from(stream))
            .await
            .expect("each client should receive a command")
            .unwrap();
        assert_eq!(packet.packet_type, PacketType::Send);
    }

    server.cancel.cancel();
}
