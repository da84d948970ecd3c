use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use localbeam_discovery::{MemoryDiscovery, ServiceAdvertiser, ServiceRecord};
use localbeam_proto::{DiscoverResponse, SignalKind, SignalMessage};
use localbeam_server::{Config, LocalBeamServer, ServerHandle};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP: Duration = Duration::from_secs(5);

async fn start_server(discovery: MemoryDiscovery) -> ServerHandle {
    let mut config = Config::local_ephemeral();
    config.discovery_timeout = Duration::from_millis(300);
    LocalBeamServer::new(config)
        .with_discovery(discovery)
        .start()
        .await
        .expect("server starts")
}

async fn connect(server: &ServerHandle) -> Socket {
    let (socket, _) = timeout(STEP, connect_async(server.url()))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    socket
}

async fn send(socket: &mut Socket, message: &SignalMessage) {
    let text = message.to_json().expect("encode");
    socket.send(Message::Text(text.into())).await.expect("send");
}

async fn recv(socket: &mut Socket) -> SignalMessage {
    loop {
        let frame = timeout(STEP, socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket ended")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return SignalMessage::parse(&text).expect("relay sent valid json");
        }
    }
}

/// Reads frames until a peer list equal to `expected` shows up.
async fn expect_peers(socket: &mut Socket, expected: &[&str]) {
    loop {
        let message = recv(socket).await;
        if message.kind != SignalKind::PeerList {
            continue;
        }
        let peers = message.peers.unwrap_or_default();
        if peers == expected {
            return;
        }
    }
}

async fn assert_silent(socket: &mut Socket, window: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(window, socket.next()).await {
        panic!("unexpected frame: {}", text.as_str());
    }
}

#[tokio::test]
async fn peer_list_tracks_registrations_and_disconnects() {
    let mut server = start_server(MemoryDiscovery::new()).await;

    let mut a = connect(&server).await;
    send(&mut a, &SignalMessage::register("A")).await;
    expect_peers(&mut a, &["A"]).await;

    let mut b = connect(&server).await;
    send(&mut b, &SignalMessage::register("B")).await;
    expect_peers(&mut a, &["A", "B"]).await;
    expect_peers(&mut b, &["A", "B"]).await;

    b.close(None).await.expect("close b");
    drop(b);
    expect_peers(&mut a, &["A"]).await;

    server.stop().await;
}

#[tokio::test]
async fn negotiation_frames_reach_only_the_target_without_target_id() {
    let mut server = start_server(MemoryDiscovery::new()).await;

    let mut a = connect(&server).await;
    let mut b = connect(&server).await;
    let mut c = connect(&server).await;
    send(&mut a, &SignalMessage::register("A")).await;
    send(&mut b, &SignalMessage::register("B")).await;
    send(&mut c, &SignalMessage::register("C")).await;
    for socket in [&mut a, &mut b, &mut c] {
        expect_peers(socket, &["A", "B", "C"]).await;
    }

    let sdp = json!({ "type": "offer", "sdp": "v=0" });
    send(&mut a, &SignalMessage::offer("A", "B", sdp.clone())).await;

    let forwarded = recv(&mut b).await;
    assert_eq!(forwarded.kind, SignalKind::Offer);
    assert_eq!(forwarded.client_id.as_deref(), Some("A"));
    assert_eq!(forwarded.target_id, None);
    assert_eq!(forwarded.payload, Some(sdp));

    assert_silent(&mut c, Duration::from_millis(200)).await;
    assert_silent(&mut a, Duration::from_millis(50)).await;

    server.stop().await;
}

#[tokio::test]
async fn offer_to_absent_target_is_dropped_silently() {
    let mut server = start_server(MemoryDiscovery::new()).await;

    let mut a = connect(&server).await;
    send(&mut a, &SignalMessage::register("A")).await;
    expect_peers(&mut a, &["A"]).await;

    send(&mut a, &SignalMessage::offer("A", "ghost", json!({ "sdp": "x" }))).await;
    assert_silent(&mut a, Duration::from_millis(200)).await;
    assert_eq!(server.relay().registry().client_ids(), vec!["A".to_string()]);

    server.stop().await;
}

#[tokio::test]
async fn malformed_frames_do_not_break_the_connection() {
    let mut server = start_server(MemoryDiscovery::new()).await;

    let mut a = connect(&server).await;
    a.send(Message::Text("{not json".into())).await.expect("send");
    a.send(Message::Text(r#"{"type":"dance","clientId":"A"}"#.into()))
        .await
        .expect("send");
    a.send(Message::Text(r#"{"type":"offer","clientId":"A"}"#.into()))
        .await
        .expect("send");

    send(&mut a, &SignalMessage::register("A")).await;
    expect_peers(&mut a, &["A"]).await;

    server.stop().await;
}

#[tokio::test]
async fn answer_and_candidates_keep_sender_order() {
    let mut server = start_server(MemoryDiscovery::new()).await;

    let mut a = connect(&server).await;
    let mut b = connect(&server).await;
    send(&mut a, &SignalMessage::register("A")).await;
    send(&mut b, &SignalMessage::register("B")).await;
    expect_peers(&mut a, &["A", "B"]).await;
    expect_peers(&mut b, &["A", "B"]).await;

    send(&mut b, &SignalMessage::answer("B", "A", json!({ "sdp": "answer" }))).await;
    for n in 0..3 {
        send(&mut b, &SignalMessage::candidate("B", "A", json!({ "n": n }))).await;
    }

    let answer = recv(&mut a).await;
    assert_eq!(answer.kind, SignalKind::Answer);
    for n in 0..3 {
        let candidate = recv(&mut a).await;
        assert_eq!(candidate.kind, SignalKind::Candidate);
        assert_eq!(candidate.payload, Some(json!({ "n": n })));
    }

    server.stop().await;
}

#[tokio::test]
async fn stop_closes_connected_clients() {
    let mut server = start_server(MemoryDiscovery::new()).await;
    let mut a = connect(&server).await;
    send(&mut a, &SignalMessage::register("A")).await;
    expect_peers(&mut a, &["A"]).await;

    server.stop().await;
    assert!(!server.is_running());
    assert!(server.relay().registry().is_empty());

    let ended = timeout(STEP, async {
        loop {
            match a.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "client socket should be closed by the relay");

    // Second stop is a no-op.
    server.stop().await;
}

#[tokio::test]
async fn discover_reports_advertised_service() {
    let discovery = MemoryDiscovery::new();
    let _advertisement = discovery
        .publish(ServiceRecord::new("LocalBeam Signaling Server", 6123).with_host("192.168.1.20"))
        .await
        .expect("publish");
    let mut server = start_server(discovery).await;

    let url = format!("http://{}/discover", server.local_addr());
    let response: DiscoverResponse = reqwest::get(&url)
        .await
        .expect("request")
        .json()
        .await
        .expect("json body");
    assert_eq!(response.url, "ws://192.168.1.20:6123");

    server.stop().await;
}

#[tokio::test]
async fn discover_falls_back_to_localhost() {
    let mut server = start_server(MemoryDiscovery::new()).await;

    let url = format!("http://{}/discover", server.local_addr());
    let response: DiscoverResponse = reqwest::get(&url)
        .await
        .expect("request")
        .json()
        .await
        .expect("json body");
    assert_eq!(
        response.url,
        format!("ws://localhost:{}", server.local_addr().port())
    );

    let health: serde_json::Value = reqwest::get(format!("http://{}/health", server.local_addr()))
        .await
        .expect("request")
        .json()
        .await
        .expect("json body");
    assert_eq!(health, json!({ "status": "ok" }));

    server.stop().await;
}
