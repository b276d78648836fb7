//! End-to-end integration tests: HTTP matchmaking, WebSocket joins and
//! room relaying through a running gateway.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gate_protocol::{CloseCode, Protocol, decode_error_frame};
use gate_rooms::LocalMatchmaker;
use gate_transport::{
    BoundAddress, ListenEndpoint, TransportConfig, TransportError, TransportEvent, TransportServer,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Start a gateway on an OS-assigned port with `battle` (2 seats) rooms.
async fn start_test_server(
    config: TransportConfig,
) -> (TransportServer<LocalMatchmaker>, Arc<LocalMatchmaker>, u16) {
    let matchmaker = Arc::new(LocalMatchmaker::default());
    matchmaker.define("battle", 2);

    let mut server = TransportServer::with_matchmaker(config, matchmaker.clone());
    server
        .listen(ListenEndpoint::parse("0", Some("127.0.0.1")), None)
        .await
        .unwrap();
    let port = server.port().unwrap();
    (server, matchmaker, port)
}

/// Reserve a seat over HTTP.
async fn reserve(port: u16, method: &str, room: &str) -> Value {
    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/matchmake/{method}/{room}"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    response.json().await.unwrap()
}

async fn connect(port: u16, reservation: &Value) -> Socket {
    let url = format!(
        "ws://127.0.0.1:{port}/{}?sessionId={}",
        reservation["room"]["roomId"].as_str().unwrap(),
        reservation["sessionId"].as_str().unwrap(),
    );
    let (ws, _) = connect_async(&url).await.expect("Failed to connect");
    ws
}

/// Next binary frame, skipping pings.
async fn next_binary(ws: &mut Socket) -> Vec<u8> {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("Timeout waiting for frame")
            .expect("Stream ended")
            .expect("WebSocket error");
        match msg {
            Message::Binary(data) => return data.to_vec(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected message: {other:?}"),
        }
    }
}

async fn health(port: u16) -> Value {
    reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Matchmaking + join
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reserve_join_and_relay() {
    let (_server, _mm, port) = start_test_server(TransportConfig::default()).await;

    let first = reserve(port, "joinOrCreate", "battle").await;
    let second = reserve(port, "joinOrCreate", "battle").await;
    let room_id = first["room"]["roomId"].as_str().unwrap().to_string();
    assert_eq!(second["room"]["roomId"], room_id.as_str());

    let mut a = connect(port, &first).await;
    let mut b = connect(port, &second).await;

    for ws in [&mut a, &mut b] {
        let frame = next_binary(ws).await;
        assert_eq!(frame[0], Protocol::JoinRoom as u8);
        assert_eq!(&frame[1..], room_id.as_bytes());
    }

    a.send(Message::binary(b"ping from a".to_vec())).await.unwrap();
    assert_eq!(next_binary(&mut b).await, b"ping from a");

    b.send(Message::binary(b"hello a".to_vec())).await.unwrap();
    assert_eq!(next_binary(&mut a).await, b"hello a");

    assert_eq!(health(port).await["clients"], 2);
}

#[tokio::test]
async fn expired_seat_gets_error_frame_then_close() {
    let (server, _mm, port) = start_test_server(TransportConfig::default()).await;

    let url = format!("ws://127.0.0.1:{port}/doesnotexist?sessionId=nobody");
    let (mut ws, _) = connect_async(&url).await.expect("Failed to connect");

    let frame = next_binary(&mut ws).await;
    assert_eq!(
        decode_error_frame(&frame),
        Some((4214, "seat reservation expired.".to_string()))
    );

    // The server drops the socket without a close handshake.
    let end = timeout(Duration::from_secs(5), ws.next()).await.expect("Timeout waiting for close");
    assert!(!matches!(end, Some(Ok(Message::Binary(_)))));

    for _ in 0..50 {
        if server.gateway().registry().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(server.gateway().registry().is_empty());
}

#[tokio::test]
async fn listing_and_cors_over_http() {
    let (_server, _mm, port) = start_test_server(TransportConfig::default()).await;
    reserve(port, "create", "battle").await;

    let client = reqwest::Client::new();
    let rooms: Value = client
        .get(format!("http://127.0.0.1:{port}/matchmake/battle"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rooms.as_array().unwrap().len(), 1);
    assert_eq!(rooms[0]["name"], "battle");

    let preflight_url = format!("http://127.0.0.1:{port}/matchmake/joinOrCreate/battle");
    let preflight = client
        .request(reqwest::Method::OPTIONS, preflight_url)
        .header("Origin", "https://play.example")
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), 204);
    assert_eq!(preflight.headers()["access-control-allow-origin"], "https://play.example");
    assert_eq!(preflight.headers()["access-control-allow-methods"], "OPTIONS, POST, GET");

    let error = client
        .post(format!("http://127.0.0.1:{port}/matchmake/join/unknown"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(error.status(), 406);
    let body: Value = error.json().await.unwrap();
    assert_eq!(body["code"], 4210);
}

#[tokio::test]
async fn small_backpressure_ceiling_still_joins() {
    let config = TransportConfig {
        max_backpressure: 64 * 1024,
        ..TransportConfig::default()
    };
    let (_server, _mm, port) = start_test_server(config).await;

    let first = reserve(port, "joinOrCreate", "battle").await;
    let second = reserve(port, "joinOrCreate", "battle").await;
    let mut a = connect(port, &first).await;
    let mut b = connect(port, &second).await;
    assert_eq!(next_binary(&mut a).await[0], Protocol::JoinRoom as u8);
    assert_eq!(next_binary(&mut b).await[0], Protocol::JoinRoom as u8);

    let payload = vec![7u8; 16 * 1024];
    a.send(Message::binary(payload.clone())).await.unwrap();
    assert_eq!(next_binary(&mut b).await, payload);
}

#[tokio::test]
async fn zero_backpressure_ceiling_is_rejected_at_listen() {
    let config = TransportConfig {
        max_backpressure: 0,
        ..TransportConfig::default()
    };
    let mut server = TransportServer::new(config, LocalMatchmaker::default());
    let err = server
        .listen(ListenEndpoint::parse("0", Some("127.0.0.1")), None)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::InvalidConfig(_)));
    assert!(server.local_addr().is_none());
}

#[tokio::test]
async fn graceful_shutdown_rejects_matchmaking() {
    let (_server, mm, port) = start_test_server(TransportConfig::default()).await;
    mm.begin_graceful_shutdown();

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/matchmake/joinOrCreate/battle"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(mm.room_count(), 0);
}

#[tokio::test]
async fn offered_subprotocol_is_echoed() {
    let (_server, _mm, port) = start_test_server(TransportConfig::default()).await;
    let reservation = reserve(port, "joinOrCreate", "battle").await;

    let url = format!(
        "ws://127.0.0.1:{port}/{}?sessionId={}",
        reservation["room"]["roomId"].as_str().unwrap(),
        reservation["sessionId"].as_str().unwrap(),
    );
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "roomgate.v1".parse().unwrap());

    let (_ws, response) = connect_async(request).await.expect("Failed to connect");
    assert_eq!(response.headers()["sec-websocket-protocol"], "roomgate.v1");
}

#[tokio::test]
async fn heartbeat_pings_joined_clients() {
    let config = TransportConfig {
        ping_interval: Some(Duration::from_millis(50)),
        ..TransportConfig::default()
    };
    let (_server, _mm, port) = start_test_server(config).await;
    let reservation = reserve(port, "joinOrCreate", "battle").await;
    let mut ws = connect(port, &reservation).await;
    next_binary(&mut ws).await;

    let ping = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(Ok(Message::Ping(_))) = ws.next().await {
                return true;
            }
        }
    })
    .await;
    assert_eq!(ping, Ok(true));

    // Reading answers the pings, so the connection outlives several intervals.
    let _ = timeout(Duration::from_millis(300), async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
    assert_eq!(health(port).await["clients"], 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn listen_twice_is_rejected() {
    let (mut server, _mm, _port) = start_test_server(TransportConfig::default()).await;
    let err = server
        .listen(ListenEndpoint::parse("0", Some("127.0.0.1")), None)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::AlreadyListening(_)));
}

#[tokio::test]
async fn tcp_shutdown_emits_closed() {
    let (mut server, _mm, _port) = start_test_server(TransportConfig::default()).await;
    let mut events = server.subscribe();

    server.shutdown().await;
    assert_eq!(events.recv().await.unwrap(), TransportEvent::Closed);
    assert!(server.local_addr().is_none());
}

#[tokio::test]
async fn shutdown_closes_joined_sockets() {
    let (mut server, _mm, port) = start_test_server(TransportConfig::default()).await;
    let reservation = reserve(port, "joinOrCreate", "battle").await;
    let mut ws = connect(port, &reservation).await;
    next_binary(&mut ws).await;

    let stopping = tokio::spawn(async move {
        server.shutdown().await;
        server
    });

    let close = loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("Timeout waiting for close")
            .expect("Stream ended")
            .expect("WebSocket error");
        if let Message::Close(frame) = msg {
            break frame.expect("close frame without code");
        }
    };
    assert_eq!(u16::from(close.code), CloseCode::SERVER_SHUTDOWN);
    assert_eq!(close.reason.as_str(), "server shutting down");

    // Reading on flushes the close reply.
    let _ = timeout(Duration::from_secs(1), ws.next()).await;

    let server = timeout(Duration::from_secs(5), stopping)
        .await
        .expect("Timeout waiting for shutdown")
        .unwrap();
    for _ in 0..50 {
        if server.gateway().registry().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(server.gateway().registry().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_listen_and_shutdown() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gate.sock");

    let mut server = TransportServer::new(TransportConfig::default(), LocalMatchmaker::default());
    let mut events = server.subscribe();
    let endpoint = ListenEndpoint::parse(path.to_str().unwrap(), None);
    assert_eq!(endpoint, ListenEndpoint::Unix(path.clone()));

    let bound = server.listen(endpoint, Some(64)).await.unwrap();
    assert_eq!(bound, BoundAddress::Unix(path.clone()));
    assert_eq!(events.recv().await.unwrap(), TransportEvent::Listening(bound));
    assert!(server.port().is_none());

    let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    assert!(raw.starts_with("HTTP/1.1 200"), "unexpected response: {raw}");
    assert!(raw.contains(r#""status":"ok""#));

    server.shutdown().await;
    assert_eq!(events.recv().await.unwrap(), TransportEvent::Closed);
    assert!(!path.exists());
}
