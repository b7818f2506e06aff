//! End-to-end tests using real WebSocket clients.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use plate_server::{ServerConfig, ServerHandle};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    }
}

async fn boot(config: ServerConfig) -> ServerHandle {
    plate_server::start(config).await.unwrap()
}

async fn connect(addr: SocketAddr) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

async fn join(ws: &mut WsStream, code: &str, role: &str) {
    send(ws, json!({"event": "join", "data": {"code": code, "role": role}})).await;
}

/// Next protocol event, skipping control frames.
async fn recv(ws: &mut WsStream) -> Value {
    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Assert nothing but control frames arrive for a short while.
async fn expect_silence(ws: &mut WsStream) {
    let res = timeout(QUIET, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => return other,
            }
        }
    })
    .await;
    assert!(res.is_err(), "expected no event, got {res:?}");
}

async fn health(addr: SocketAddr) -> Value {
    reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

/// Joins have no acknowledgement, so wait for the engine to count them.
async fn wait_for_joins(addr: SocketAddr, n: u64) {
    timeout(TIMEOUT, async {
        while health(addr).await["joins"].as_u64().unwrap_or(0) < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("joins never registered");
}

/// The connection id is only visible to peers, so learn it from one.
fn sender_id(event: &Value) -> String {
    event["data"]["id"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn pairing_scenario() {
    let server = boot(test_config()).await;
    let mut host = connect(server.addr).await;
    let mut client = connect(server.addr).await;

    join(&mut host, "4821", "host").await;
    wait_for_joins(server.addr, 1).await;
    join(&mut client, "4821", "client").await;

    let joined = recv(&mut host).await;
    assert_eq!(joined["event"], "peer-joined");
    assert_eq!(joined["data"]["role"], "client");
    let client_id = sender_id(&joined);

    send(&mut client, json!({"event": "select", "data": {"code": "4821", "key": "7"}})).await;
    assert_eq!(
        recv(&mut host).await,
        json!({"event": "select", "data": {"key": "7", "from": client_id}})
    );

    send(&mut host, json!({"event": "end-session", "data": {"code": "4821"}})).await;
    let ended = json!({"event": "session-ended", "data": {"code": "4821"}});
    assert_eq!(recv(&mut host).await, ended);
    assert_eq!(recv(&mut client).await, ended);
    // The client never sees its own select echoed.
    expect_silence(&mut client).await;

    client.close(None).await.unwrap();
    assert_eq!(
        recv(&mut host).await,
        json!({"event": "peer-left", "data": {"id": client_id, "role": "client"}})
    );
    expect_silence(&mut host).await;

    server.shutdown().await;
}

#[tokio::test]
async fn role_defaults_to_client() {
    let server = boot(test_config()).await;
    let mut host = connect(server.addr).await;
    let mut phone = connect(server.addr).await;

    join(&mut host, "1357", "host").await;
    wait_for_joins(server.addr, 1).await;
    send(&mut phone, json!({"event": "join", "data": {"code": "1357"}})).await;

    assert_eq!(recv(&mut host).await["data"]["role"], "client");
    server.shutdown().await;
}

#[tokio::test]
async fn junk_and_early_messages_are_ignored() {
    let server = boot(test_config()).await;
    let mut host = connect(server.addr).await;
    let mut client = connect(server.addr).await;

    join(&mut host, "2468", "host").await;
    wait_for_joins(server.addr, 1).await;

    // Before join: dropped, connection survives.
    send(&mut client, json!({"event": "select", "data": {"code": "2468", "key": "1"}})).await;
    send(&mut client, json!({"event": "end-session", "data": {"code": "2468"}})).await;
    client.send(Message::text("not json".to_string())).await.unwrap();
    client.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    send(&mut client, json!({"event": "join", "data": {"role": "client"}})).await;
    send(&mut client, json!({"event": "teleport", "data": {}})).await;
    expect_silence(&mut host).await;

    join(&mut client, "2468", "client").await;
    assert_eq!(recv(&mut host).await["event"], "peer-joined");

    send(&mut client, json!({"event": "select", "data": {"code": "2468", "key": 3}})).await;
    assert_eq!(recv(&mut host).await["data"]["key"], 3);

    server.shutdown().await;
}

#[tokio::test]
async fn lone_member_select_goes_nowhere() {
    let server = boot(test_config()).await;
    let mut solo = connect(server.addr).await;

    join(&mut solo, "9999", "client").await;
    send(&mut solo, json!({"event": "select", "data": {"code": "9999", "key": "2"}})).await;
    expect_silence(&mut solo).await;

    wait_for_joins(server.addr, 1).await;
    assert_eq!(health(server.addr).await["relayed"], 0);
    server.shutdown().await;
}

#[tokio::test]
async fn disconnect_before_join_is_silent() {
    let server = boot(test_config()).await;
    let mut host = connect(server.addr).await;
    let mut lurker = connect(server.addr).await;

    join(&mut host, "1122", "host").await;
    wait_for_joins(server.addr, 1).await;
    lurker.close(None).await.unwrap();

    expect_silence(&mut host).await;
    server.shutdown().await;
}

#[tokio::test]
async fn short_codes_are_still_rooms() {
    let server = boot(test_config()).await;
    let mut a = connect(server.addr).await;
    let mut b = connect(server.addr).await;

    join(&mut a, "07", "host").await;
    wait_for_joins(server.addr, 1).await;
    join(&mut b, "07", "client").await;
    assert_eq!(recv(&mut a).await["event"], "peer-joined");

    send(&mut b, json!({"event": "select", "data": {"code": "07", "key": "0"}})).await;
    assert_eq!(recv(&mut a).await["data"]["key"], "0");
    server.shutdown().await;
}

#[tokio::test]
async fn rooms_are_isolated() {
    let server = boot(test_config()).await;
    let mut host_a = connect(server.addr).await;
    let mut host_b = connect(server.addr).await;
    let mut client_a = connect(server.addr).await;

    join(&mut host_a, "1000", "host").await;
    join(&mut host_b, "2000", "host").await;
    wait_for_joins(server.addr, 2).await;
    join(&mut client_a, "1000", "client").await;
    assert_eq!(recv(&mut host_a).await["event"], "peer-joined");

    send(&mut client_a, json!({"event": "select", "data": {"code": "1000", "key": "4"}})).await;
    assert_eq!(recv(&mut host_a).await["data"]["key"], "4");
    expect_silence(&mut host_b).await;
    server.shutdown().await;
}

#[tokio::test]
async fn disallowed_origin_is_refused() {
    let server = boot(ServerConfig {
        allowed_origins: vec!["https://plate.example".into()],
        ..test_config()
    })
    .await;

    let mut bad = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
    bad.headers_mut()
        .insert("Origin", "https://evil.example".parse().unwrap());
    assert!(connect_async(bad).await.is_err());

    let mut good = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
    good.headers_mut()
        .insert("Origin", "https://plate.example".parse().unwrap());
    assert!(connect_async(good).await.is_ok());

    server.shutdown().await;
}

#[tokio::test]
async fn silent_peer_times_out_and_leaves() {
    let server = boot(ServerConfig {
        heartbeat_interval: Duration::from_millis(100),
        client_timeout: Duration::from_millis(400),
        ..test_config()
    })
    .await;
    let mut host = connect(server.addr).await;
    let mut phone = connect(server.addr).await;

    join(&mut host, "3030", "host").await;
    wait_for_joins(server.addr, 1).await;
    join(&mut phone, "3030", "client").await;
    assert_eq!(recv(&mut host).await["event"], "peer-joined");

    // `phone` is never polled again, so it never answers pings.
    let left = recv(&mut host).await;
    assert_eq!(left["event"], "peer-left");
    assert_eq!(left["data"]["role"], "client");

    drop(phone);
    server.shutdown().await;
}

#[tokio::test]
async fn health_tracks_live_connections() {
    let server = boot(test_config()).await;
    let mut a = connect(server.addr).await;
    join(&mut a, "5151", "host").await;
    wait_for_joins(server.addr, 1).await;

    let body = health(server.addr).await;
    assert_eq!(body["connections"], 1);
    assert_eq!(body["rooms"], 1);

    a.close(None).await.unwrap();
    timeout(TIMEOUT, async {
        while health(server.addr).await["rooms"] != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room never emptied");
    server.shutdown().await;
}
