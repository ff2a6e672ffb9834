//! End-to-end tests over real WebSocket connections.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_server::{
    Hub, HubOptions, Registry, RoomHooks, RoomId, ServerConfig, ServerHooks, SessionMeta,
};
use relay_core::ConnectionId;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WelcomeHooks;

impl ServerHooks for WelcomeHooks {
    fn connect(&mut self, reg: &mut Registry, conn: &ConnectionId, _meta: &SessionMeta) {
        reg.emit(conn, "welcome", json!("hi"));
    }
}

async fn start(hub: Hub, timeout_ms: u64, grace_ms: u64) -> u16 {
    let config = ServerConfig {
        port: 0,
        timeout_ms,
        grace_ms,
        ..Default::default()
    };
    let handle = relay_server::start(config, hub).await.unwrap();
    handle.port
}

async fn connect(port: u16) -> Ws {
    connect_with_query(port, "").await
}

async fn connect_with_query(port: u16, query: &str) -> Ws {
    let url = if query.is_empty() {
        format!("ws://127.0.0.1:{port}/ws")
    } else {
        format!("ws://127.0.0.1:{port}/ws?{query}")
    };
    let (ws, _resp) = connect_async(&url).await.unwrap();
    ws
}

/// Next text frame, with a test-failure deadline.
async fn next_text(ws: &mut Ws) -> String {
    timeout(Duration::from_secs(5), async {
        while let Some(msg) = ws.next().await {
            if let Message::Text(text) = msg.unwrap() {
                return text.to_string();
            }
        }
        panic!("connection ended before a text frame arrived");
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn connect_welcome_and_callback_round_trip() {
    let mut hub = Hub::new(HubOptions::default());
    hub.set_hooks(WelcomeHooks);
    hub.on(
        "move",
        Box::new(|reg, conn, value, reply| {
            assert_eq!(value["x"], json!(1));
            if let Some(reply) = reply {
                reply.send(reg, conn, json!(true));
            }
        }),
    );
    let port = start(hub, 60_000, 5_000).await;

    let mut ws = connect(port).await;
    assert_eq!(next_text(&mut ws).await, r#"[["welcome","hi"]]"#);

    ws.send(Message::text(r#"[["move",{"x":1},1]]"#)).await.unwrap();
    assert_eq!(next_text(&mut ws).await, r#"[["",[1,true]]]"#);
}

#[tokio::test]
async fn heartbeat_probe_keeps_the_connection_alive() {
    let hub = Hub::new(HubOptions {
        timeout_ms: 1_000,
        grace_ms: 400,
    });
    let port = start(hub, 1_000, 400).await;

    let mut ws = connect(port).await;
    // the sweep probes idle connections with the empty frame
    assert_eq!(next_text(&mut ws).await, "");
    ws.send(Message::text("")).await.unwrap();
    // answering keeps us alive long enough to be probed again
    assert_eq!(next_text(&mut ws).await, "");
}

#[tokio::test]
async fn silent_connection_is_terminated() {
    let hub = Hub::new(HubOptions {
        timeout_ms: 300,
        grace_ms: 0,
    });
    let port = start(hub, 300, 0).await;

    let mut ws = connect(port).await;
    let ended = timeout(Duration::from_secs(5), async {
        while let Some(msg) = ws.next().await {
            match msg {
                // ignore probes without answering them
                Ok(Message::Text(t)) if t.is_empty() => {}
                Ok(Message::Close(_)) | Err(_) => return true,
                _ => {}
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(ended);
}

#[tokio::test]
async fn reconnect_backlog_is_replayed() {
    let mut hub = Hub::new(HubOptions::default());
    hub.on(
        "resume",
        Box::new(|reg, conn, value, _| {
            reg.emit(conn, "resumed", value);
        }),
    );
    let port = start(hub, 60_000, 5_000).await;

    // [["resume","x"]] percent-encoded into the query string
    let mut ws =
        connect_with_query(port, "backlog=%5B%5B%22resume%22%2C%22x%22%5D%5D").await;
    assert_eq!(next_text(&mut ws).await, r#"[["resumed","x"]]"#);
}

struct TableHooks;

impl RoomHooks for TableHooks {
    fn on_join(&mut self, reg: &mut Registry, room: &RoomId, conn: &ConnectionId) {
        let path = reg.path_id("table").unwrap();
        reg.room_broadcast_except(path, room, conn, "seated", json!(room.as_str()));
    }
}

#[tokio::test]
async fn room_join_broadcasts_to_other_members() {
    let mut hub = Hub::new(HubOptions::default());
    let path = hub.track_with_hooks("table", TableHooks);
    hub.on(
        "sit",
        Box::new(move |reg, conn, value, _| {
            let room = RoomId::from(value.as_str().unwrap_or_default());
            reg.observe(conn);
            reg.assign(conn, path, Some(room.clone()));
            reg.emit(conn, "sat", json!(room.as_str()));
        }),
    );
    let port = start(hub, 60_000, 5_000).await;

    let mut first = connect(port).await;
    ws_sit(&mut first, "t1").await;

    let mut second = connect(port).await;
    ws_sit(&mut second, "t1").await;

    // the earlier member hears about the newcomer; the newcomer does not
    assert_eq!(next_text(&mut first).await, r#"[["seated","t1"]]"#);
}

async fn ws_sit(ws: &mut Ws, room: &str) {
    ws.send(Message::text(format!(r#"[["sit","{room}"]]"#)))
        .await
        .unwrap();
    // wait for the server to acknowledge the seat before moving on
    assert_eq!(next_text(ws).await, format!(r#"[["sat","{room}"]]"#));
}

#[tokio::test]
async fn health_and_stats_endpoints() {
    let hub = Hub::new(HubOptions::default());
    let port = start(hub, 60_000, 5_000).await;

    let health: Value = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let mut ws = connect(port).await;
    ws.send(Message::text("definitely not json")).await.unwrap();
    // the stats request rides the same event queue, but HTTP and the
    // socket race to enqueue; give the frame a head start
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats: Value = reqwest::get(format!("http://127.0.0.1:{port}/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["connections"], json!(1));
    assert_eq!(stats["served"], json!(1));
    assert_eq!(stats["messages_garbage"], json!(1));
}

#[tokio::test]
async fn batched_emits_arrive_as_one_frame() {
    let mut hub = Hub::new(HubOptions::default());
    hub.on(
        "burst",
        Box::new(|reg, conn, _, _| {
            reg.emit(conn, "one", json!(1));
            reg.once(conn, "state", json!("a"));
            reg.once(conn, "state", json!("b"));
            reg.emit(conn, "two", json!(2));
        }),
    );
    let port = start(hub, 60_000, 5_000).await;

    let mut ws = connect(port).await;
    ws.send(Message::text(r#"[["burst",null]]"#)).await.unwrap();
    // one flush per inbound event, coalesced keys keep their position
    assert_eq!(
        next_text(&mut ws).await,
        r#"[["one",1],["state","b"],["two",2]]"#
    );
}
