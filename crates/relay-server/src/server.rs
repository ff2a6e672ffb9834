//! HTTP/WebSocket edge. Each socket gets a reader loop and a writer
//! task; everything they observe is reported into the hub's event
//! channel, so the edge holds no protocol state of its own.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use relay_core::ConnectionId;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;

use crate::connection::SessionMeta;
use crate::hub::{Hub, ServerEvent};
use crate::transport::{ReadyState, WriterCmd, WsTransport};

/// Server configuration.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub grace_ms: u64,
    pub max_send_queue: usize,
    /// Reconnect backlogs longer than this are dropped unread.
    pub max_backlog_bytes: usize,
    /// Inbound WebSocket message size cap.
    pub max_payload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            timeout_ms: 60_000,
            grace_ms: 5_000,
            max_send_queue: 256,
            max_backlog_bytes: 2_048,
            max_payload_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub events: mpsc::Sender<ServerEvent>,
    pub config: Arc<ServerConfig>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind the listener, spawn the event task, and start serving.
/// Returns a handle holding the bound port and the background tasks.
pub async fn start(config: ServerConfig, mut hub: Hub) -> Result<ServerHandle, std::io::Error> {
    let config = Arc::new(config);
    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(1024);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    // The event task: sole owner of the hub. Every event advances the
    // registry clock before it is handled.
    let sweep_every = Duration::from_millis((config.timeout_ms / 2).max(1));
    let hub_handle = tokio::spawn(async move {
        let origin = Instant::now();
        hub.notify_listen();
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.tick().await;
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    hub.registry.set_now(origin.elapsed().as_millis() as u64);
                    hub.handle_event(event);
                }
                _ = sweep.tick() => {
                    hub.registry.set_now(origin.elapsed().as_millis() as u64);
                    hub.handle_event(ServerEvent::Sweep);
                }
            }
        }
    });

    let app_state = AppState {
        events: event_tx,
        config: Arc::clone(&config),
    };
    let router = build_router(app_state);

    tracing::info!(port = local_addr.port(), "relay server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _hub: hub_handle,
    })
}

/// Handle returned by `start()`. Dropping it does not stop the server;
/// the tasks run until the process exits.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _hub: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler. Session parameters ride the query
/// string; the reserved `backlog` parameter carries frames the client
/// queued while disconnected.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(mut params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let backlog = params.remove("backlog").filter(|b| {
        if b.len() > state.config.max_backlog_bytes {
            tracing::debug!(len = b.len(), "oversized reconnect backlog dropped");
            return false;
        }
        true
    });
    let meta = SessionMeta {
        ip: client_ip(addr, &headers),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        params,
    };
    ws.max_message_size(state.config.max_payload_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, meta, backlog))
}

/// Drive one WebSocket session: spawn the writer, announce the open,
/// pump inbound frames, and report the close exactly once.
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    meta: SessionMeta,
    backlog: Option<String>,
) {
    let id = ConnectionId::new();
    let (transport, mut cmd_rx, ready) = WsTransport::channel(state.config.max_send_queue);
    let (mut sink, mut stream) = socket.split();
    *ready.lock() = ReadyState::Open;

    let writer_state = Arc::clone(&ready);
    let writer = tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                WriterCmd::Frame(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        *writer_state.lock() = ReadyState::Closed;
                        break;
                    }
                }
                WriterCmd::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    *writer_state.lock() = ReadyState::Closed;
                    break;
                }
                WriterCmd::Terminate => {
                    *writer_state.lock() = ReadyState::Closed;
                    break;
                }
            }
        }
    });

    let opened = state
        .events
        .send(ServerEvent::Open {
            id: id.clone(),
            transport: Box::new(transport),
            meta,
            backlog,
        })
        .await;
    if opened.is_err() {
        writer.abort();
        return;
    }

    let mut close = (1006u16, String::new());
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let sent = state
                    .events
                    .send(ServerEvent::Frame {
                        id: id.clone(),
                        text: text.to_string(),
                    })
                    .await;
                if sent.is_err() {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    close = (frame.code, frame.reason.to_string());
                } else {
                    close = (1000, String::new());
                }
                break;
            }
            Ok(Message::Binary(_)) => {
                tracing::debug!(conn = %id, "ignoring binary frame");
            }
            // protocol-level ping/pong is answered by axum itself
            Ok(_) => {}
            Err(err) => {
                let _ = state
                    .events
                    .send(ServerEvent::Error {
                        id: id.clone(),
                        error: err.to_string(),
                    })
                    .await;
                break;
            }
        }
    }

    *ready.lock() = ReadyState::Closed;
    let _ = state
        .events
        .send(ServerEvent::Closed {
            id,
            code: close.0,
            reason: close.1,
        })
        .await;
    writer.abort();
}

/// Health check HTTP endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Counter snapshot, answered by the event task so no lock is shared
/// with the hot path.
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    if state
        .events
        .send(ServerEvent::Stats { reply: tx })
        .await
        .is_ok()
    {
        if let Ok(stats) = rx.await {
            return Json(stats).into_response();
        }
    }
    StatusCode::SERVICE_UNAVAILABLE.into_response()
}

/// Resolve the client address, preferring the first `x-forwarded-for`
/// hop. Private, loopback, and link-local ranges all collapse to
/// "unknown" so session metadata never leaks internal topology.
fn client_ip(addr: SocketAddr, headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    let ip = match forwarded.unwrap_or_else(|| addr.ip()) {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    };
    if is_internal(&ip) {
        "unknown".to_string()
    } else {
        ip.to_string()
    }
}

fn is_internal(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local, fe80::/10 link-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
