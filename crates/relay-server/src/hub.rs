//! Run-to-completion event core. One task owns a [`Hub`] and feeds it
//! [`ServerEvent`]s; each event is handled fully, then queued room
//! hooks run and filled outboxes flush, before the next event starts.
//! The strict ordering is what makes outbox batching and the
//! per-cycle frame cache sound.

use std::collections::HashMap;

use relay_core::{decode, parse_envelope, ConnectionId, Decoded, Fault, CALLBACK_KEY};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::connection::SessionMeta;
use crate::listeners::{Listeners, MessageHandler, ServerHooks};
use crate::registry::Registry;
use crate::rooms::{PathId, RoomEvent, RoomHooks};
use crate::stats::ServerStats;
use crate::transport::Transport;

/// Liveness tuning. The sweep runs every `timeout_ms / 2`; a probe goes
/// out when a connection has been silent for half the timeout minus the
/// grace margin.
#[derive(Clone, Copy, Debug)]
pub struct HubOptions {
    pub timeout_ms: u64,
    pub grace_ms: u64,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            grace_ms: 5_000,
        }
    }
}

/// Everything the transport edge reports into the event task.
pub enum ServerEvent {
    /// A connection completed its handshake. `backlog` carries frames
    /// the client buffered while disconnected, replayed as if just
    /// received.
    Open {
        id: ConnectionId,
        transport: Box<dyn Transport>,
        meta: SessionMeta,
        backlog: Option<String>,
    },
    /// An inbound text frame, heartbeat acks included.
    Frame { id: ConnectionId, text: String },
    /// The transport closed, for any reason. Always the last event for
    /// its connection.
    Closed {
        id: ConnectionId,
        code: u16,
        reason: String,
    },
    /// A transport-level error; a `Closed` follows.
    Error { id: ConnectionId, error: String },
    /// Periodic liveness pass.
    Sweep,
    /// Counter snapshot request from the HTTP surface.
    Stats { reply: oneshot::Sender<ServerStats> },
}

/// The event core: registry state plus the dispatch tables, held as
/// separate fields so a handler can mutate the registry while the hub
/// still owns the handler.
pub struct Hub {
    pub registry: Registry,
    listeners: Listeners,
    room_hooks: HashMap<PathId, Box<dyn RoomHooks>>,
    options: HubOptions,
}

impl Hub {
    pub fn new(options: HubOptions) -> Self {
        Self {
            registry: Registry::new(0),
            listeners: Listeners::new(),
            room_hooks: HashMap::new(),
            options,
        }
    }

    pub fn options(&self) -> HubOptions {
        self.options
    }

    /// Register a message handler for a key.
    pub fn on(&mut self, key: impl Into<String>, handler: MessageHandler) {
        self.listeners.on(key, handler);
    }

    /// Install the lifecycle hook set, replacing the default no-ops.
    pub fn set_hooks(&mut self, hooks: impl ServerHooks + 'static) {
        self.listeners.set_hooks(Box::new(hooks));
    }

    /// Register a tracking path.
    pub fn track(&mut self, path: &str) -> PathId {
        self.registry.track(path)
    }

    /// Register a tracking path with room lifecycle hooks attached.
    pub fn track_with_hooks(&mut self, path: &str, hooks: impl RoomHooks + 'static) -> PathId {
        let id = self.registry.track(path);
        self.room_hooks.insert(id, Box::new(hooks));
        id
    }

    /// Fire the listen hook once the acceptor is bound.
    pub fn notify_listen(&mut self) {
        self.listeners.listen(&mut self.registry);
        self.finish_cycle();
    }

    /// Process one event to completion: mutate, run hooks, flush.
    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Open {
                id,
                transport,
                meta,
                backlog,
            } => self.handle_open(id, transport, meta, backlog),
            ServerEvent::Frame { id, text } => self.handle_frame(&id, &text),
            ServerEvent::Closed { id, code, reason } => self.handle_closed(&id, code, &reason),
            ServerEvent::Error { id, error } => {
                self.registry.count_fault(&id, &Fault::Transport(error));
            }
            ServerEvent::Sweep => self.handle_sweep(),
            ServerEvent::Stats { reply } => {
                let _ = reply.send(self.registry.stats());
            }
        }
        self.finish_cycle();
    }

    fn handle_open(
        &mut self,
        id: ConnectionId,
        transport: Box<dyn Transport>,
        meta: SessionMeta,
        backlog: Option<String>,
    ) {
        tracing::debug!(conn = %id, ip = %meta.ip, "connection admitted");
        self.registry.admit(id.clone(), transport, meta.clone());
        self.listeners.connect(&mut self.registry, &id, &meta);
        // replay what the client queued while disconnected
        if let Some(text) = backlog {
            self.handle_frame(&id, &text);
        }
    }

    fn handle_frame(&mut self, id: &ConnectionId, text: &str) {
        match decode(text) {
            Decoded::Heartbeat => {
                if let Some(rtt) = self.registry.heartbeat_ack(id) {
                    self.listeners.ping(&mut self.registry, id, rtt);
                }
            }
            Decoded::Garbage => {
                self.registry.count_fault(id, &Fault::Garbage);
                let payload = Value::String(text.to_owned());
                self.listeners.garbage(&mut self.registry, id, &payload);
            }
            Decoded::Batch(items) => {
                self.registry
                    .note_frame(id, text.len() as u64, items.len() as u64);
                self.listeners.incoming(&mut self.registry, id, &items);
                for item in &items {
                    self.handle_message(id, item);
                }
            }
        }
    }

    fn handle_message(&mut self, id: &ConnectionId, item: &Value) {
        let Some(envelope) = parse_envelope(item) else {
            self.registry.count_fault(id, &Fault::Garbage);
            self.listeners.garbage(&mut self.registry, id, item);
            return;
        };
        if envelope.key == CALLBACK_KEY {
            let Some((token, value)) = envelope.as_callback_response() else {
                self.registry.count_fault(id, &Fault::Garbage);
                self.listeners.garbage(&mut self.registry, id, item);
                return;
            };
            match self.registry.take_callback(id, token) {
                Some(callback) => callback(&mut self.registry, id, value),
                None => self.registry.count_fault(id, &Fault::StaleCallback(token)),
            }
            return;
        }
        if !self.listeners.dispatch(&mut self.registry, id, envelope) {
            let key = item
                .as_array()
                .and_then(|p| p.first())
                .and_then(Value::as_str)
                .unwrap_or_default();
            self.registry
                .count_fault(id, &Fault::UnknownKey(key.to_owned()));
            self.listeners.garbage(&mut self.registry, id, item);
        }
    }

    fn handle_closed(&mut self, id: &ConnectionId, code: u16, reason: &str) {
        let Some(conn) = self.registry.remove(id) else {
            return;
        };
        tracing::debug!(conn = %id, code, reason, "connection closed");
        // room evictions fire before the disconnect hook
        self.drain_room_events();
        self.listeners
            .disconnect(&mut self.registry, &conn, code, reason);
    }

    fn handle_sweep(&mut self) {
        let HubOptions {
            timeout_ms,
            grace_ms,
        } = self.options;
        for (id, delay) in self.registry.sweep(timeout_ms, grace_ms) {
            tracing::info!(conn = %id, delay_ms = delay, "heartbeat timeout");
            self.listeners.timeout(&mut self.registry, &id, delay);
            self.registry.terminate(&id);
        }
    }

    /// Settle the cycle: run queued room hooks, flush filled outboxes,
    /// repeat until both queues are quiet, then drop the frame cache.
    fn finish_cycle(&mut self) {
        loop {
            self.drain_room_events();
            let queue = self.registry.take_flush_queue();
            if queue.is_empty() {
                if self.registry.has_room_events() {
                    continue;
                }
                break;
            }
            for id in &queue {
                self.flush_connection(id);
            }
            self.registry.clear_cache();
        }
    }

    fn drain_room_events(&mut self) {
        while let Some(event) = self.registry.pop_room_event() {
            let (path, room, conn) = match &event {
                RoomEvent::Created { path, room, conn }
                | RoomEvent::Joined { path, room, conn }
                | RoomEvent::Left { path, room, conn }
                | RoomEvent::Deleted { path, room, conn } => (*path, room.clone(), conn.clone()),
            };
            let Some(hooks) = self.room_hooks.get_mut(&path) else {
                continue;
            };
            match event {
                RoomEvent::Created { .. } => hooks.on_create(&mut self.registry, &room, &conn),
                RoomEvent::Joined { .. } => hooks.on_join(&mut self.registry, &room, &conn),
                RoomEvent::Left { .. } => hooks.on_leave(&mut self.registry, &room, &conn),
                RoomEvent::Deleted { .. } => hooks.on_delete(&mut self.registry, &room, &conn),
            }
        }
    }

    fn flush_connection(&mut self, id: &ConnectionId) {
        let batch = self.registry.take_outbox(id);
        if batch.is_empty() {
            return;
        }
        if !self.registry.is_writable(id) {
            self.registry.count_fault(id, &Fault::Unwritable);
            return;
        }
        self.listeners.outgoing(&mut self.registry, id, &batch);
        self.registry.write_batch(id, &batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::RoomId;
    use crate::testing::{mock_transport, MockHandle};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    struct LogHooks {
        log: Log,
    }

    impl ServerHooks for LogHooks {
        fn connect(&mut self, reg: &mut Registry, conn: &ConnectionId, _meta: &SessionMeta) {
            self.log.lock().push("connect".into());
            reg.emit(conn, "welcome", json!("hi"));
        }
        fn disconnect(&mut self, _reg: &mut Registry, _conn: &crate::Connection, code: u16, _r: &str) {
            self.log.lock().push(format!("disconnect:{code}"));
        }
        fn timeout(&mut self, _reg: &mut Registry, _conn: &ConnectionId, delay_ms: u64) {
            self.log.lock().push(format!("timeout:{delay_ms}"));
        }
        fn ping(&mut self, _reg: &mut Registry, _conn: &ConnectionId, rtt_ms: u64) {
            self.log.lock().push(format!("ping:{rtt_ms}"));
        }
        fn garbage(&mut self, _reg: &mut Registry, _conn: &ConnectionId, _payload: &Value) {
            self.log.lock().push("garbage".into());
        }
    }

    struct LogRoomHooks {
        log: Log,
    }

    impl RoomHooks for LogRoomHooks {
        fn on_create(&mut self, _reg: &mut Registry, room: &RoomId, _conn: &ConnectionId) {
            self.log.lock().push(format!("create:{room}"));
        }
        fn on_join(&mut self, reg: &mut Registry, room: &RoomId, conn: &ConnectionId) {
            self.log.lock().push(format!("join:{room}"));
            reg.emit(conn, "roomed", json!(room.as_str()));
        }
        fn on_leave(&mut self, _reg: &mut Registry, room: &RoomId, _conn: &ConnectionId) {
            self.log.lock().push(format!("leave:{room}"));
        }
        fn on_delete(&mut self, _reg: &mut Registry, room: &RoomId, _conn: &ConnectionId) {
            self.log.lock().push(format!("delete:{room}"));
        }
    }

    fn hub_with_log() -> (Hub, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut hub = Hub::new(HubOptions::default());
        hub.set_hooks(LogHooks { log: log.clone() });
        (hub, log)
    }

    fn open(hub: &mut Hub, backlog: Option<String>) -> (ConnectionId, MockHandle) {
        let id = ConnectionId::new();
        let (transport, handle) = mock_transport();
        hub.handle_event(ServerEvent::Open {
            id: id.clone(),
            transport,
            meta: SessionMeta::default(),
            backlog,
        });
        (id, handle)
    }

    #[test]
    fn open_fires_connect_and_flushes() {
        let (mut hub, log) = hub_with_log();
        let (_id, handle) = open(&mut hub, None);
        assert_eq!(*log.lock(), vec!["connect".to_string()]);
        assert_eq!(handle.frames(), vec![r#"[["welcome","hi"]]"#.to_string()]);
    }

    #[test]
    fn handler_reply_and_emit_batch_together() {
        let (mut hub, _log) = hub_with_log();
        hub.on(
            "move",
            Box::new(|reg, conn, value, reply| {
                reg.emit(conn, "moved", value);
                if let Some(reply) = reply {
                    reply.send(reg, conn, json!(true));
                }
            }),
        );
        let (id, handle) = open(&mut hub, None);
        hub.handle_event(ServerEvent::Frame {
            id,
            text: r#"[["move",{"x":1},1]]"#.to_string(),
        });
        // welcome first, then the handler's two messages in one frame
        let frames = handle.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], r#"[["moved",{"x":1}],["",[1,true]]]"#);
    }

    #[test]
    fn heartbeat_fires_ping() {
        let (mut hub, log) = hub_with_log();
        let (id, _handle) = open(&mut hub, None);
        hub.handle_event(ServerEvent::Frame {
            id,
            text: String::new(),
        });
        assert!(log.lock().iter().any(|e| e.starts_with("ping:")));
    }

    #[test]
    fn garbage_frame_counts_and_notifies() {
        let (mut hub, log) = hub_with_log();
        let (id, _handle) = open(&mut hub, None);
        hub.handle_event(ServerEvent::Frame {
            id,
            text: "not json".to_string(),
        });
        assert_eq!(hub.registry.stats().messages_garbage, 1);
        assert!(log.lock().contains(&"garbage".to_string()));
    }

    #[test]
    fn unknown_key_is_garbage_but_siblings_dispatch() {
        let (mut hub, log) = hub_with_log();
        let handled: Log = Arc::new(Mutex::new(Vec::new()));
        let handled2 = handled.clone();
        hub.on(
            "known",
            Box::new(move |_, _, _, _| handled2.lock().push("known".into())),
        );
        let (id, _handle) = open(&mut hub, None);
        hub.handle_event(ServerEvent::Frame {
            id,
            text: r#"[["nope",1],["known",2],42]"#.to_string(),
        });
        assert_eq!(*handled.lock(), vec!["known".to_string()]);
        // one unknown key plus one malformed element
        assert_eq!(hub.registry.stats().messages_garbage, 2);
        assert_eq!(log.lock().iter().filter(|e| *e == "garbage").count(), 2);
    }

    #[test]
    fn stale_callback_response_is_counted() {
        let (mut hub, _log) = hub_with_log();
        let (id, _handle) = open(&mut hub, None);
        hub.handle_event(ServerEvent::Frame {
            id,
            text: r#"[["",[9,"late"]]]"#.to_string(),
        });
        assert_eq!(hub.registry.stats().stale_callbacks, 1);
    }

    #[test]
    fn callback_response_invokes_stored_handler() {
        let (mut hub, _log) = hub_with_log();
        let (id, handle) = open(&mut hub, None);
        hub.registry.emit_with_callback(
            &id,
            "ask",
            json!(null),
            Box::new(|reg, conn, value| {
                reg.emit(conn, "answered", value);
            }),
        );
        // flush the ask so the outbox is clean
        hub.handle_event(ServerEvent::Sweep);
        hub.handle_event(ServerEvent::Frame {
            id,
            text: r#"[["",[1,"yes"]]]"#.to_string(),
        });
        assert!(handle
            .frames()
            .contains(&r#"[["answered","yes"]]"#.to_string()));
    }

    #[test]
    fn backlog_replays_on_open() {
        let (mut hub, _log) = hub_with_log();
        let seen: Log = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        hub.on(
            "resume",
            Box::new(move |_, _, value, _| seen2.lock().push(value.to_string())),
        );
        let (_id, _handle) = open(&mut hub, Some(r#"[["resume","state"]]"#.to_string()));
        assert_eq!(*seen.lock(), vec!["\"state\"".to_string()]);
    }

    #[test]
    fn closed_evicts_rooms_before_disconnect_hook() {
        let (mut hub, log) = hub_with_log();
        let path = hub.track_with_hooks("table", LogRoomHooks { log: log.clone() });
        let (id, _handle) = open(&mut hub, None);
        hub.registry.join_room(&id, path, "t1");
        hub.handle_event(ServerEvent::Sweep);

        hub.handle_event(ServerEvent::Closed {
            id,
            code: 1001,
            reason: "going away".to_string(),
        });
        let log = log.lock();
        let leave = log.iter().position(|e| e == "leave:t1").unwrap();
        let delete = log.iter().position(|e| e == "delete:t1").unwrap();
        let disconnect = log.iter().position(|e| e == "disconnect:1001").unwrap();
        assert!(leave < delete && delete < disconnect);
    }

    #[test]
    fn room_hooks_run_after_mutation_and_may_emit() {
        let (mut hub, log) = hub_with_log();
        let path = hub.track_with_hooks("table", LogRoomHooks { log: log.clone() });
        let (id, handle) = open(&mut hub, None);
        hub.on(
            "sit",
            Box::new(move |reg, conn, value, _| {
                let room = RoomId::from(value.as_str().unwrap_or_default());
                reg.observe(conn);
                reg.assign(conn, path, Some(room));
            }),
        );
        hub.handle_event(ServerEvent::Frame {
            id,
            text: r#"[["sit","t1"]]"#.to_string(),
        });
        {
            let log = log.lock();
            let create = log.iter().position(|e| e == "create:t1").unwrap();
            let join = log.iter().position(|e| e == "join:t1").unwrap();
            assert!(create < join);
        }
        // the join hook's emit flushed in the same cycle
        assert!(handle.frames().contains(&r#"[["roomed","t1"]]"#.to_string()));
    }

    #[test]
    fn sweep_terminates_and_reports_timeouts() {
        let (mut hub, log) = hub_with_log();
        let (id, handle) = open(&mut hub, None);
        hub.registry.set_now(70_000);
        hub.handle_event(ServerEvent::Sweep);
        assert!(log.lock().iter().any(|e| e.starts_with("timeout:")));
        assert!(handle.terminated());
        // the edge delivers the close; the hub then removes it
        hub.handle_event(ServerEvent::Closed {
            id: id.clone(),
            code: 1006,
            reason: String::new(),
        });
        assert!(hub.registry.connection(&id).is_none());
    }

    #[test]
    fn identical_room_broadcasts_hit_the_frame_cache() {
        let (mut hub, _log) = hub_with_log();
        let path = hub.track("table");
        let (a, ha) = open(&mut hub, None);
        let (b, hb) = open(&mut hub, None);
        hub.registry.join_room(&a, path, "t1");
        hub.registry.join_room(&b, path, "t1");
        hub.on(
            "shout",
            Box::new(move |reg, _conn, value, _| {
                reg.room_broadcast(path, &RoomId::from("t1"), "heard", value);
            }),
        );
        hub.handle_event(ServerEvent::Frame {
            id: a,
            text: r#"[["shout","hey"]]"#.to_string(),
        });
        assert_eq!(hub.registry.stats().messages_cached, 1);
        assert_eq!(ha.frames().last(), hb.frames().last());
    }
}
