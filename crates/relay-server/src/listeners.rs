//! Application-facing dispatch: string-keyed message handlers plus the
//! connection-lifecycle hook surface.

use std::collections::HashMap;
use std::sync::Arc;

use relay_core::{ConnectionId, Envelope};
use serde_json::Value;

use crate::cache::QueuedMessage;
use crate::connection::{Connection, SessionMeta};
use crate::registry::Registry;

/// Handler for one message key. Receives the sender, the payload, and
/// a [`Reply`] when the peer attached a correlation token.
pub type MessageHandler =
    Box<dyn FnMut(&mut Registry, &ConnectionId, Value, Option<Reply>) + Send>;

/// Capability to answer a token-bearing message. Consumed on use; a
/// dropped reply simply never answers (the peer's callback stays until
/// its connection dies).
pub struct Reply {
    token: u32,
}

impl Reply {
    pub(crate) fn new(token: u32) -> Self {
        Self { token }
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    /// Queue the response on the sender's outbox. Batches with any
    /// other messages emitted by the same handler invocation.
    pub fn send(self, reg: &mut Registry, conn: &ConnectionId, value: Value) {
        reg.push_envelope(conn, Envelope::callback_response(self.token, value));
    }
}

/// Connection-lifecycle and traffic hooks. All methods default to
/// no-ops; implement the ones the application cares about.
#[allow(unused_variables)]
pub trait ServerHooks: Send {
    /// The server is accepting connections.
    fn listen(&mut self, reg: &mut Registry) {}
    /// A connection was admitted. Fires before any of its frames.
    fn connect(&mut self, reg: &mut Registry, conn: &ConnectionId, meta: &SessionMeta) {}
    /// A connection was destroyed. Receives the removed state; room
    /// evictions have already fired.
    fn disconnect(&mut self, reg: &mut Registry, conn: &Connection, code: u16, reason: &str) {}
    /// A connection went silent past the timeout and is being killed.
    fn timeout(&mut self, reg: &mut Registry, conn: &ConnectionId, delay_ms: u64) {}
    /// A heartbeat ack arrived; `rtt_ms` is the measured round trip.
    fn ping(&mut self, reg: &mut Registry, conn: &ConnectionId, rtt_ms: u64) {}
    /// An unparseable frame or batch element, or an unhandled key.
    fn garbage(&mut self, reg: &mut Registry, conn: &ConnectionId, payload: &Value) {}
    /// A batch arrived, before any of its messages dispatch.
    fn incoming(&mut self, reg: &mut Registry, conn: &ConnectionId, batch: &[Value]) {}
    /// A batch is about to be written to a connection.
    fn outgoing(&mut self, reg: &mut Registry, conn: &ConnectionId, batch: &[Arc<QueuedMessage>]) {
    }
}

/// The default hook set: everything is a no-op.
pub struct NoHooks;

impl ServerHooks for NoHooks {}

/// Handler table plus the installed hook set. Held by the hub beside
/// the registry so dispatch can borrow both disjointly.
pub(crate) struct Listeners {
    handlers: HashMap<String, MessageHandler>,
    hooks: Box<dyn ServerHooks>,
}

impl Listeners {
    pub(crate) fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            hooks: Box::new(NoHooks),
        }
    }

    /// Register a handler for a message key. The empty key is reserved
    /// for callback responses. Re-registering replaces.
    pub(crate) fn on(&mut self, key: impl Into<String>, handler: MessageHandler) {
        let key = key.into();
        assert!(!key.is_empty(), "the empty key is reserved");
        self.handlers.insert(key, handler);
    }

    pub(crate) fn set_hooks(&mut self, hooks: Box<dyn ServerHooks>) {
        self.hooks = hooks;
    }

    pub(crate) fn has_handler(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    pub(crate) fn dispatch(
        &mut self,
        reg: &mut Registry,
        conn: &ConnectionId,
        envelope: Envelope,
    ) -> bool {
        let Some(handler) = self.handlers.get_mut(&envelope.key) else {
            return false;
        };
        let reply = envelope.token.map(Reply::new);
        handler(reg, conn, envelope.value, reply);
        true
    }

    pub(crate) fn listen(&mut self, reg: &mut Registry) {
        self.hooks.listen(reg);
    }

    pub(crate) fn connect(&mut self, reg: &mut Registry, conn: &ConnectionId, meta: &SessionMeta) {
        self.hooks.connect(reg, conn, meta);
    }

    pub(crate) fn disconnect(
        &mut self,
        reg: &mut Registry,
        conn: &Connection,
        code: u16,
        reason: &str,
    ) {
        self.hooks.disconnect(reg, conn, code, reason);
    }

    pub(crate) fn timeout(&mut self, reg: &mut Registry, conn: &ConnectionId, delay_ms: u64) {
        self.hooks.timeout(reg, conn, delay_ms);
    }

    pub(crate) fn ping(&mut self, reg: &mut Registry, conn: &ConnectionId, rtt_ms: u64) {
        self.hooks.ping(reg, conn, rtt_ms);
    }

    pub(crate) fn garbage(&mut self, reg: &mut Registry, conn: &ConnectionId, payload: &Value) {
        self.hooks.garbage(reg, conn, payload);
    }

    pub(crate) fn incoming(&mut self, reg: &mut Registry, conn: &ConnectionId, batch: &[Value]) {
        self.hooks.incoming(reg, conn, batch);
    }

    pub(crate) fn outgoing(
        &mut self,
        reg: &mut Registry,
        conn: &ConnectionId,
        batch: &[Arc<QueuedMessage>],
    ) {
        self.hooks.outgoing(reg, conn, batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatch_routes_by_key() {
        let mut listeners = Listeners::new();
        let mut reg = Registry::new(0);
        let conn = ConnectionId::new();

        listeners.on(
            "chat",
            Box::new(|_, _, value, _| {
                assert_eq!(value, json!("hi"));
            }),
        );
        assert!(listeners.has_handler("chat"));
        assert!(listeners.dispatch(&mut reg, &conn, Envelope::new("chat", json!("hi"))));
        assert!(!listeners.dispatch(&mut reg, &conn, Envelope::new("unknown", json!(null))));
    }

    #[test]
    fn reply_present_only_with_token() {
        let mut listeners = Listeners::new();
        let mut reg = Registry::new(0);
        let conn = ConnectionId::new();

        listeners.on(
            "probe",
            Box::new(|_, _, _, reply| {
                assert!(reply.is_none());
            }),
        );
        listeners.dispatch(&mut reg, &conn, Envelope::new("probe", json!(null)));

        listeners.on(
            "probe",
            Box::new(|_, _, _, reply| {
                assert_eq!(reply.unwrap().token(), 4);
            }),
        );
        listeners.dispatch(&mut reg, &conn, Envelope::with_token("probe", json!(null), 4));
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn empty_key_is_rejected() {
        let mut listeners = Listeners::new();
        listeners.on("", Box::new(|_, _, _, _| {}));
    }
}
