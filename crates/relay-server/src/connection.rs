//! Per-session connection state: outbox, callback table, liveness
//! timestamps, room memberships.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use relay_core::ConnectionId;
use serde::{Deserialize, Serialize};

use crate::cache::QueuedMessage;
use crate::registry::Callback;
use crate::rooms::{PathId, RoomId};
use crate::transport::Transport;

/// Session parameters captured at admission and surfaced to listeners.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionMeta {
    /// Client address; private/loopback ranges normalized to "unknown".
    pub ip: String,
    pub user_agent: String,
    /// Application-supplied connection parameters (query string).
    pub params: HashMap<String, String>,
}

/// Per-connection traffic counters.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// One live session. Created on transport accept, destroyed exactly
/// once on close, error, or heartbeat timeout.
pub struct Connection {
    pub id: ConnectionId,
    pub meta: SessionMeta,
    pub(crate) transport: Box<dyn Transport>,

    /// Pending outbound messages, drained atomically on flush.
    pub(crate) outbox: Vec<Arc<QueuedMessage>>,
    pub(crate) callbacks: CallbackTable,
    /// Rooms this connection belongs to, for cleanup on disconnect.
    pub(crate) rooms: HashSet<(PathId, RoomId)>,

    /// Registry-clock milliseconds.
    pub since: u64,
    /// Last time an application-bearing frame arrived.
    pub seen: u64,
    /// Last time a heartbeat probe was sent.
    pub contacted: u64,
    /// Last measured heartbeat round-trip, milliseconds.
    pub rtt: u64,
    /// Set once by the heartbeat sweep; terminal.
    pub timed_out: bool,

    pub stats: ConnectionStats,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        transport: Box<dyn Transport>,
        meta: SessionMeta,
        now: u64,
    ) -> Self {
        Self {
            id,
            meta,
            transport,
            outbox: Vec::new(),
            callbacks: CallbackTable::new(),
            rooms: HashSet::new(),
            since: now,
            seen: now,
            contacted: now,
            rtt: 0,
            timed_out: false,
            stats: ConnectionStats::default(),
        }
    }

    /// Rooms this connection currently belongs to.
    pub fn rooms(&self) -> impl Iterator<Item = &(PathId, RoomId)> {
        self.rooms.iter()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("ip", &self.meta.ip)
            .field("seen", &self.seen)
            .field("rtt", &self.rtt)
            .field("timed_out", &self.timed_out)
            .field("outbox", &self.outbox.len())
            .field("rooms", &self.rooms.len())
            .finish()
    }
}

/// Correlation-token arena: a growable slot array plus a free-list of
/// released indices. A token is valid for at most one invocation, then
/// its slot is freed for reuse. Slot 0 is never handed out, so a zero
/// token on the wire always resolves as stale.
pub(crate) struct CallbackTable {
    slots: Vec<Option<Callback>>,
    free: Vec<u32>,
}

impl CallbackTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: vec![None],
            free: Vec::new(),
        }
    }

    /// Store a handler, reusing a freed slot when one exists.
    pub(crate) fn insert(&mut self, callback: Callback) -> u32 {
        if let Some(token) = self.free.pop() {
            self.slots[token as usize] = Some(callback);
            return token;
        }
        let token = self.slots.len() as u32;
        self.slots.push(Some(callback));
        token
    }

    /// Claim the handler for `token`, freeing the slot. `None` for
    /// stale or never-issued tokens.
    pub(crate) fn take(&mut self, token: u32) -> Option<Callback> {
        let slot = self.slots.get_mut(token as usize)?;
        let callback = slot.take()?;
        self.free.push(token);
        Some(callback)
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Box::new(|_, _, _| {})
    }

    #[test]
    fn tokens_start_at_one() {
        let mut table = CallbackTable::new();
        assert_eq!(table.insert(noop()), 1);
        assert_eq!(table.insert(noop()), 2);
    }

    #[test]
    fn take_frees_the_slot_for_reuse() {
        let mut table = CallbackTable::new();
        let t1 = table.insert(noop());
        let t2 = table.insert(noop());
        assert!(table.take(t1).is_some());
        // freed slot is reused before the table grows
        assert_eq!(table.insert(noop()), t1);
        assert_eq!(table.pending(), 2);
        assert!(table.take(t2).is_some());
    }

    #[test]
    fn take_is_single_use() {
        let mut table = CallbackTable::new();
        let token = table.insert(noop());
        assert!(table.take(token).is_some());
        assert!(table.take(token).is_none());
    }

    #[test]
    fn unknown_tokens_are_stale() {
        let mut table = CallbackTable::new();
        assert!(table.take(0).is_none());
        assert!(table.take(99).is_none());
    }
}
