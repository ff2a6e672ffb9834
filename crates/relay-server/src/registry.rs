//! The single-owner state store. Every connection, room, outbox,
//! callback table, and counter lives here, mutated only by the event
//! task, so no operation in this module takes a lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use relay_core::{encode_batch, ConnectionId, Envelope, Fault, HEARTBEAT_FRAME};
use serde_json::Value;

use crate::cache::{BroadcastCache, QueuedMessage};
use crate::connection::{Connection, SessionMeta};
use crate::rooms::{PathId, Room, RoomEvent, RoomId, RoomSet};
use crate::stats::ServerStats;
use crate::tracker::{Change, RoomManager};
use crate::transport::{ReadyState, Transport};

/// One-shot response handler stored until the peer answers or the
/// connection dies. Invoked with full registry command access.
pub type Callback = Box<dyn FnOnce(&mut Registry, &ConnectionId, Value) + Send>;

/// Connection, room, and queue state for one server. Handlers and hooks
/// receive `&mut Registry` and may emit, join, leave, or disconnect
/// freely; the owning event loop settles the consequences (hook
/// dispatch, outbox flushes) after each inbound event.
pub struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    /// Indexed by [`PathId`]; grows in lockstep with the tracker.
    room_sets: Vec<RoomSet>,
    tracker: RoomManager,
    cache: BroadcastCache,
    /// Connections whose outbox went empty to non-empty this cycle.
    flush_queue: Vec<ConnectionId>,
    /// Membership transitions awaiting hook dispatch.
    room_events: VecDeque<RoomEvent>,

    now: u64,
    since: u64,

    served: u64,
    bytes_sent: u64,
    bytes_received: u64,
    messages_sent: u64,
    messages_received: u64,
    messages_cached: u64,
    messages_garbage: u64,
    socket_errors: u64,
    failed_sends: u64,
    stale_callbacks: u64,
}

impl Registry {
    pub(crate) fn new(now: u64) -> Self {
        Self {
            connections: HashMap::new(),
            room_sets: Vec::new(),
            tracker: RoomManager::new(),
            cache: BroadcastCache::new(),
            flush_queue: Vec::new(),
            room_events: VecDeque::new(),
            now,
            since: now,
            served: 0,
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
            messages_cached: 0,
            messages_garbage: 0,
            socket_errors: 0,
            failed_sends: 0,
            stale_callbacks: 0,
        }
    }

    /// Current registry-clock reading, milliseconds.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub(crate) fn set_now(&mut self, now: u64) {
        self.now = now;
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            since: self.since,
            now: self.now,
            connections: self.connections.len(),
            served: self.served,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            messages_cached: self.messages_cached,
            messages_garbage: self.messages_garbage,
            socket_errors: self.socket_errors,
            failed_sends: self.failed_sends,
            stale_callbacks: self.stale_callbacks,
        }
    }

    // ---- outbound messaging ------------------------------------------

    /// Queue a message for one connection. Unknown ids are ignored.
    pub fn emit(&mut self, conn: &ConnectionId, key: impl Into<String>, value: Value) {
        let msg = self.cache.tag(Envelope::new(key, value));
        self.push_message(conn, msg);
    }

    /// Queue a message carrying a correlation token; `callback` runs at
    /// most once, when (and if) the peer answers the token.
    pub fn emit_with_callback(
        &mut self,
        conn: &ConnectionId,
        key: impl Into<String>,
        value: Value,
        callback: Callback,
    ) {
        let Some(c) = self.connections.get_mut(conn) else {
            return;
        };
        let token = c.callbacks.insert(callback);
        let msg = self.cache.tag(Envelope::with_token(key, value, token));
        self.push_message(conn, msg);
    }

    /// Queue a message, coalescing with any same-key message already
    /// pending: the newer value overwrites the older one in place, so
    /// the batch carries at most one message per coalesced key.
    pub fn once(&mut self, conn: &ConnectionId, key: impl Into<String>, value: Value) {
        let msg = self.cache.tag(Envelope::new(key, value));
        self.push_once(conn, &msg);
    }

    /// Queue one shared message on every live connection's outbox.
    pub fn broadcast(&mut self, key: impl Into<String>, value: Value) {
        let targets: Vec<ConnectionId> = self.connections.keys().cloned().collect();
        let msg = self.cache.tag(Envelope::new(key, value));
        for id in &targets {
            self.push_message(id, Arc::clone(&msg));
        }
    }

    /// Broadcast to every live connection except `skip`.
    pub fn broadcast_except(&mut self, skip: &ConnectionId, key: impl Into<String>, value: Value) {
        let targets: Vec<ConnectionId> = self
            .connections
            .keys()
            .filter(|id| *id != skip)
            .cloned()
            .collect();
        let msg = self.cache.tag(Envelope::new(key, value));
        for id in &targets {
            self.push_message(id, Arc::clone(&msg));
        }
    }

    /// Coalescing broadcast: each recipient's outbox keeps at most one
    /// pending message for the key. Recipients share one message so
    /// identical batches hit the frame cache.
    pub fn broadcast_once(&mut self, key: impl Into<String>, value: Value) {
        let targets: Vec<ConnectionId> = self.connections.keys().cloned().collect();
        let msg = self.cache.tag(Envelope::new(key, value));
        for id in &targets {
            self.push_once(id, &msg);
        }
    }

    /// Coalescing broadcast to every live connection except `skip`.
    pub fn broadcast_once_except(
        &mut self,
        skip: &ConnectionId,
        key: impl Into<String>,
        value: Value,
    ) {
        let targets: Vec<ConnectionId> = self
            .connections
            .keys()
            .filter(|id| *id != skip)
            .cloned()
            .collect();
        let msg = self.cache.tag(Envelope::new(key, value));
        for id in &targets {
            self.push_once(id, &msg);
        }
    }

    /// Queue one shared message on every member of a room. Unknown
    /// rooms are a no-op.
    pub fn room_broadcast(
        &mut self,
        path: PathId,
        room: &RoomId,
        key: impl Into<String>,
        value: Value,
    ) {
        let targets = self.room_members(path, room);
        let msg = self.cache.tag(Envelope::new(key, value));
        for id in &targets {
            self.push_message(id, Arc::clone(&msg));
        }
    }

    /// Room broadcast excluding one member, typically the sender.
    pub fn room_broadcast_except(
        &mut self,
        path: PathId,
        room: &RoomId,
        skip: &ConnectionId,
        key: impl Into<String>,
        value: Value,
    ) {
        let mut targets = self.room_members(path, room);
        targets.retain(|id| id != skip);
        let msg = self.cache.tag(Envelope::new(key, value));
        for id in &targets {
            self.push_message(id, Arc::clone(&msg));
        }
    }

    /// Coalescing room broadcast.
    pub fn room_broadcast_once(
        &mut self,
        path: PathId,
        room: &RoomId,
        key: impl Into<String>,
        value: Value,
    ) {
        let targets = self.room_members(path, room);
        let msg = self.cache.tag(Envelope::new(key, value));
        for id in &targets {
            self.push_once(id, &msg);
        }
    }

    /// Coalescing room broadcast excluding one member.
    pub fn room_broadcast_once_except(
        &mut self,
        path: PathId,
        room: &RoomId,
        skip: &ConnectionId,
        key: impl Into<String>,
        value: Value,
    ) {
        let mut targets = self.room_members(path, room);
        targets.retain(|id| id != skip);
        let msg = self.cache.tag(Envelope::new(key, value));
        for id in &targets {
            self.push_once(id, &msg);
        }
    }

    fn room_members(&self, path: PathId, room: &RoomId) -> Vec<ConnectionId> {
        self.room_sets
            .get(path.0)
            .and_then(|set| set.get(room))
            .map(|r| r.members().cloned().collect())
            .unwrap_or_default()
    }

    fn push_message(&mut self, conn: &ConnectionId, msg: Arc<QueuedMessage>) {
        let Some(c) = self.connections.get_mut(conn) else {
            return;
        };
        if c.outbox.is_empty() {
            self.flush_queue.push(conn.clone());
        }
        c.outbox.push(msg);
    }

    /// Coalescing queue step: when the key is already pending, only the
    /// value is overwritten. Batch position and any correlation token on
    /// the pending message survive, so a callback emitted earlier in
    /// the cycle still resolves.
    fn push_once(&mut self, conn: &ConnectionId, msg: &Arc<QueuedMessage>) {
        let Some(c) = self.connections.get_mut(conn) else {
            return;
        };
        if let Some(i) = c
            .outbox
            .iter()
            .position(|m| m.envelope.key == msg.envelope.key)
        {
            match c.outbox[i].envelope.token {
                // the pending message owns a token this connection is
                // waiting on; carry it onto the new value
                Some(token) => {
                    let mut envelope = msg.envelope.clone();
                    envelope.token = Some(token);
                    c.outbox[i] = self.cache.tag(envelope);
                }
                None => c.outbox[i] = Arc::clone(msg),
            }
            return;
        }
        if c.outbox.is_empty() {
            self.flush_queue.push(conn.clone());
        }
        c.outbox.push(Arc::clone(msg));
    }

    /// Queue an already-built envelope. Used for callback responses.
    pub(crate) fn push_envelope(&mut self, conn: &ConnectionId, envelope: Envelope) {
        let msg = self.cache.tag(envelope);
        self.push_message(conn, msg);
    }

    // ---- rooms -------------------------------------------------------

    /// Register a tracking path, allocating its room set on first use.
    pub fn track(&mut self, path: &str) -> PathId {
        let (id, is_new) = self.tracker.track(path);
        if is_new {
            self.room_sets.push(RoomSet::new(path));
        }
        id
    }

    pub fn path_id(&self, path: &str) -> Option<PathId> {
        self.tracker.path_id(path)
    }

    pub fn path_name(&self, id: PathId) -> Option<&str> {
        self.tracker.path_name(id)
    }

    pub fn room_set(&self, path: PathId) -> Option<&RoomSet> {
        self.room_sets.get(path.0)
    }

    pub fn room(&self, path: PathId, id: &RoomId) -> Option<&Room> {
        self.room_sets.get(path.0).and_then(|set| set.get(id))
    }

    /// Install the observation table for a connection's tracked fields.
    /// Idempotent; a second call never re-fires joins.
    pub fn observe(&mut self, conn: &ConnectionId) {
        self.tracker.observe(conn);
    }

    /// Record an assignment at a tracked path and apply the membership
    /// diff: leave the displaced room (if any), then join the new one
    /// (if any). Assigning the current value is a no-op.
    pub fn assign(&mut self, conn: &ConnectionId, path: PathId, value: Option<RoomId>) {
        match self.tracker.record(conn, path, value.as_ref()) {
            Change::Unchanged => {}
            Change::Replaced(old) => {
                if let Some(old) = old {
                    self.leave_room(conn, path, &old);
                }
                if let Some(new) = value {
                    self.join_room(conn, path, new);
                }
            }
        }
    }

    /// Pre-create a room, optionally persistent. Persistent rooms never
    /// fire create/delete and survive becoming empty.
    pub fn create_room(&mut self, path: PathId, id: impl Into<RoomId>, persistent: bool) {
        let Some(set) = self.room_sets.get_mut(path.0) else {
            return;
        };
        let room = set.ensure(id.into());
        room.persistent = persistent;
    }

    /// Remove a room, evicting every member (each eviction fires its
    /// leave hook). Persistent rooms are not deletable.
    pub fn delete_room(&mut self, path: PathId, id: &RoomId) {
        let persistent = match self.room(path, id) {
            Some(room) => room.persistent,
            None => return,
        };
        if persistent {
            return;
        }
        let members = self.room_members(path, id);
        for conn in &members {
            self.assign(conn, path, None);
        }
    }

    /// Add a connection to a room, creating the room on demand. Fires
    /// create (on 0 to 1, non-persistent only) then join. Adding an
    /// existing member is a no-op.
    pub fn join_room(&mut self, conn: &ConnectionId, path: PathId, id: impl Into<RoomId>) {
        let id = id.into();
        let Some(set) = self.room_sets.get_mut(path.0) else {
            return;
        };
        let room = set.ensure(id.clone());
        let was_empty = room.is_empty();
        if !room.add(conn.clone()) {
            return;
        }
        let persistent = room.persistent;
        if let Some(c) = self.connections.get_mut(conn) {
            c.rooms.insert((path, id.clone()));
        }
        if was_empty && !persistent {
            self.room_events.push_back(RoomEvent::Created {
                path,
                room: id.clone(),
                conn: conn.clone(),
            });
        }
        self.room_events.push_back(RoomEvent::Joined {
            path,
            room: id,
            conn: conn.clone(),
        });
    }

    /// Remove a connection from a room. Fires leave, then delete when
    /// the last member departs a non-persistent room (which is then
    /// destroyed). Removing a non-member is a no-op.
    pub fn leave_room(&mut self, conn: &ConnectionId, path: PathId, id: &RoomId) {
        let Some(set) = self.room_sets.get_mut(path.0) else {
            return;
        };
        let Some(room) = set.get_mut(id) else {
            return;
        };
        if !room.remove(conn) {
            return;
        }
        let emptied = room.is_empty();
        let persistent = room.persistent;
        if let Some(c) = self.connections.get_mut(conn) {
            c.rooms.remove(&(path, id.clone()));
        }
        self.room_events.push_back(RoomEvent::Left {
            path,
            room: id.clone(),
            conn: conn.clone(),
        });
        if emptied && !persistent {
            self.room_sets[path.0].remove(id);
            self.room_events.push_back(RoomEvent::Deleted {
                path,
                room: id.clone(),
                conn: conn.clone(),
            });
        }
    }

    pub(crate) fn has_room_events(&self) -> bool {
        !self.room_events.is_empty()
    }

    pub(crate) fn pop_room_event(&mut self) -> Option<RoomEvent> {
        self.room_events.pop_front()
    }

    // ---- connection lifecycle ----------------------------------------

    pub(crate) fn admit(
        &mut self,
        id: ConnectionId,
        transport: Box<dyn Transport>,
        meta: SessionMeta,
    ) {
        self.served += 1;
        let conn = Connection::new(id.clone(), transport, meta, self.now);
        self.connections.insert(id, conn);
    }

    /// Destroy a connection: evict it from every room (firing the usual
    /// leave/delete transitions) and drop its observation table and
    /// callbacks. Returns the removed state for the disconnect listener.
    pub(crate) fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        if !self.connections.contains_key(id) {
            return None;
        }
        let rooms: Vec<(PathId, RoomId)> = self
            .connections
            .get(id)
            .map(|c| c.rooms.iter().cloned().collect())
            .unwrap_or_default();
        for (path, room) in &rooms {
            self.leave_room(id, *path, room);
        }
        self.tracker.forget(id);
        self.connections.remove(id)
    }

    /// Close a connection from the server side. With `no_reconnect`,
    /// tell the client to stay away before closing; the frame bypasses
    /// the outbox so it wins the race with the close handshake.
    pub fn disconnect(&mut self, id: &ConnectionId, no_reconnect: bool) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if no_reconnect {
            let frame = encode_batch(&[Envelope::new("disconnect", Value::Bool(true))]);
            if !conn.transport.send(&frame) {
                self.failed_sends += 1;
            }
        }
        conn.transport.close();
    }

    /// Abort a connection's transport without a close handshake. The
    /// close event that follows performs the actual removal.
    pub(crate) fn terminate(&mut self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.transport.terminate();
        }
    }

    // ---- liveness ----------------------------------------------------

    /// Record a heartbeat ack, returning the measured round trip.
    pub(crate) fn heartbeat_ack(&mut self, id: &ConnectionId) -> Option<u64> {
        let now = self.now;
        let conn = self.connections.get_mut(id)?;
        conn.seen = now;
        conn.rtt = now.saturating_sub(conn.contacted);
        Some(conn.rtt)
    }

    /// Account an inbound application frame.
    pub(crate) fn note_frame(&mut self, id: &ConnectionId, bytes: u64, messages: u64) {
        let now = self.now;
        self.bytes_received += bytes;
        self.messages_received += messages;
        if let Some(conn) = self.connections.get_mut(id) {
            conn.seen = now;
            conn.stats.bytes_received += bytes;
            conn.stats.messages_received += messages;
        }
    }

    pub(crate) fn take_callback(&mut self, id: &ConnectionId, token: u32) -> Option<Callback> {
        self.connections.get_mut(id)?.callbacks.take(token)
    }

    /// Liveness pass, run every `timeout / 2` milliseconds. Connections
    /// silent past the timeout are marked timed out and returned with
    /// their silence duration; the caller notifies listeners and
    /// terminates them. Connections approaching the deadline get an
    /// empty-frame probe.
    pub(crate) fn sweep(&mut self, timeout: u64, grace: u64) -> Vec<(ConnectionId, u64)> {
        let now = self.now;
        let probe_after = (timeout / 2).saturating_sub(grace);
        let mut timed_out = Vec::new();
        for conn in self.connections.values_mut() {
            if conn.timed_out {
                continue;
            }
            let delay = now.saturating_sub(conn.seen);
            if delay > timeout {
                conn.timed_out = true;
                timed_out.push((conn.id.clone(), delay));
            } else if delay > probe_after {
                conn.contacted = now;
                if !conn.transport.send(HEARTBEAT_FRAME) {
                    self.socket_errors += 1;
                }
            }
        }
        timed_out
    }

    // ---- faults ------------------------------------------------------

    /// Count a fault and log it at the severity it deserves.
    pub(crate) fn count_fault(&mut self, conn: &ConnectionId, fault: &Fault) {
        match fault {
            Fault::Garbage | Fault::UnknownKey(_) => self.messages_garbage += 1,
            Fault::Transport(_) => self.socket_errors += 1,
            Fault::StaleCallback(_) => self.stale_callbacks += 1,
            Fault::Unwritable => self.failed_sends += 1,
        }
        tracing::debug!(conn = %conn, kind = fault.kind(), "{fault}");
    }

    // ---- flush -------------------------------------------------------

    /// Take the connections whose outbox filled this cycle.
    pub(crate) fn take_flush_queue(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.flush_queue)
    }

    /// Drain a connection's pending outbox.
    pub(crate) fn take_outbox(&mut self, id: &ConnectionId) -> Vec<Arc<QueuedMessage>> {
        self.connections
            .get_mut(id)
            .map(|c| std::mem::take(&mut c.outbox))
            .unwrap_or_default()
    }

    pub(crate) fn is_writable(&self, id: &ConnectionId) -> bool {
        self.connections
            .get(id)
            .is_some_and(|c| c.transport.ready_state() == ReadyState::Open)
    }

    /// Serialize and send one batch, reusing the cycle's frame cache
    /// for repeated fan-out compositions.
    pub(crate) fn write_batch(&mut self, id: &ConnectionId, batch: &[Arc<QueuedMessage>]) {
        let (frame, hit) = self.cache.frame(batch);
        if hit {
            self.messages_cached += 1;
        }
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if conn.transport.send(&frame) {
            let bytes = frame.len() as u64;
            let messages = batch.len() as u64;
            self.bytes_sent += bytes;
            self.messages_sent += messages;
            conn.stats.bytes_sent += bytes;
            conn.stats.messages_sent += messages;
        } else {
            self.failed_sends += 1;
        }
    }

    /// End-of-cycle boundary for the broadcast-frame cache.
    pub(crate) fn clear_cache(&mut self) {
        self.cache.clear();
    }
}
