//! Named broadcast groups and their per-tracking-path collections.

use std::collections::HashMap;
use std::fmt;

use relay_core::ConnectionId;
use serde::{Deserialize, Serialize};

use crate::registry::Registry;

/// Application-chosen room identity, unique within its owning
/// [`RoomSet`]. Compared by equality; two assignments of the same id
/// refer to the same room.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Index of a registered tracking path. Handed out by
/// [`Registry::track`] and stable for the process lifetime.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct PathId(pub(crate) usize);

/// A named set of connections sharing a broadcast group.
#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    /// Persistent rooms survive becoming empty and never fire
    /// create/delete hooks.
    pub persistent: bool,
    members: Vec<ConnectionId>,
}

impl Room {
    pub(crate) fn new(id: RoomId) -> Self {
        Self {
            id,
            persistent: false,
            members: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, conn: &ConnectionId) -> bool {
        self.members.contains(conn)
    }

    pub fn members(&self) -> impl Iterator<Item = &ConnectionId> {
        self.members.iter()
    }

    /// Idempotent add; returns false when already a member.
    pub(crate) fn add(&mut self, conn: ConnectionId) -> bool {
        if self.members.contains(&conn) {
            return false;
        }
        self.members.push(conn);
        true
    }

    /// Idempotent remove; returns false when not a member.
    pub(crate) fn remove(&mut self, conn: &ConnectionId) -> bool {
        match self.members.iter().position(|m| m == conn) {
            Some(i) => {
                self.members.remove(i);
                true
            }
            None => false,
        }
    }
}

/// The id-indexed collection of rooms scoped to one tracking path.
/// Owns creation and deletion: non-persistent rooms exist exactly while
/// they have members.
#[derive(Debug)]
pub struct RoomSet {
    pub path: String,
    rooms: HashMap<RoomId, Room>,
}

impl RoomSet {
    pub(crate) fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            rooms: HashMap::new(),
        }
    }

    pub fn get(&self, id: &RoomId) -> Option<&Room> {
        self.rooms.get(id)
    }

    pub fn contains(&self, id: &RoomId) -> bool {
        self.rooms.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub(crate) fn get_mut(&mut self, id: &RoomId) -> Option<&mut Room> {
        self.rooms.get_mut(id)
    }

    /// Create-on-demand: resolve the room, creating it empty if absent.
    pub(crate) fn ensure(&mut self, id: RoomId) -> &mut Room {
        self.rooms
            .entry(id.clone())
            .or_insert_with(|| Room::new(id))
    }

    pub(crate) fn remove(&mut self, id: &RoomId) -> Option<Room> {
        self.rooms.remove(id)
    }
}

/// Membership transition emitted by the registry and delivered to
/// [`RoomHooks`] after the mutation that caused it completes.
#[derive(Clone, Debug)]
pub(crate) enum RoomEvent {
    Created {
        path: PathId,
        room: RoomId,
        conn: ConnectionId,
    },
    Joined {
        path: PathId,
        room: RoomId,
        conn: ConnectionId,
    },
    Left {
        path: PathId,
        room: RoomId,
        conn: ConnectionId,
    },
    Deleted {
        path: PathId,
        room: RoomId,
        conn: ConnectionId,
    },
}

/// Lifecycle hooks for the rooms of one tracking path.
///
/// `on_create` fires the instant membership transitions 0 to 1 (never
/// for persistent rooms), before `on_join`. `on_leave` fires before
/// `on_delete` when the last member departs a non-persistent room.
/// Hooks receive full registry command access and may emit, join, or
/// leave; resulting transitions are delivered in order.
pub trait RoomHooks: Send {
    fn on_create(&mut self, _reg: &mut Registry, _room: &RoomId, _conn: &ConnectionId) {}
    fn on_join(&mut self, _reg: &mut Registry, _room: &RoomId, _conn: &ConnectionId) {}
    fn on_leave(&mut self, _reg: &mut Registry, _room: &RoomId, _conn: &ConnectionId) {}
    fn on_delete(&mut self, _reg: &mut Registry, _room: &RoomId, _conn: &ConnectionId) {}
}
