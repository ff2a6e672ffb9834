//! Reactive room-membership tracking: the observer re-expression of
//! field-assignment interception. Application code declares a tracking
//! path once, then moves a connection between rooms by assigning a new
//! value at that path; the diff drives leave/join.

use std::collections::HashMap;

use relay_core::ConnectionId;

use crate::rooms::{PathId, RoomId};

/// Outcome of recording an assignment at a tracked path.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Change {
    /// Old and new values are identical; no join/leave.
    Unchanged,
    /// The value changed; holds the displaced value, if any.
    Replaced(Option<RoomId>),
}

/// Process-wide registry of tracking paths plus the per-connection
/// observation tables. Paths are registered once, typically at startup;
/// observation tables are created lazily on first use and live for the
/// connection's lifetime.
#[derive(Debug, Default)]
pub(crate) struct RoomManager {
    paths: Vec<String>,
    by_name: HashMap<String, PathId>,
    observed: HashMap<ConnectionId, HashMap<PathId, RoomId>>,
}

impl RoomManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a dotted path as observable. Idempotent; returns the
    /// path's id and whether it was newly registered.
    pub(crate) fn track(&mut self, path: &str) -> (PathId, bool) {
        if let Some(id) = self.by_name.get(path) {
            return (*id, false);
        }
        let id = PathId(self.paths.len());
        self.paths.push(path.to_owned());
        self.by_name.insert(path.to_owned(), id);
        (id, true)
    }

    pub(crate) fn path_id(&self, path: &str) -> Option<PathId> {
        self.by_name.get(path).copied()
    }

    pub(crate) fn path_name(&self, id: PathId) -> Option<&str> {
        self.paths.get(id.0).map(String::as_str)
    }

    /// Install the observation table for a connection. Re-observing an
    /// already-observed connection is a no-op.
    pub(crate) fn observe(&mut self, conn: &ConnectionId) {
        self.observed.entry(conn.clone()).or_default();
    }

    /// Record an assignment at `path`. Compares the stored value with
    /// the new one by identity (id equality) and updates the table;
    /// the caller performs the implied leave/join.
    pub(crate) fn record(
        &mut self,
        conn: &ConnectionId,
        path: PathId,
        value: Option<&RoomId>,
    ) -> Change {
        let table = self.observed.entry(conn.clone()).or_default();
        let old = table.get(&path);
        if old == value {
            return Change::Unchanged;
        }
        let displaced = old.cloned();
        match value {
            Some(v) => {
                table.insert(path, v.clone());
            }
            None => {
                table.remove(&path);
            }
        }
        Change::Replaced(displaced)
    }

    /// Drop a connection's observation table on disconnect.
    pub(crate) fn forget(&mut self, conn: &ConnectionId) {
        self.observed.remove(conn);
    }

    #[cfg(test)]
    pub(crate) fn is_observed(&self, conn: &ConnectionId) -> bool {
        self.observed.contains_key(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_is_idempotent() {
        let mut mgr = RoomManager::new();
        let (a, new_a) = mgr.track("currentGame");
        let (b, new_b) = mgr.track("currentGame");
        assert_eq!(a, b);
        assert!(new_a);
        assert!(!new_b);
        assert_eq!(mgr.path_name(a), Some("currentGame"));
        assert_eq!(mgr.path_id("currentGame"), Some(a));
    }

    #[test]
    fn same_value_assignment_is_unchanged() {
        let mut mgr = RoomManager::new();
        let (path, _) = mgr.track("table");
        let conn = ConnectionId::new();
        let room = RoomId::from("t1");

        assert_eq!(
            mgr.record(&conn, path, Some(&room)),
            Change::Replaced(None)
        );
        assert_eq!(mgr.record(&conn, path, Some(&room)), Change::Unchanged);
    }

    #[test]
    fn reassignment_reports_displaced_value() {
        let mut mgr = RoomManager::new();
        let (path, _) = mgr.track("table");
        let conn = ConnectionId::new();

        mgr.record(&conn, path, Some(&RoomId::from("t1")));
        let change = mgr.record(&conn, path, Some(&RoomId::from("t2")));
        assert_eq!(change, Change::Replaced(Some(RoomId::from("t1"))));

        let change = mgr.record(&conn, path, None);
        assert_eq!(change, Change::Replaced(Some(RoomId::from("t2"))));
        // clearing an already-clear path is a no-op
        assert_eq!(mgr.record(&conn, path, None), Change::Unchanged);
    }

    #[test]
    fn observe_twice_is_a_noop() {
        let mut mgr = RoomManager::new();
        let (path, _) = mgr.track("table");
        let conn = ConnectionId::new();

        mgr.observe(&conn);
        mgr.record(&conn, path, Some(&RoomId::from("t1")));
        mgr.observe(&conn);
        // the recorded value survives re-observation
        assert_eq!(mgr.record(&conn, path, Some(&RoomId::from("t1"))), Change::Unchanged);
    }

    #[test]
    fn forget_drops_the_table() {
        let mut mgr = RoomManager::new();
        let (path, _) = mgr.track("table");
        let conn = ConnectionId::new();
        mgr.record(&conn, path, Some(&RoomId::from("t1")));
        mgr.forget(&conn);
        assert!(!mgr.is_observed(&conn));
        // a fresh table sees the next assignment as new
        assert_eq!(
            mgr.record(&conn, path, Some(&RoomId::from("t1"))),
            Change::Replaced(None)
        );
    }
}
