//! Broadcast-payload cache: avoids re-serializing identical batches
//! when fanning the same messages to many connections.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use relay_core::{encode_batch, Envelope};

/// An envelope queued on a connection's outbox. The cache id is
/// assigned once at creation, monotonically increasing, so a batch's
/// composition can be fingerprinted without hashing payloads. Fan-out
/// messages share one `Arc<QueuedMessage>` across every recipient's
/// outbox.
#[derive(Debug)]
pub struct QueuedMessage {
    pub(crate) cache_id: u64,
    pub envelope: Envelope,
}

/// Frame memo for one flush cycle. Keyed by the ordered concatenation
/// of the batch's message cache ids; cleared at every cycle boundary so
/// no entry outlives the messages it serialized.
#[derive(Debug, Default)]
pub(crate) struct BroadcastCache {
    frames: HashMap<String, Arc<str>>,
    next_id: u64,
}

impl BroadcastCache {
    pub(crate) fn new() -> Self {
        Self {
            frames: HashMap::new(),
            next_id: 1,
        }
    }

    /// Wrap an envelope for queueing, tagging it with a fresh cache id.
    pub(crate) fn tag(&mut self, envelope: Envelope) -> Arc<QueuedMessage> {
        let cache_id = self.next_id;
        self.next_id += 1;
        Arc::new(QueuedMessage { cache_id, envelope })
    }

    /// Serialize a batch, reusing the memoized frame when an identical
    /// composition was already serialized this cycle. The bool reports
    /// a cache hit.
    pub(crate) fn frame(&mut self, batch: &[Arc<QueuedMessage>]) -> (Arc<str>, bool) {
        let mut key = String::with_capacity(batch.len() * 4);
        for msg in batch {
            let _ = write!(key, "{},", msg.cache_id);
        }
        if let Some(frame) = self.frames.get(&key) {
            return (Arc::clone(frame), true);
        }
        let frame: Arc<str> = encode_batch(batch.iter().map(|m| &m.envelope)).into();
        self.frames.insert(key, Arc::clone(&frame));
        (frame, false)
    }

    /// Cycle boundary: drop every memoized frame. Cache ids keep
    /// increasing so stale keys can never collide across cycles.
    pub(crate) fn clear(&mut self) {
        self.frames.clear();
    }

    #[cfg(test)]
    pub(crate) fn entries(&self) -> usize {
        self.frames.len()
    }
}
