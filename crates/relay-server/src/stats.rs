//! Server-wide counters, snapshotted on demand.

use serde::{Deserialize, Serialize};

/// Aggregate traffic and fault counters since the server started.
/// Timestamps are milliseconds on the registry clock.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ServerStats {
    /// Clock reading when the server started.
    pub since: u64,
    /// Clock reading when the snapshot was taken.
    pub now: u64,
    /// Connections currently live.
    pub connections: usize,
    /// Total connections ever admitted.
    pub served: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Flushes answered from the broadcast-frame cache.
    pub messages_cached: u64,
    /// Unparseable frames and malformed batch elements.
    pub messages_garbage: u64,
    pub socket_errors: u64,
    /// Batches dropped because the transport refused the write.
    pub failed_sends: u64,
    pub stale_callbacks: u64,
}
