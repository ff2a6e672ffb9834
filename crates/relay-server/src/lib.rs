//! Persistent-connection messaging server: batched wire protocol,
//! callback correlation, heartbeat liveness, rooms with lifecycle
//! hooks, and reactive room-membership tracking, all mutated by a
//! single event task.

pub mod cache;
pub mod connection;
pub mod hub;
pub mod listeners;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod stats;
pub mod tracker;
pub mod transport;

pub use cache::QueuedMessage;
pub use connection::{Connection, ConnectionStats, SessionMeta};
pub use hub::{Hub, HubOptions, ServerEvent};
pub use listeners::{MessageHandler, NoHooks, Reply, ServerHooks};
pub use registry::{Callback, Registry};
pub use rooms::{PathId, Room, RoomHooks, RoomId, RoomSet};
pub use server::{start, ServerConfig, ServerHandle};
pub use stats::ServerStats;
pub use transport::{ReadyState, Transport};
