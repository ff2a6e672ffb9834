//! Wire protocol, identities, and fault taxonomy for the relay
//! messaging substrate. Pure types, no I/O.

pub mod fault;
pub mod ids;
pub mod protocol;

pub use fault::Fault;
pub use ids::ConnectionId;
pub use protocol::{
    decode, encode_batch, parse_envelope, Decoded, Envelope, CALLBACK_KEY, HEARTBEAT_FRAME,
};
