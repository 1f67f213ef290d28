//! Connection tracking.
//!
//! The in-memory [`ConnectionRegistry`] answers "who has a live channel
//! right now"; the durable [`ConnectionStore`] keeps last-seen history
//! across restarts for the admin surface.

mod connection_registry;
mod storage;

pub use connection_registry::{
    ConnectionInfo, ConnectionRegistry, OutboundMessage, SendResult,
};
pub use storage::{ConnectionCounts, ConnectionRecord, ConnectionStore, CONNECTIONS_SCHEMA};
