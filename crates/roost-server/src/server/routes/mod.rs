//! Route modules for the administrative REST surface and the WebSocket
//! transport.

pub mod connections;
pub mod mediation;
pub mod messages;
pub mod websocket;
