//! WebSocket server module
//!
//! Hosts WebSocket connections and hands each one to a close coordinator.

#[allow(dead_code)]
mod protocol;
mod websocket;

#[allow(unused_imports)]
pub use protocol::*;
pub use websocket::*;
