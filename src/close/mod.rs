//! Close handshake module
//!
//! Coordinates how a WebSocket connection closes: the timeout policy, the
//! forced-close timer and the single eviction notification.

mod coordinator;
mod status;
mod timer;
mod transport;

pub use coordinator::*;
pub use status::*;
pub use timer::*;
pub use transport::*;
