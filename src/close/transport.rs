//! Seams between the close coordinator and its collaborators

/// Command side of the transport that carries one WebSocket connection
///
/// The transport reports the terminal "closed" event back through
/// [`CloseCoordinator::on_connection_closed`](super::CloseCoordinator::on_connection_closed),
/// including when the close command itself could not be delivered.
pub trait CloseTransport: Send + Sync {
    /// Tear the underlying channel down without waiting for the peer.
    /// Must be idempotent; failures are the transport's to log.
    fn close_channel_now(&self);
}

/// Tells the owning registry that the connection may be removed
pub type EvictionCallback = Box<dyn FnOnce() + Send + 'static>;
