//! Connection registry
//!
//! Holds one record per live WebSocket connection up to a fixed capacity.
//! Records are removed through the eviction callback handed to each
//! connection's close coordinator, which frees the slot for a new peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifier assigned to an admitted connection
pub type ConnectionId = Uuid;

/// Errors that can occur during registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Connection registry full ({0} connections)")]
    Full(usize),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Events broadcast by the registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A connection took a slot
    Admitted {
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
    },
    /// A connection gave its slot back
    Evicted { connection_id: ConnectionId },
}

/// Record kept for each admitted connection
#[derive(Debug, Clone)]
struct ConnectionInfo {
    peer_addr: SocketAddr,
    connected_at: Instant,
}

/// Thread-safe registry of live connections
///
/// Clones share the same records. The lock is a plain `std` lock because
/// eviction runs synchronously from the close path.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionInfo>>>,
    capacity: usize,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl ConnectionRegistry {
    /// Create a registry that admits at most `capacity` connections
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            event_tx,
        }
    }

    /// Subscribe to admission and eviction events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Take a slot for a new connection
    pub fn admit(&self, peer_addr: SocketAddr) -> RegistryResult<ConnectionId> {
        let connection_id = Uuid::new_v4();
        {
            let mut connections = self.write();
            if connections.len() >= self.capacity {
                return Err(RegistryError::Full(self.capacity));
            }
            connections.insert(
                connection_id,
                ConnectionInfo {
                    peer_addr,
                    connected_at: Instant::now(),
                },
            );
        }

        let _ = self.event_tx.send(RegistryEvent::Admitted {
            connection_id,
            peer_addr,
        });

        debug!("Admitted connection {} from {}", connection_id, peer_addr);
        Ok(connection_id)
    }

    /// Remove a connection and free its slot
    ///
    /// Returns `false` if the connection was not registered.
    pub fn evict(&self, connection_id: ConnectionId) -> bool {
        let removed = self.write().remove(&connection_id);
        let Some(info) = removed else {
            debug!("Connection {} already evicted", connection_id);
            return false;
        };

        let _ = self.event_tx.send(RegistryEvent::Evicted { connection_id });

        info!(
            "Evicted connection {} from {} after {:?}",
            connection_id,
            info.peer_addr,
            info.connected_at.elapsed()
        );
        true
    }

    /// Callback that evicts `connection_id`, for the connection's close coordinator
    pub fn eviction_callback(&self, connection_id: ConnectionId) -> impl FnOnce() + Send + 'static {
        let registry = self.clone();
        move || {
            registry.evict(connection_id);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, ConnectionInfo>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, ConnectionInfo>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::{CloseCoordinator, CloseTransport, ClosingTimeout};

    struct NoopTransport;

    impl CloseTransport for NoopTransport {
        fn close_channel_now(&self) {}
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn test_registry_new() {
        let registry = ConnectionRegistry::new(4);
        assert_eq!(registry.capacity(), 4);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_admit_and_evict() {
        let registry = ConnectionRegistry::new(4);
        let id = registry.admit(peer()).unwrap();

        assert_eq!(registry.len(), 1);

        assert!(registry.evict(id));
        assert!(!registry.evict(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_admit_when_full() {
        let registry = ConnectionRegistry::new(2);
        let first = registry.admit(peer()).unwrap();
        registry.admit(peer()).unwrap();

        let result = registry.admit(peer());
        assert!(matches!(result, Err(RegistryError::Full(2))));

        // Eviction frees the slot
        registry.evict(first);
        assert!(registry.admit(peer()).is_ok());
    }

    #[test]
    fn test_evict_unknown_id() {
        let registry = ConnectionRegistry::new(1);
        registry.admit(peer()).unwrap();
        assert!(!registry.evict(Uuid::new_v4()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_events() {
        let registry = ConnectionRegistry::new(4);
        let mut rx = registry.subscribe();

        let id = registry.admit(peer()).unwrap();
        registry.evict(id);
        registry.evict(id);

        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::Admitted {
                connection_id: id,
                peer_addr: peer()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::Evicted { connection_id: id }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_coordinator_evicts_on_close() {
        let registry = ConnectionRegistry::new(1);
        let id = registry.admit(peer()).unwrap();

        let coordinator =
            CloseCoordinator::new(ClosingTimeout::Immediate, Arc::new(NoopTransport)).unwrap();
        coordinator.set_eviction_callback(registry.eviction_callback(id));

        coordinator.on_local_close_requested();
        assert_eq!(registry.len(), 1);

        coordinator.on_connection_closed();
        assert!(registry.is_empty());
        assert!(!registry.evict(id));
        assert!(registry.admit(peer()).is_ok());
    }
}
