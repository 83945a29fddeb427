//! Volatile registry of live per-room connections.
//!
//! One registry instance exists per process, owned by the server and handed
//! to every session as an `Arc` — never reached through global state. Its
//! contents start empty at process start and die with the process; durable
//! room records outlive it, so an entry is created lazily on the first join
//! attempt even when the room was persisted by an earlier run.
//!
//! Membership is bounded per room (`capacity`, default 2) and every mutation
//! runs under one write lock, so `count(room) <= capacity` holds at every
//! observable instant.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Opaque identity of one live connection.
///
/// Generated at registration time and compared by value; never derived from
/// the transport handle itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to one live connection's outbound lane.
///
/// Frames pushed through `deliver` are drained by the connection's writer
/// task in FIFO order. When the transport dies the writer task drops its
/// receiver and every later `deliver` fails, which is how the dispatcher
/// detects dead members.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task will drain.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: ConnectionId::generate(),
            outbound,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame for this connection.
    pub fn deliver(&self, frame: Message) -> Result<(), DeliveryError> {
        self.outbound
            .send(frame)
            .map_err(|_| DeliveryError { connection: self.id })
    }
}

/// Delivery into a closed outbound lane.
#[derive(Debug, Clone)]
pub struct DeliveryError {
    pub connection: ConnectionId,
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Delivery failed: connection {} is gone", self.connection)
    }
}

impl std::error::Error for DeliveryError {}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Accepted,
    RejectedCapacity,
}

/// Room id → set of live connections, bounded per room.
pub struct ConnectionRegistry {
    rooms: RwLock<HashMap<String, HashMap<ConnectionId, ConnectionHandle>>>,
    capacity: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry with the given per-room capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Add a connection to a room.
    ///
    /// Creates the room's entry if absent. A full room rejects without any
    /// membership mutation.
    pub async fn register(&self, room_id: &str, handle: ConnectionHandle) -> RegisterOutcome {
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room_id.to_string()).or_default();

        if members.len() >= self.capacity {
            log::info!(
                "Room {room_id} at capacity ({}); rejecting connection {}",
                members.len(),
                handle.id()
            );
            return RegisterOutcome::RejectedCapacity;
        }

        let _ = members.insert(handle.id(), handle);
        log::info!("Registered connection in room {room_id}; members={}", members.len());
        RegisterOutcome::Accepted
    }

    /// Remove a connection from a room. Idempotent; the room's entry is kept
    /// even when it becomes empty.
    pub async fn unregister(&self, room_id: &str, id: ConnectionId) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room_id) {
            if members.remove(&id).is_some() {
                log::info!(
                    "Unregistered connection {id} from room {room_id}; members={}",
                    members.len()
                );
            }
        }
    }

    /// Current live member count; 0 when the room has no entry.
    pub async fn count(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map_or(0, HashMap::len)
    }

    /// Point-in-time copy of a room's members, safe to iterate while the
    /// registry keeps mutating.
    pub async fn snapshot(&self, room_id: &str) -> Vec<ConnectionHandle> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Per-room member counts, for diagnostics.
    pub async fn room_counts(&self) -> Vec<(String, usize)> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(room, members)| (room.clone(), members.len()))
            .collect()
    }

    /// Configured per-room capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_count() {
        let registry = ConnectionRegistry::new(2);
        let (handle, _rx) = ConnectionHandle::new();

        assert_eq!(registry.count("r1").await, 0);
        assert_eq!(
            registry.register("r1", handle).await,
            RegisterOutcome::Accepted
        );
        assert_eq!(registry.count("r1").await, 1);
    }

    #[tokio::test]
    async fn test_capacity_rejection_without_mutation() {
        let registry = ConnectionRegistry::new(2);
        let (a, _ra) = ConnectionHandle::new();
        let (b, _rb) = ConnectionHandle::new();
        let (c, _rc) = ConnectionHandle::new();

        assert_eq!(registry.register("r1", a).await, RegisterOutcome::Accepted);
        assert_eq!(registry.register("r1", b).await, RegisterOutcome::Accepted);
        assert_eq!(
            registry.register("r1", c).await,
            RegisterOutcome::RejectedCapacity
        );
        assert_eq!(registry.count("r1").await, 2);
    }

    #[tokio::test]
    async fn test_capacity_bound_holds_per_room() {
        let registry = ConnectionRegistry::new(2);
        for room in ["alpha", "beta"] {
            for _ in 0..5 {
                let (handle, _rx) = ConnectionHandle::new();
                let _ = registry.register(room, handle).await;
            }
            assert!(registry.count(room).await <= registry.capacity());
        }
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new(2);
        let (handle, _rx) = ConnectionHandle::new();
        let id = handle.id();

        let _ = registry.register("r1", handle).await;
        registry.unregister("r1", id).await;
        assert_eq!(registry.count("r1").await, 0);

        // Second removal and removal from an unknown room are no-ops.
        registry.unregister("r1", id).await;
        registry.unregister("nowhere", id).await;
        assert_eq!(registry.count("r1").await, 0);
    }

    #[tokio::test]
    async fn test_empty_entry_survives_last_disconnect() {
        let registry = ConnectionRegistry::new(2);
        let (handle, _rx) = ConnectionHandle::new();
        let id = handle.id();

        let _ = registry.register("r1", handle).await;
        registry.unregister("r1", id).await;

        let counts = registry.room_counts().await;
        assert_eq!(counts, vec![("r1".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_snapshot_is_point_in_time_copy() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = ConnectionHandle::new();
        let (b, _rb) = ConnectionHandle::new();
        let a_id = a.id();

        let _ = registry.register("r1", a).await;
        let _ = registry.register("r1", b).await;

        let snapshot = registry.snapshot("r1").await;
        assert_eq!(snapshot.len(), 2);

        // Mutating the registry does not disturb the held snapshot.
        registry.unregister("r1", a_id).await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.count("r1").await, 1);

        assert!(registry.snapshot("absent").await.is_empty());
    }

    #[tokio::test]
    async fn test_delivery_fails_after_receiver_drop() {
        let (handle, rx) = ConnectionHandle::new();
        drop(rx);
        let err = handle
            .deliver(Message::text("{}"))
            .expect_err("send into closed lane must fail");
        assert_eq!(err.connection, handle.id());
    }

    #[tokio::test]
    async fn test_connection_ids_are_distinct() {
        let (a, _ra) = ConnectionHandle::new();
        let (b, _rb) = ConnectionHandle::new();
        assert_ne!(a.id(), b.id());
    }
}
