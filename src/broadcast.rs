//! Fan-out of full-buffer updates to a room's peers.
//!
//! One broadcast delivers a [`ServerMessage`] to every member of a room
//! except the originating connection. Deliveries are independent: a dead
//! member never aborts the pass, and every member whose delivery failed is
//! pruned from the registry once the pass completes. No ordering is
//! guaranteed across connections; per connection the outbound lane is FIFO.

use std::sync::Arc;

use crate::protocol::{ProtocolError, ServerMessage};
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Room-scoped fan-out over the shared [`ConnectionRegistry`].
#[derive(Clone)]
pub struct BroadcastDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `message` to every member of `room_id` except `excluding`.
    ///
    /// The frame is encoded once and cloned per member. Returns how many
    /// members the frame was handed to.
    pub async fn broadcast(
        &self,
        room_id: &str,
        message: &ServerMessage,
        excluding: ConnectionId,
    ) -> Result<usize, ProtocolError> {
        let frame = message.to_frame()?;
        let members = self.registry.snapshot(room_id).await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for handle in &members {
            if handle.id() == excluding {
                continue;
            }
            match handle.deliver(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Dropping dead member of room {room_id}: {e}");
                    failed.push(handle.id());
                }
            }
        }

        for id in failed {
            self.registry.unregister(room_id, id).await;
        }

        Ok(delivered)
    }
}
