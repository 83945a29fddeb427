//! Async facade over the blocking [`RoomStore`].
//!
//! Two execution domains, joined by an explicit hand-off: session tasks live
//! on the cooperative I/O scheduler and must never block; store calls are
//! synchronous RocksDB I/O. Each call here acquires a permit from a bounded
//! semaphore, runs the store call on `spawn_blocking`, and suspends the
//! caller until it completes — one slow write cannot stall unrelated
//! connections, and at most `max_workers` store calls run at once.
//!
//! The gateway is cheap to clone (two `Arc`s). Every session holds one clone
//! for its whole lifetime as its storage handle; dropping it on any exit
//! path releases the handle.

use std::sync::Arc;

use tokio::sync::Semaphore;

use super::rocks::{RoomRecord, RoomStore, StoreError, UpdateOutcome};

/// Bounded-worker gateway to durable room storage.
#[derive(Clone)]
pub struct StorageGateway {
    store: Arc<RoomStore>,
    workers: Arc<Semaphore>,
}

impl StorageGateway {
    /// Wrap a store with a worker pool of `max_workers` concurrent calls.
    pub fn new(store: Arc<RoomStore>, max_workers: usize) -> Self {
        Self {
            store,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    /// Create a room and return its id.
    pub async fn create_room(&self) -> Result<String, StoreError> {
        self.run(|store| store.create_room()).await
    }

    /// Load a room; `None` when the id is unknown.
    pub async fn load_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        let room_id = room_id.to_string();
        self.run(move |store| store.load_room(&room_id)).await
    }

    /// Overwrite a room's buffer (last-write-wins).
    pub async fn apply_update(
        &self,
        room_id: &str,
        new_code: String,
    ) -> Result<UpdateOutcome, StoreError> {
        let room_id = room_id.to_string();
        self.run(move |store| store.apply_update(&room_id, &new_code))
            .await
    }

    /// Number of persisted rooms.
    pub async fn room_count(&self) -> Result<usize, StoreError> {
        self.run(|store| store.room_count()).await
    }

    /// Acquire a worker permit and run `op` off the I/O scheduler.
    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RoomStore) -> Result<T, StoreError> + Send + 'static,
    {
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| StoreError::WorkerFailed(e.to_string()))?;
        let store = self.store.clone();

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            op(&store)
        })
        .await
        .map_err(|e| StoreError::WorkerFailed(e.to_string()))?
    }
}
