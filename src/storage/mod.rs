//! Durable room storage.
//!
//! ```text
//! ┌──────────────────┐   async call    ┌────────────────┐  spawn_blocking  ┌────────────┐
//! │ SessionCoordinator│ ─────────────► │ StorageGateway │ ───────────────► │ RoomStore  │
//! │ (I/O scheduler)   │                │ (bounded pool) │                  │ (RocksDB)  │
//! └──────────────────┘                 └────────────────┘                  └────────────┘
//! ```
//!
//! [`RoomStore`] is the blocking core: RocksDB with two column families,
//! LZ4-compressed buffers and bincode metadata. [`StorageGateway`] is the
//! async facade every session talks to; it keeps blocking calls off the I/O
//! scheduler by running them on a semaphore-bounded worker pool.

pub mod gateway;
pub mod rocks;

pub use gateway::StorageGateway;
pub use rocks::{RoomRecord, RoomStore, StoreConfig, StoreError, UpdateOutcome, DEFAULT_SEED};
