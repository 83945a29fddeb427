//! # pairpad — room synchronization engine for collaborative code editing
//!
//! Several clients jointly edit one shared text buffer per room, with
//! near-real-time propagation of edits and last-write-wins persistence.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                    ┌── SessionCoordinator (task per socket)
//!             ├── WebSocket ──────┤
//! Client B ──┘                    │   validate ── StorageGateway ── RoomStore
//!                                 │   register ── ConnectionRegistry  (RocksDB)
//!                                 │   edits ───── BroadcastDispatcher
//!                                 │                  │
//!                                 │        fan-out to N-1 peers,
//!                                 │        failed peers pruned
//!                                 └── cleanup on every exit path
//! ```
//!
//! Payloads are always the full replacement buffer, never a diff: any
//! client, however far behind, converges on the next delivered frame.
//! Blocking storage calls run on a bounded worker pool, never on the
//! connection scheduler.
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope and close reasons
//! - [`registry`] — volatile room → connection-set map, capacity-bounded
//! - [`broadcast`] — fan-out with partial-failure isolation
//! - [`session`] — per-connection state machine
//! - [`server`] — config, wiring and accept loop
//! - [`storage`] — RocksDB room store behind a bounded async gateway

pub mod broadcast;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::BroadcastDispatcher;
pub use protocol::{ClientMessage, CloseReason, ProtocolError, ServerMessage};
pub use registry::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, DeliveryError, RegisterOutcome,
};
pub use server::{ServerConfig, SyncServer};
pub use session::{SessionContext, SessionCoordinator};
pub use storage::{
    RoomRecord, RoomStore, StorageGateway, StoreConfig, StoreError, UpdateOutcome, DEFAULT_SEED,
};
