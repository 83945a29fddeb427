//! Room sync server: configuration, component wiring, accept loop.
//!
//! The server owns the process-wide [`ConnectionRegistry`] and the storage
//! stack, and hands every accepted socket to a spawned session task. The
//! HTTP collaborators that live outside this crate (room creation endpoint,
//! diagnostics) reach the engine through [`SyncServer::storage`] and
//! [`SyncServer::registry`].

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::broadcast::BroadcastDispatcher;
use crate::registry::ConnectionRegistry;
use crate::session::{run_session, SessionContext};
use crate::storage::{RoomStore, StorageGateway, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum live connections per room
    pub max_connections_per_room: usize,
    /// Durable storage directory
    pub storage_path: PathBuf,
    /// Maximum concurrent blocking storage calls
    pub storage_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_connections_per_room: 2,
            storage_path: PathBuf::from("pairpad_data"),
            storage_workers: 4,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden from the environment.
    ///
    /// `MAX_CONNECTIONS_PER_ROOM` bounds room membership; `PAIRPAD_BIND_ADDR`
    /// and `PAIRPAD_DATA_DIR` relocate the listener and the store. Unparsable
    /// values fall back to the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("MAX_CONNECTIONS_PER_ROOM") {
            match raw.parse() {
                Ok(n) => config.max_connections_per_room = n,
                Err(_) => log::warn!("Ignoring unparsable MAX_CONNECTIONS_PER_ROOM={raw}"),
            }
        }
        if let Ok(addr) = std::env::var("PAIRPAD_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(dir) = std::env::var("PAIRPAD_DATA_DIR") {
            config.storage_path = PathBuf::from(dir);
        }
        config
    }
}

/// The room synchronization server.
pub struct SyncServer {
    config: ServerConfig,
    ctx: SessionContext,
}

impl SyncServer {
    /// Open the store and wire up the registry, dispatcher and gateway.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = Arc::new(RoomStore::open(StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        })?);
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections_per_room));
        let ctx = SessionContext {
            dispatcher: BroadcastDispatcher::new(registry.clone()),
            storage: StorageGateway::new(store, config.storage_workers),
            registry,
        };
        Ok(Self { config, ctx })
    }

    /// Gateway handle for storage-side collaborators (room creation).
    pub fn storage(&self) -> StorageGateway {
        self.ctx.storage.clone()
    }

    /// Registry handle for read-only introspection (per-room counts).
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.ctx.registry.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener (test seam).
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let persisted = self.ctx.storage.room_count().await?;
        log::info!(
            "Sync server listening on {} ({persisted} persisted rooms, capacity {}/room)",
            listener.local_addr()?,
            self.ctx.registry.capacity()
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            let _ = tokio::spawn(async move {
                if let Err(e) = run_session(stream, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_connections_per_room, 2);
        assert_eq!(config.storage_workers, 4);
    }

    #[test]
    fn test_server_config_from_env_capacity() {
        std::env::set_var("MAX_CONNECTIONS_PER_ROOM", "5");
        let config = ServerConfig::from_env();
        assert_eq!(config.max_connections_per_room, 5);

        std::env::set_var("MAX_CONNECTIONS_PER_ROOM", "not a number");
        let config = ServerConfig::from_env();
        assert_eq!(config.max_connections_per_room, 2);
        std::env::remove_var("MAX_CONNECTIONS_PER_ROOM");
    }

    #[tokio::test]
    async fn test_server_wiring() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: dir.path().join("db"),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();

        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.registry().capacity(), 2);

        // Collaborator seam: create a room through the exposed gateway.
        let room_id = server.storage().create_room().await.unwrap();
        assert!(server.storage().load_room(&room_id).await.unwrap().is_some());
        assert_eq!(server.registry().count(&room_id).await, 0);
    }
}
