//! RocksDB-backed persistent room store.
//!
//! Column families:
//! - `rooms`    — the full text buffer per room (LZ4 compressed)
//! - `metadata` — room metadata (bincode: timestamps, revision, sizes)
//!
//! Every accepted edit overwrites the stored buffer unconditionally
//! (last-write-wins); concurrent writers are serialized only by RocksDB's
//! single-key write atomicity. Rooms are never deleted by this layer.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

/// Column family names.
const CF_ROOMS: &str = "rooms";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_METADATA];

/// Buffer written into every freshly created room.
pub const DEFAULT_SEED: &str = "# Start coding here...";

/// How many fresh ids `create_room` tries before giving up.
const ID_ATTEMPTS: u32 = 8;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pairpad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-provided directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Durable state of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    /// Short external identifier (8 hex chars)
    pub room_id: String,
    /// The authoritative text buffer
    pub code: String,
    /// Number of accepted updates since creation
    pub revision: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last update timestamp (seconds since epoch)
    pub updated_at: u64,
}

/// Metadata row stored alongside the buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoomMetadata {
    revision: u64,
    created_at: u64,
    updated_at: u64,
    /// Uncompressed buffer size in bytes
    code_size: u64,
    /// Compressed buffer size in bytes
    compressed_size: u64,
}

impl RoomMetadata {
    fn new() -> Self {
        let now = unix_now();
        Self {
            revision: 0,
            created_at: now,
            updated_at: now,
            code_size: 0,
            compressed_size: 0,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Outcome of an `apply_update` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotFound,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Could not mint a fresh room id within the attempt budget
    IdExhausted(u32),
    /// Offloaded storage task died before completing
    WorkerFailed(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IdExhausted(n) => {
                write!(f, "Room id generation failed after {n} attempts")
            }
            StoreError::WorkerFailed(e) => write!(f, "Storage worker failed: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed room store.
///
/// All methods block; callers on the async side go through
/// [`super::StorageGateway`] instead of calling this directly.
pub struct RoomStore {
    /// RocksDB instance (multi-threaded mode — shared across worker threads)
    db: DBWithThreadMode<MultiThreaded>,
    config: StoreConfig,
}

impl RoomStore {
    /// Open the room store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Column family options: bloom filter, block cache, LZ4 at rest.
    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Create a new room seeded with [`DEFAULT_SEED`] and return its id.
    ///
    /// Ids are 8 hex chars cut from a v4 UUID. Entropy alone does not prove
    /// uniqueness at that length, so the id is checked against the store and
    /// re-minted on collision, up to [`ID_ATTEMPTS`] times.
    pub fn create_room(&self) -> Result<String, StoreError> {
        for attempt in 0..ID_ATTEMPTS {
            let room_id = short_room_id();
            if self.room_exists(&room_id)? {
                log::warn!("Room id collision on {room_id} (attempt {attempt}), re-minting");
                continue;
            }
            self.put_room(&room_id, DEFAULT_SEED, RoomMetadata::new())?;
            log::info!("Created room {room_id}");
            return Ok(room_id);
        }
        Err(StoreError::IdExhausted(ID_ATTEMPTS))
    }

    /// Load a room; `None` when the id is unknown.
    pub fn load_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        let cf_meta = self.cf(CF_METADATA)?;
        let meta = match self.db.get_cf(&cf_meta, room_id.as_bytes())? {
            Some(bytes) => RoomMetadata::decode(&bytes)?,
            None => return Ok(None),
        };

        let cf_rooms = self.cf(CF_ROOMS)?;
        let compressed = self
            .db
            .get_cf(&cf_rooms, room_id.as_bytes())?
            .ok_or_else(|| {
                StoreError::DatabaseError(format!("Room {room_id} has metadata but no buffer"))
            })?;
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let code = String::from_utf8(raw)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;

        Ok(Some(RoomRecord {
            room_id: room_id.to_string(),
            code,
            revision: meta.revision,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        }))
    }

    /// Overwrite a room's buffer unconditionally (last-write-wins).
    pub fn apply_update(
        &self,
        room_id: &str,
        new_code: &str,
    ) -> Result<UpdateOutcome, StoreError> {
        let cf_meta = self.cf(CF_METADATA)?;
        let mut meta = match self.db.get_cf(&cf_meta, room_id.as_bytes())? {
            Some(bytes) => RoomMetadata::decode(&bytes)?,
            None => return Ok(UpdateOutcome::NotFound),
        };

        meta.revision += 1;
        meta.updated_at = unix_now();
        self.put_room(room_id, new_code, meta)?;
        Ok(UpdateOutcome::Updated)
    }

    /// Check if a room exists.
    pub fn room_exists(&self, room_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, room_id.as_bytes())?.is_some())
    }

    /// List all persisted room ids.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            rooms.push(id);
        }
        Ok(rooms)
    }

    /// Number of persisted rooms.
    pub fn room_count(&self) -> Result<usize, StoreError> {
        Ok(self.list_rooms()?.len())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Atomic batch write of buffer + metadata.
    fn put_room(
        &self,
        room_id: &str,
        code: &str,
        mut meta: RoomMetadata,
    ) -> Result<(), StoreError> {
        let cf_rooms = self.cf(CF_ROOMS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(code.as_bytes());
        meta.code_size = code.len() as u64;
        meta.compressed_size = compressed.len() as u64;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_rooms, room_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, room_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

/// Seconds since the unix epoch.
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Mint a short room id: the first 8 hex chars of a v4 UUID.
fn short_room_id() -> String {
    let mut buf = Uuid::encode_buffer();
    let simple = Uuid::new_v4().as_simple().encode_lower(&mut buf);
    simple[..8].to_string()
}
