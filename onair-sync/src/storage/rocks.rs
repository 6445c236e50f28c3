//! RocksDB-backed authoritative store for rundowns and their clocks.
//!
//! Column families:
//! - `rundowns`: full rundown documents (bincode, LZ4 compressed)
//! - `timers`  : one [`TimerRecord`] per room
//! - `metadata`: [`RundownMetadata`] per rundown (version, sizes, timestamps)
//!
//! All keys are the 16 raw bytes of the rundown id. Writes that touch more
//! than one column family go through a single `WriteBatch`.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use uuid::Uuid;

use onair_core::{normalize_status, Cursor, Rundown, RundownSummary};

use crate::bootstrap::{BootstrapError, DocumentSource, SnapshotSource};
use crate::protocol::{RoomEvent, TimerSnapshot, TimerUpdate};

const CF_RUNDOWNS: &str = "rundowns";
const CF_TIMERS: &str = "timers";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_RUNDOWNS, CF_TIMERS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("onair_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each rundown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RundownMetadata {
    pub rundown_id: Uuid,
    /// Incremented on every structural or status write
    pub version: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl RundownMetadata {
    fn new(rundown_id: Uuid) -> Self {
        let now = unix_secs();
        Self {
            rundown_id,
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Authoritative clock of one room.
///
/// While running, the live value is `elapsed_base` plus the whole seconds
/// since `started_at_ms`, so a late joiner gets the current time rather than
/// the last broadcast one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimerRecord {
    pub is_running: bool,
    pub elapsed_base: u64,
    /// Unix milliseconds at which `elapsed_base` was taken
    pub started_at_ms: u64,
    pub cursor: Cursor,
}

impl TimerRecord {
    pub fn elapsed_at(&self, now_ms: u64) -> u64 {
        if self.is_running {
            self.elapsed_base
                .saturating_add(now_ms.saturating_sub(self.started_at_ms) / 1000)
        } else {
            self.elapsed_base
        }
    }

    pub fn snapshot(&self, now_ms: u64) -> TimerSnapshot {
        TimerSnapshot {
            is_running: self.is_running,
            time_elapsed: self.elapsed_at(now_ms),
            cursor: self.cursor,
        }
    }

    /// Fold in a timer.update. Missing time keeps the live value.
    pub fn apply_timer(&mut self, update: &TimerUpdate, now_ms: u64) {
        let time = update.time_elapsed.unwrap_or_else(|| self.elapsed_at(now_ms));
        self.is_running = update.is_running;
        self.elapsed_base = time;
        self.started_at_ms = now_ms;
        if let Some(cursor) = update.cursor {
            self.cursor = cursor;
        }
    }

    /// Fold in a cursor.update; `prefix_sum` supplies the time when the
    /// event carries none.
    pub fn apply_cursor(&mut self, cursor: Cursor, time_elapsed: Option<u64>, prefix_sum: u64, now_ms: u64) {
        self.cursor = cursor;
        self.elapsed_base = if cursor.is_origin() && time_elapsed.unwrap_or(0) == 0 {
            0
        } else {
            time_elapsed.unwrap_or(prefix_sum)
        };
        self.started_at_ms = now_ms;
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    DatabaseError(String),
    NotFound(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Rundown not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}

impl From<StoreError> for BootstrapError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => BootstrapError::NotFound(id),
            other => BootstrapError::Unavailable(other.to_string()),
        }
    }
}

/// RocksDB-backed rundown store, shared by the relay across connections.
pub struct RundownStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write of a stored rundown.
    write_lock: Mutex<()>,
}

impl RundownStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened rundown store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Already LZ4 compressed by us.
            CF_RUNDOWNS => opts.set_compression_type(DBCompressionType::None),
            // Tiny values rewritten every few seconds while a clock runs.
            CF_TIMERS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }
        opts
    }

    // ─── Rundowns ─────────────────────────────────────────────────────

    /// Save a whole rundown (LZ4 compressed) and bump its version.
    pub fn save_rundown(&self, rundown: &Rundown) -> Result<RundownMetadata, StoreError> {
        let cf_rundowns = self.cf(CF_RUNDOWNS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = encode(rundown)?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .load_metadata(rundown.id)
            .unwrap_or_else(|_| RundownMetadata::new(rundown.id));
        meta.version += 1;
        meta.snapshot_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_secs();

        let key = rundown.id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_rundowns, key, &compressed);
        batch.put_cf(&cf_meta, key, encode(&meta)?);
        self.write(batch)?;

        Ok(meta)
    }

    pub fn load_rundown(&self, id: Uuid) -> Result<Rundown, StoreError> {
        let cf = self.cf(CF_RUNDOWNS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                decode(&bytes)
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    pub fn rundown_exists(&self, id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, id.as_bytes())?.is_some())
    }

    pub fn load_metadata(&self, id: Uuid) -> Result<RundownMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Ids of every stored rundown.
    pub fn list_rundowns(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }

    /// List-view entries for every stored rundown.
    pub fn summaries(&self) -> Result<Vec<RundownSummary>, StoreError> {
        self.list_rundowns()?
            .into_iter()
            .map(|id| self.load_rundown(id).map(|r| r.summary()))
            .collect()
    }

    /// Remove a rundown together with its clock and metadata.
    pub fn delete_rundown(&self, id: Uuid) -> Result<(), StoreError> {
        let key = id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_RUNDOWNS)?, key);
        batch.delete_cf(&self.cf(CF_TIMERS)?, key);
        batch.delete_cf(&self.cf(CF_METADATA)?, key);
        self.write(batch)
    }

    // ─── Timers ───────────────────────────────────────────────────────

    pub fn save_timer(&self, room: Uuid, record: &TimerRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_TIMERS)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(&cf, room.as_bytes(), encode(record)?, &write_opts)?;
        Ok(())
    }

    pub fn load_timer(&self, room: Uuid) -> Result<TimerRecord, StoreError> {
        let cf = self.cf(CF_TIMERS)?;
        match self.db.get_cf(&cf, room.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(room)),
        }
    }

    /// Live clock of `room`. A room that never ran reads as stopped.
    pub fn timer_snapshot(&self, room: Uuid, now_ms: u64) -> Result<TimerSnapshot, StoreError> {
        match self.load_timer(room) {
            Ok(record) => Ok(record.snapshot(now_ms)),
            Err(StoreError::NotFound(_)) => Ok(TimerSnapshot::stopped()),
            Err(e) => Err(e),
        }
    }

    // ─── Event persistence ────────────────────────────────────────────

    /// Fold a relayed room event into the stored state, last writer wins.
    pub fn apply_event(&self, event: &RoomEvent, now_ms: u64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let room = event.room();
        match event {
            RoomEvent::Timer { update, .. } => {
                let mut record = self.load_timer(room).unwrap_or_default();
                record.apply_timer(update, now_ms);
                self.save_timer(room, &record)
            }
            RoomEvent::Cursor {
                cursor,
                time_elapsed,
                ..
            } => {
                let prefix_sum = self.load_rundown(room).map_or(0, |r| r.prefix_sum(*cursor));
                let mut record = self.load_timer(room).unwrap_or_default();
                record.apply_cursor(*cursor, *time_elapsed, prefix_sum, now_ms);
                self.save_timer(room, &record)
            }
            RoomEvent::StructureReplace { items, .. } => {
                let mut rundown = self.load_rundown(room)?;
                rundown.items = items.clone();
                self.save_rundown(&rundown).map(|_| ())
            }
            RoomEvent::FolderReorder { new_order, .. } => {
                let mut rundown = self.load_rundown(room)?;
                rundown.items = new_order.clone();
                self.save_rundown(&rundown).map(|_| ())
            }
            RoomEvent::ItemReorder {
                folder_index,
                new_order,
                ..
            } => {
                let mut rundown = self.load_rundown(room)?;
                match rundown.items.get_mut(*folder_index) {
                    Some(folder) => folder.children = new_order.clone(),
                    None => {
                        log::warn!("Not persisting reorder of missing folder {folder_index} in {room}");
                        return Ok(());
                    }
                }
                self.save_rundown(&rundown).map(|_| ())
            }
            RoomEvent::Status { status, .. } => {
                let mut rundown = self.load_rundown(room)?;
                rundown.status = normalize_status(status);
                self.save_rundown(&rundown).map(|_| ())
            }
        }
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

impl SnapshotSource for RundownStore {
    async fn fetch_snapshot(&self, room: Uuid) -> Result<TimerSnapshot, BootstrapError> {
        Ok(self.timer_snapshot(room, unix_millis())?)
    }
}

impl DocumentSource for RundownStore {
    async fn load_document(&self, room: Uuid) -> Result<Rundown, BootstrapError> {
        Ok(self.load_rundown(room)?)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Wall clock in Unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use onair_core::{Folder, Item, STATUS_LIVE};
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RundownStore) {
        let dir = TempDir::new().unwrap();
        let store = RundownStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn sample() -> Rundown {
        Rundown::with_id(
            Uuid::new_v4(),
            "Evening News",
            vec![
                Folder::with_items("Opening", vec![Item::new("Intro", 60), Item::new("Headlines", 30)]),
                Folder::with_items("Block 2", vec![Item::new("Report", 120)]),
            ],
        )
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert!(store.list_rundowns().unwrap().is_empty());
    }

    #[test]
    fn test_rundown_save_load() {
        let (_dir, store) = open_temp();
        let rundown = sample();

        let meta = store.save_rundown(&rundown).unwrap();
        assert_eq!(meta.rundown_id, rundown.id);
        assert_eq!(meta.version, 1);
        assert!(meta.compressed_size > 0);

        assert_eq!(store.load_rundown(rundown.id).unwrap(), rundown);
        assert!(store.rundown_exists(rundown.id).unwrap());
        assert_eq!(store.save_rundown(&rundown).unwrap().version, 2);
    }

    #[test]
    fn test_rundown_not_found() {
        let (_dir, store) = open_temp();
        let id = Uuid::new_v4();
        assert!(matches!(store.load_rundown(id), Err(StoreError::NotFound(x)) if x == id));
        assert!(!store.rundown_exists(id).unwrap());
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, store) = open_temp();
        let a = sample();
        let b = Rundown::new("Late Show");
        store.save_rundown(&a).unwrap();
        store.save_rundown(&b).unwrap();
        store.save_timer(a.id, &TimerRecord::default()).unwrap();

        let ids = store.list_rundowns().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(store.summaries().unwrap().len(), 2);

        store.delete_rundown(a.id).unwrap();
        assert_eq!(store.list_rundowns().unwrap(), vec![b.id]);
        assert!(store.load_timer(a.id).is_err());
    }

    #[test]
    fn test_timer_record_live_elapsed() {
        let record = TimerRecord {
            is_running: true,
            elapsed_base: 60,
            started_at_ms: 1_000,
            cursor: Cursor::new(0, 1),
        };
        assert_eq!(record.elapsed_at(1_000), 60);
        assert_eq!(record.elapsed_at(16_999), 75);
        assert_eq!(record.snapshot(16_000).time_elapsed, 75);

        let paused = TimerRecord {
            is_running: false,
            ..record
        };
        assert_eq!(paused.elapsed_at(99_000), 60);
    }

    #[test]
    fn test_timer_record_saturates() {
        let record = TimerRecord {
            is_running: true,
            elapsed_base: u64::MAX - 1,
            started_at_ms: 0,
            cursor: Cursor::ORIGIN,
        };
        assert_eq!(record.elapsed_at(10_000), u64::MAX);
        assert_eq!(record.snapshot(10_000).time_elapsed, u64::MAX);
    }

    #[test]
    fn test_unknown_room_snapshot_is_stopped() {
        let (_dir, store) = open_temp();
        let snapshot = store.timer_snapshot(Uuid::new_v4(), 0).unwrap();
        assert_eq!(snapshot, TimerSnapshot::stopped());
    }

    #[test]
    fn test_apply_timer_and_cursor_events() {
        let (_dir, store) = open_temp();
        let rundown = sample();
        store.save_rundown(&rundown).unwrap();
        let room = rundown.id;

        store
            .apply_event(
                &RoomEvent::Timer {
                    room,
                    update: TimerUpdate {
                        is_running: true,
                        time_elapsed: Some(10),
                        cursor: Some(Cursor::ORIGIN),
                    },
                },
                5_000,
            )
            .unwrap();
        assert_eq!(store.timer_snapshot(room, 8_000).unwrap().time_elapsed, 13);

        store
            .apply_event(
                &RoomEvent::Cursor {
                    room,
                    cursor: Cursor::new(1, 0),
                    time_elapsed: None,
                },
                9_000,
            )
            .unwrap();
        let snapshot = store.timer_snapshot(room, 9_000).unwrap();
        assert_eq!(snapshot.cursor, Cursor::new(1, 0));
        assert_eq!(snapshot.time_elapsed, 90);
        assert!(snapshot.is_running);

        store
            .apply_event(
                &RoomEvent::Cursor {
                    room,
                    cursor: Cursor::ORIGIN,
                    time_elapsed: None,
                },
                9_000,
            )
            .unwrap();
        assert_eq!(store.timer_snapshot(room, 9_000).unwrap().time_elapsed, 0);
    }

    #[test]
    fn test_apply_structural_and_status_events() {
        let (_dir, store) = open_temp();
        let rundown = sample();
        store.save_rundown(&rundown).unwrap();
        let room = rundown.id;

        let reversed: Vec<Item> = rundown.items[0].children.iter().rev().cloned().collect();
        store
            .apply_event(
                &RoomEvent::ItemReorder {
                    room,
                    folder_index: 0,
                    new_order: reversed.clone(),
                },
                0,
            )
            .unwrap();
        store
            .apply_event(
                &RoomEvent::Status {
                    room,
                    status: "aovivo".into(),
                },
                0,
            )
            .unwrap();

        let stored = store.load_rundown(room).unwrap();
        assert_eq!(stored.items[0].children, reversed);
        assert_eq!(stored.status, STATUS_LIVE);
        assert_eq!(store.load_metadata(room).unwrap().version, 3);

        // Missing folder is skipped, not an error.
        store
            .apply_event(
                &RoomEvent::ItemReorder {
                    room,
                    folder_index: 7,
                    new_order: Vec::new(),
                },
                0,
            )
            .unwrap();
    }

    #[test]
    fn test_structure_for_unknown_rundown_fails() {
        let (_dir, store) = open_temp();
        let result = store.apply_event(
            &RoomEvent::StructureReplace {
                room: Uuid::new_v4(),
                items: Vec::new(),
            },
            0,
        );
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_store_error_display() {
        let id = Uuid::nil();
        assert_eq!(
            StoreError::NotFound(id).to_string(),
            format!("Rundown not found: {id}")
        );
        assert!(matches!(
            BootstrapError::from(StoreError::NotFound(id)),
            BootstrapError::NotFound(_)
        ));
    }
}
