//! Durable staging store bridging ingestion and processing.
//!
//! One RocksDB database with a column family per logical store: raw upload
//! bytes, cropped-face intermediates, the failed-task ledger, and the result
//! ledger. Writes go through the WAL with fsync so entries survive process
//! crashes; a batch write is atomic across all keys in the batch.

use std::path::{Path, PathBuf};

use rocksdb::{
    Cache, ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions,
    DB,
};
use thiserror::Error;
use tracing::info;

pub mod ledger;

/// Raw image bytes keyed by asset id.
pub const CF_RAW: &str = "staging_raw";
/// Cropped-face intermediate blobs keyed by generated face key.
pub const CF_FACE_CROPS: &str = "staging_face_crops";
/// Failed-task ledger keyed by task id.
pub const CF_FAILED_TASKS: &str = "failed_tasks";
/// Result ledger keyed by `"res_" + asset_id`.
pub const CF_RESULTS: &str = "results";

const ALL_CFS: [&str; 4] = [CF_RAW, CF_FACE_CROPS, CF_FAILED_TASKS, CF_RESULTS];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open staging store at '{path}': {message}")]
    Open { path: String, message: String },

    #[error("column family '{name}' not found")]
    ColumnFamilyNotFound { name: String },

    #[error("key '{key}' not found in '{cf}'")]
    NotFound { cf: &'static str, key: String },

    #[error("rocksdb {operation} failed on '{cf}': {source}")]
    Db {
        operation: &'static str,
        cf: &'static str,
        #[source]
        source: rocksdb::Error,
    },

    #[error("failed to decode record for key '{key}' in '{cf}': {message}")]
    Decode {
        cf: &'static str,
        key: String,
        message: String,
    },

    #[error("failed to encode record: {0}")]
    Encode(String),
}

/// Open-time knobs for the staging store.
#[derive(Debug, Clone)]
pub struct StagingConfig {
    /// Shared block cache size in bytes.
    pub block_cache_bytes: usize,
    /// Upper bound on write-ahead log size in bytes.
    pub max_wal_bytes: u64,
    pub max_open_files: i32,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            block_cache_bytes: 64 * 1024 * 1024,
            max_wal_bytes: 256 * 1024 * 1024,
            max_open_files: 500,
        }
    }
}

/// Crash-durable key→bytes store shared by every pipeline stage.
///
/// Thread-safe for concurrent readers during a writer's batch via RocksDB's
/// internal locking; writer batches serialize against each other.
pub struct StagingStore {
    db: DB,
    #[allow(dead_code)]
    cache: Cache,
    path: PathBuf,
}

impl StagingStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with_config(path, StagingConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: StagingConfig,
    ) -> Result<Self, StoreError> {
        let path_buf = path.as_ref().to_path_buf();
        let path_str = path_buf.to_string_lossy().to_string();

        let cache = Cache::new_lru_cache(config.block_cache_bytes);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_max_total_wal_size(config.max_wal_bytes);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_block_cache(&cache);
                cf_opts.set_block_based_table_factory(&block_opts);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &path_str, cf_descriptors).map_err(|e| {
            StoreError::Open {
                path: path_str.clone(),
                message: e.to_string(),
            }
        })?;

        info!(path = %path_str, "Opened staging store");

        Ok(Self {
            db,
            cache,
            path: path_buf,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound {
                name: name.to_string(),
            })
    }

    fn sync_writes() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }

    pub fn put(&self, cf: &'static str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let handle = self.cf(cf)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(handle, key.as_bytes(), value);
        self.db
            .write_opt(batch, &Self::sync_writes())
            .map_err(|e| StoreError::Db {
                operation: "put",
                cf,
                source: e,
            })
    }

    /// Write every entry in one atomic transaction: all keys become visible
    /// together, or none do.
    pub fn put_batch<'a, I>(&self, cf: &'static str, entries: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let handle = self.cf(cf)?;
        let mut batch = WriteBatch::default();
        for (key, value) in entries {
            batch.put_cf(handle, key.as_bytes(), value);
        }
        self.db
            .write_opt(batch, &Self::sync_writes())
            .map_err(|e| StoreError::Db {
                operation: "put_batch",
                cf,
                source: e,
            })
    }

    pub fn get(&self, cf: &'static str, key: &str) -> Result<Vec<u8>, StoreError> {
        let handle = self.cf(cf)?;
        self.db
            .get_cf(handle, key.as_bytes())
            .map_err(|e| StoreError::Db {
                operation: "get",
                cf,
                source: e,
            })?
            .ok_or_else(|| StoreError::NotFound {
                cf,
                key: key.to_string(),
            })
    }

    pub fn exists(&self, cf: &'static str, key: &str) -> Result<bool, StoreError> {
        let handle = self.cf(cf)?;
        Ok(self
            .db
            .get_cf(handle, key.as_bytes())
            .map_err(|e| StoreError::Db {
                operation: "exists",
                cf,
                source: e,
            })?
            .is_some())
    }

    pub fn delete(&self, cf: &'static str, key: &str) -> Result<(), StoreError> {
        let handle = self.cf(cf)?;
        self.db
            .delete_cf(handle, key.as_bytes())
            .map_err(|e| StoreError::Db {
                operation: "delete",
                cf,
                source: e,
            })
    }

    /// Scan every entry in a column family, in key order.
    pub fn scan(&self, cf: &'static str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let handle = self.cf(cf)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::Db {
                operation: "scan",
                cf,
                source: e,
            })?;
            out.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(out)
    }

    /// Delete every entry in a column family. Used by the maintenance sweep
    /// to purge flushed staging entries; never pointed at the ledgers.
    pub fn purge(&self, cf: &'static str) -> Result<u64, StoreError> {
        let handle = self.cf(cf)?;
        let mut batch = WriteBatch::default();
        let mut purged = 0u64;
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Db {
                operation: "purge",
                cf,
                source: e,
            })?;
            batch.delete_cf(handle, key);
            purged += 1;
        }
        self.db
            .write_opt(batch, &Self::sync_writes())
            .map_err(|e| StoreError::Db {
                operation: "purge",
                cf,
                source: e,
            })?;
        Ok(purged)
    }
}
