//! Multi-client engine: the embedded engine, reopened around every call.
//!
//! Holding the store open keeps an exclusive file lock for the life of the
//! process. This variant takes the lock only for the duration of a single
//! call so cooperating processes can interleave. There is no atomicity across
//! calls.

use crate::core::codec::Codec;
use crate::core::error::Result;
use crate::kv::sqlite::{SqliteEngine, SqliteOptions};
use crate::kv::{Engine, Key, NodeKind};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::trace;

pub struct MultiClientEngine {
    path: PathBuf,
    options: SqliteOptions,
}

impl MultiClientEngine {
    /// Opens once to surface configuration errors early, then releases the file.
    pub fn open(path: &Path, options: SqliteOptions) -> Result<Self> {
        let probe = SqliteEngine::open(path, options.clone())?;
        probe.close()?;
        Ok(Self {
            path: path.to_path_buf(),
            options,
        })
    }

    fn with_engine<R>(&self, op: &str, f: impl FnOnce(&SqliteEngine) -> Result<R>) -> Result<R> {
        trace!(op, path = %self.path.display(), "reopening store");
        let engine = SqliteEngine::open(&self.path, self.options.clone())?;
        let out = f(&engine);
        let closed = engine.close();
        let out = out?;
        closed?;
        Ok(out)
    }
}

impl Engine for MultiClientEngine {
    fn codec(&self) -> Codec {
        self.options.codec
    }

    fn create_dir(&self, key: &Key, ttl: Duration) -> Result<()> {
        self.with_engine("create_dir", |e| e.create_dir(key, ttl))
    }

    fn upsert_dir(&self, key: &Key, ttl: Duration) -> Result<()> {
        self.with_engine("upsert_dir", |e| e.upsert_dir(key, ttl))
    }

    fn delete_dir(&self, key: &Key) -> Result<()> {
        self.with_engine("delete_dir", |e| e.delete_dir(key))
    }

    fn create_val_bytes(&self, key: &Key, val: &[u8], ttl: Duration) -> Result<()> {
        self.with_engine("create_val", |e| e.create_val_bytes(key, val, ttl))
    }

    fn upsert_val_bytes(&self, key: &Key, val: &[u8], ttl: Duration) -> Result<()> {
        self.with_engine("upsert_val", |e| e.upsert_val_bytes(key, val, ttl))
    }

    fn update_val_bytes(&self, key: &Key, val: &[u8], ttl: Duration) -> Result<()> {
        self.with_engine("update_val", |e| e.update_val_bytes(key, val, ttl))
    }

    fn compare_and_swap(
        &self,
        key: &Key,
        new_val: &[u8],
        expected: Option<&[u8]>,
        ttl: Duration,
    ) -> Result<Option<Vec<u8>>> {
        self.with_engine("compare_and_swap", |e| {
            e.compare_and_swap(key, new_val, expected, ttl)
        })
    }

    fn get_val_bytes(&self, key: &Key) -> Result<Vec<u8>> {
        self.with_engine("get_val", |e| e.get_val_bytes(key))
    }

    fn delete_key(&self, key: &Key) -> Result<()> {
        self.with_engine("delete_key", |e| e.delete_key(key))
    }

    fn get_keys(&self, key: &Key) -> Result<Vec<String>> {
        self.with_engine("get_keys", |e| e.get_keys(key))
    }

    fn get_kind(&self, key: &Key) -> Result<Option<NodeKind>> {
        self.with_engine("get_kind", |e| e.get_kind(key))
    }

    /// Nothing stays open between calls.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}
