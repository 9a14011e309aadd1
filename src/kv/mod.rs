//! Storage engine contract.
//!
//! An [`Engine`] is a hierarchical key-value store: every [`Key`] names either
//! a directory or a leaf value. Backends build on the raw byte operations;
//! typed values and advisory locks come from [`EngineExt`], which every engine
//! gets for free.

pub mod multi;
pub mod sqlite;

use crate::core::codec::Codec;
use crate::core::error::{CairnError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

pub use multi::MultiClientEngine;
pub use sqlite::SqliteEngine;

/// Delay between attempts in [`EngineExt::acquire_lock`].
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(250);

const LOCKS_PREFIX: &str = "locks";

/// Ordered path segments addressing a directory or a leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Vec<String>);

impl Key {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Key(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Returns a new key with `segment` appended.
    pub fn join(&self, segment: impl Into<String>) -> Key {
        let mut next = self.0.clone();
        next.push(segment.into());
        Key(next)
    }

    pub fn parent(&self) -> Option<Key> {
        match self.0.split_last() {
            Some((_, rest)) if !rest.is_empty() => Some(Key(rest.to_vec())),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rejects empty keys, empty segments and segments containing `/`.
    pub fn check(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(CairnError::BadParameter("empty key".to_string()));
        }
        for seg in &self.0 {
            if seg.is_empty() {
                return Err(CairnError::BadParameter(format!("empty segment in key {self}")));
            }
            if seg.contains('/') {
                return Err(CairnError::BadParameter(format!(
                    "segment {seg:?} of key {self} contains '/'"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.join("/"))
    }
}

impl<S: AsRef<str>, const N: usize> From<[S; N]> for Key {
    fn from(parts: [S; N]) -> Self {
        Key(parts.iter().map(|s| s.as_ref().to_string()).collect())
    }
}

impl From<Vec<String>> for Key {
    fn from(parts: Vec<String>) -> Self {
        Key(parts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    Leaf,
}

/// Minimal primitive interface every storage backend implements.
///
/// A `ttl` of zero means the entry never expires.
pub trait Engine: Send + Sync {
    /// Codec used by the typed helpers in [`EngineExt`].
    fn codec(&self) -> Codec;

    /// Creates a directory, failing with `AlreadyExists` if anything lives at `key`.
    fn create_dir(&self, key: &Key, ttl: Duration) -> Result<()>;

    /// Creates a directory unless one already exists.
    fn upsert_dir(&self, key: &Key, ttl: Duration) -> Result<()>;

    /// Removes a directory and everything below it.
    fn delete_dir(&self, key: &Key) -> Result<()>;

    fn create_val_bytes(&self, key: &Key, val: &[u8], ttl: Duration) -> Result<()>;

    fn upsert_val_bytes(&self, key: &Key, val: &[u8], ttl: Duration) -> Result<()>;

    fn update_val_bytes(&self, key: &Key, val: &[u8], ttl: Duration) -> Result<()>;

    /// Atomically replaces the value at `key` if it currently equals
    /// `expected` (`None` meaning "absent"). Returns the previous value.
    fn compare_and_swap(
        &self,
        key: &Key,
        new_val: &[u8],
        expected: Option<&[u8]>,
        ttl: Duration,
    ) -> Result<Option<Vec<u8>>>;

    fn get_val_bytes(&self, key: &Key) -> Result<Vec<u8>>;

    fn delete_key(&self, key: &Key) -> Result<()>;

    /// Sorted names of the immediate children of `key`; empty if `key` is absent.
    fn get_keys(&self, key: &Key) -> Result<Vec<String>>;

    /// What lives at `key`, if anything.
    fn get_kind(&self, key: &Key) -> Result<Option<NodeKind>>;

    fn close(&self) -> Result<()>;
}

/// Typed values and advisory locks on top of any [`Engine`].
pub trait EngineExt: Engine {
    fn create_val<T: Serialize + ?Sized>(&self, key: &Key, val: &T, ttl: Duration) -> Result<()> {
        let bytes = self.codec().encode_to_bytes(val)?;
        self.create_val_bytes(key, &bytes, ttl)
    }

    fn upsert_val<T: Serialize + ?Sized>(&self, key: &Key, val: &T, ttl: Duration) -> Result<()> {
        let bytes = self.codec().encode_to_bytes(val)?;
        self.upsert_val_bytes(key, &bytes, ttl)
    }

    fn update_val<T: Serialize + ?Sized>(&self, key: &Key, val: &T, ttl: Duration) -> Result<()> {
        let bytes = self.codec().encode_to_bytes(val)?;
        self.update_val_bytes(key, &bytes, ttl)
    }

    fn get_val<T: DeserializeOwned>(&self, key: &Key) -> Result<T> {
        let bytes = self.get_val_bytes(key)?;
        self.codec().decode_from_bytes(&bytes)
    }

    /// Single attempt to take the lock named `token`.
    fn try_acquire_lock(&self, token: &str, ttl: Duration) -> Result<()> {
        let key = Key::from([LOCKS_PREFIX, token]);
        self.create_val_bytes(&key, token.as_bytes(), ttl)
            .map_err(|e| e.with_context(format!("lock {token}")))
    }

    /// Retries [`EngineExt::try_acquire_lock`] every [`LOCK_RETRY_DELAY`]
    /// until it succeeds or `deadline` passes.
    fn acquire_lock(&self, token: &str, ttl: Duration, deadline: Instant) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            match self.try_acquire_lock(token, ttl) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_already_exists() => {
                    attempts += 1;
                    if Instant::now() + LOCK_RETRY_DELAY > deadline {
                        return Err(CairnError::AlreadyExists(format!(
                            "lock {token} is held, gave up after {attempts} attempts"
                        )));
                    }
                    debug!(token, attempts, "lock busy, retrying");
                    thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn release_lock(&self, token: &str) -> Result<()> {
        self.delete_key(&Key::from([LOCKS_PREFIX, token]))
            .map_err(|e| e.with_context(format!("lock {token}")))
    }
}

impl<E: Engine + ?Sized> EngineExt for E {}
