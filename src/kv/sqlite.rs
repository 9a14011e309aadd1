//! Embedded single-writer engine on SQLite.
//!
//! The bucket hierarchy lives in one table: a row per directory or leaf,
//! addressed by its parent path and its own segment name. The connection runs
//! in `locking_mode=EXCLUSIVE`, so once opened the file is owned by this
//! process until [`Engine::close`].

use crate::core::codec::Codec;
use crate::core::config::{BackendConfig, OpenTimeout};
use crate::core::error::{CairnError, Result};
use crate::core::time::{Clock, SystemClock, expires_at_nanos};
use crate::kv::{Engine, Key, NodeKind};
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior, ffi, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS nodes (
    parent TEXT NOT NULL,
    name TEXT NOT NULL,
    is_dir INTEGER NOT NULL,
    value BLOB,
    expires_at INTEGER,
    PRIMARY KEY (parent, name)
) WITHOUT ROWID";

/// Memory-mapped I/O window; filesystems that cannot map fail the open.
const MMAP_SIZE: i64 = 256 * 1024 * 1024;

/// Extended result codes raised when the filesystem cannot back mmap/shm.
const MMAP_ERRORS: [i32; 4] = [
    ffi::SQLITE_IOERR_MMAP,
    ffi::SQLITE_IOERR_SHMMAP,
    ffi::SQLITE_IOERR_SHMOPEN,
    ffi::SQLITE_IOERR_SHMSIZE,
];

#[derive(Clone)]
pub struct SqliteOptions {
    pub read_only: bool,
    pub timeout: OpenTimeout,
    pub codec: Codec,
    pub clock: Arc<dyn Clock>,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            timeout: OpenTimeout::Default,
            codec: Codec::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl SqliteOptions {
    pub fn from_config(config: &BackendConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            read_only: config.read_only,
            timeout: config.open_timeout(),
            codec: config.codec(),
            clock,
        }
    }
}

struct Node {
    is_dir: bool,
    value: Option<Vec<u8>>,
}

impl Node {
    fn kind(&self) -> NodeKind {
        if self.is_dir { NodeKind::Dir } else { NodeKind::Leaf }
    }
}

pub struct SqliteEngine {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
    options: SqliteOptions,
}

impl SqliteEngine {
    pub fn open(path: &Path, options: SqliteOptions) -> Result<Self> {
        if options.read_only && !path.exists() {
            // SQLite refuses to create a file it was asked to open read-only.
            debug!(path = %path.display(), "initializing empty store before read-only open");
            let conn = connect(path, false, options.timeout)?;
            drop(conn);
        }
        let conn = connect(path, options.read_only, options.timeout)?;
        info!(
            path = %path.display(),
            read_only = options.read_only,
            "opened store"
        );
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: path.to_path_buf(),
            options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| CairnError::Storage("store connection lock poisoned".to_string()))?;
        if guard.is_none() {
            return Err(CairnError::ConnectionProblem(format!(
                "store {} is closed",
                self.path.display()
            )));
        }
        Ok(guard)
    }

    fn now(&self) -> i64 {
        self.options.clock.now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    fn expires(&self, ttl: Duration) -> Option<i64> {
        expires_at_nanos(self.options.clock.now(), ttl)
    }

    fn read<R>(&self, f: impl FnOnce(&Connection, i64) -> Result<R>) -> Result<R> {
        let mut guard = self.conn()?;
        let conn = guard.as_mut().ok_or_else(|| closed(&self.path))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(translate)?;
        let out = f(&tx, self.now())?;
        tx.commit().map_err(translate)?;
        Ok(out)
    }

    /// Runs `f` in an immediate transaction; any error rolls everything back.
    fn write<R>(&self, f: impl FnOnce(&Connection, i64) -> Result<R>) -> Result<R> {
        if self.options.read_only {
            return Err(CairnError::BadParameter(format!(
                "store {} is opened read-only",
                self.path.display()
            )));
        }
        let mut guard = self.conn()?;
        let conn = guard.as_mut().ok_or_else(|| closed(&self.path))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(translate)?;
        let out = f(&tx, self.now())?;
        tx.commit().map_err(translate)?;
        Ok(out)
    }

    fn put_leaf(&self, key: &Key, val: &[u8], ttl: Duration, mode: PutMode) -> Result<()> {
        key.check()?;
        let expires = self.expires(ttl);
        self.write(|conn, now| {
            ensure_parents(conn, key, now)?;
            let (parent, name) = split(key);
            purge_if_expired(conn, &parent, &name, now)?;
            match (lookup(conn, &parent, &name, now)?, mode) {
                (Some(node), _) if node.is_dir => Err(is_dir(key)),
                (Some(_), PutMode::Create) => Err(CairnError::AlreadyExists(key.to_string())),
                (None, PutMode::Update) => Err(CairnError::NotFound(key.to_string())),
                _ => store_leaf(conn, &parent, &name, val, expires),
            }
        })
    }
}

#[derive(Clone, Copy)]
enum PutMode {
    Create,
    Upsert,
    Update,
}

impl Engine for SqliteEngine {
    fn codec(&self) -> Codec {
        self.options.codec
    }

    fn create_dir(&self, key: &Key, ttl: Duration) -> Result<()> {
        key.check()?;
        let expires = self.expires(ttl);
        self.write(|conn, now| {
            ensure_parents(conn, key, now)?;
            let (parent, name) = split(key);
            purge_if_expired(conn, &parent, &name, now)?;
            if lookup(conn, &parent, &name, now)?.is_some() {
                return Err(CairnError::AlreadyExists(key.to_string()));
            }
            store_dir(conn, &parent, &name, expires)
        })
    }

    fn upsert_dir(&self, key: &Key, ttl: Duration) -> Result<()> {
        key.check()?;
        let expires = self.expires(ttl);
        self.write(|conn, now| {
            ensure_parents(conn, key, now)?;
            let (parent, name) = split(key);
            purge_if_expired(conn, &parent, &name, now)?;
            match lookup(conn, &parent, &name, now)? {
                Some(node) if node.is_dir => Ok(()),
                Some(_) => Err(CairnError::BadParameter(format!("{key} is a value, not a directory"))),
                None => store_dir(conn, &parent, &name, expires),
            }
        })
    }

    fn delete_dir(&self, key: &Key) -> Result<()> {
        key.check()?;
        self.write(|conn, now| {
            let (parent, name) = split(key);
            match lookup(conn, &parent, &name, now)? {
                None => Err(CairnError::NotFound(key.to_string())),
                Some(node) if !node.is_dir => {
                    Err(CairnError::BadParameter(format!("{key} is a value, not a directory")))
                }
                Some(_) => remove(conn, &parent, &name),
            }
        })
    }

    fn create_val_bytes(&self, key: &Key, val: &[u8], ttl: Duration) -> Result<()> {
        self.put_leaf(key, val, ttl, PutMode::Create)
    }

    fn upsert_val_bytes(&self, key: &Key, val: &[u8], ttl: Duration) -> Result<()> {
        self.put_leaf(key, val, ttl, PutMode::Upsert)
    }

    fn update_val_bytes(&self, key: &Key, val: &[u8], ttl: Duration) -> Result<()> {
        self.put_leaf(key, val, ttl, PutMode::Update)
    }

    fn compare_and_swap(
        &self,
        key: &Key,
        new_val: &[u8],
        expected: Option<&[u8]>,
        ttl: Duration,
    ) -> Result<Option<Vec<u8>>> {
        key.check()?;
        let expires = self.expires(ttl);
        self.write(|conn, now| {
            ensure_parents(conn, key, now)?;
            let (parent, name) = split(key);
            purge_if_expired(conn, &parent, &name, now)?;
            let current = lookup(conn, &parent, &name, now)?;
            if current.as_ref().is_some_and(|n| n.is_dir) {
                return Err(is_dir(key));
            }
            let prev = current.map(|n| n.value.unwrap_or_default());
            match (prev, expected) {
                (None, None) => {
                    store_leaf(conn, &parent, &name, new_val, expires)?;
                    Ok(None)
                }
                (Some(_), None) => Err(CairnError::AlreadyExists(key.to_string())),
                (None, Some(_)) => Err(CairnError::NotFound(key.to_string())),
                (Some(prev), Some(exp)) if prev.as_slice() == exp => {
                    store_leaf(conn, &parent, &name, new_val, expires)?;
                    Ok(Some(prev))
                }
                (Some(_), Some(_)) => Err(CairnError::CompareFailed(format!(
                    "{key} does not hold the expected value"
                ))),
            }
        })
    }

    fn get_val_bytes(&self, key: &Key) -> Result<Vec<u8>> {
        key.check()?;
        self.read(|conn, now| {
            let (parent, name) = split(key);
            match lookup(conn, &parent, &name, now)? {
                None => Err(CairnError::NotFound(key.to_string())),
                Some(node) if node.is_dir => Err(is_dir(key)),
                Some(node) => Ok(node.value.unwrap_or_default()),
            }
        })
    }

    fn delete_key(&self, key: &Key) -> Result<()> {
        key.check()?;
        self.write(|conn, now| {
            let (parent, name) = split(key);
            match lookup(conn, &parent, &name, now)? {
                None => Err(CairnError::NotFound(key.to_string())),
                Some(node) if node.is_dir => Err(is_dir(key)),
                Some(_) => remove(conn, &parent, &name),
            }
        })
    }

    fn get_keys(&self, key: &Key) -> Result<Vec<String>> {
        if !key.is_empty() {
            key.check()?;
        }
        self.read(|conn, now| {
            let dir_path = if key.is_empty() {
                String::new()
            } else {
                let (parent, name) = split(key);
                match lookup(conn, &parent, &name, now)? {
                    Some(node) if node.is_dir => key.to_string(),
                    _ => return Ok(Vec::new()),
                }
            };
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM nodes
                     WHERE parent = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                     ORDER BY name",
                )
                .map_err(translate)?;
            let rows = stmt
                .query_map(params![dir_path, now], |row| row.get::<_, String>(0))
                .map_err(translate)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(translate)?);
            }
            Ok(out)
        })
    }

    fn get_kind(&self, key: &Key) -> Result<Option<NodeKind>> {
        key.check()?;
        self.read(|conn, now| {
            let (parent, name) = split(key);
            Ok(lookup(conn, &parent, &name, now)?.map(|n| n.kind()))
        })
    }

    fn close(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| CairnError::Storage("store connection lock poisoned".to_string()))?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| translate(e))?;
            debug!(path = %self.path.display(), "closed store");
        }
        Ok(())
    }
}

fn connect(path: &Path, read_only: bool, timeout: OpenTimeout) -> Result<Connection> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
    };
    let conn = Connection::open_with_flags(path, flags).map_err(|e| open_error(e, path, timeout))?;
    conn.busy_timeout(timeout.duration())
        .map_err(|e| open_error(e, path, timeout))?;
    conn.pragma_update(None, "mmap_size", MMAP_SIZE)
        .map_err(|e| open_error(e, path, timeout))?;
    if read_only {
        return Ok(conn);
    }
    conn.query_row("PRAGMA locking_mode=EXCLUSIVE;", [], |_| Ok(()))
        .map_err(|e| open_error(e, path, timeout))?;
    // BEGIN EXCLUSIVE takes the file lock now; exclusive locking mode keeps it.
    conn.execute_batch(&format!("BEGIN EXCLUSIVE; {SCHEMA}; COMMIT;"))
        .map_err(|e| open_error(e, path, timeout))?;
    Ok(conn)
}

fn open_error(err: rusqlite::Error, path: &Path, timeout: OpenTimeout) -> CairnError {
    match translate(err) {
        CairnError::ConnectionProblem(msg) => CairnError::ConnectionProblem(format!(
            "timed out after {:?} waiting for the lock on {}: another instance may be holding it ({msg})",
            timeout.duration(),
            path.display()
        )),
        other => other.with_context(format!("failed to open {}", path.display())),
    }
}

/// Maps native SQLite failures onto the shared error kinds.
fn translate(err: rusqlite::Error) -> CairnError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _) => {
            if MMAP_ERRORS.contains(&code.extended_code) {
                return CairnError::UnsupportedFilesystem(format!(
                    "the filesystem does not support memory-mapped files: {err}"
                ));
            }
            match code.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    CairnError::ConnectionProblem(err.to_string())
                }
                ErrorCode::ReadOnly => CairnError::BadParameter(err.to_string()),
                _ => CairnError::Storage(err.to_string()),
            }
        }
        _ => CairnError::Storage(err.to_string()),
    }
}

fn closed(path: &Path) -> CairnError {
    CairnError::ConnectionProblem(format!("store {} is closed", path.display()))
}

fn is_dir(key: &Key) -> CairnError {
    CairnError::BadParameter(format!("{key} is a directory, not a value"))
}

/// Parent path (`""` at the top level) and own name of `key`.
fn split(key: &Key) -> (String, String) {
    let name = key.name().unwrap_or_default().to_string();
    let parent = key.parent().map(|p| p.to_string()).unwrap_or_default();
    (parent, name)
}

fn lookup(conn: &Connection, parent: &str, name: &str, now: i64) -> Result<Option<Node>> {
    let row = conn
        .query_row(
            "SELECT is_dir, value, expires_at FROM nodes WHERE parent = ?1 AND name = ?2",
            params![parent, name],
            |row| {
                Ok((
                    row.get::<_, bool>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            },
        )
        .optional()
        .map_err(translate)?;
    let Some((is_dir, value, expires_at)) = row else {
        return Ok(None);
    };
    if expires_at.is_some_and(|at| at <= now) || ancestor_expired(conn, parent, now)? {
        return Ok(None);
    }
    Ok(Some(Node { is_dir, value }))
}

/// Whether any directory along the path `parent` has expired.
fn ancestor_expired(conn: &Connection, parent: &str, now: i64) -> Result<bool> {
    let mut dir = String::new();
    for seg in parent.split('/').filter(|s| !s.is_empty()) {
        let expired: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM nodes WHERE parent = ?1 AND name = ?2
                 AND expires_at IS NOT NULL AND expires_at <= ?3",
                params![dir, seg, now],
                |row| row.get(0),
            )
            .optional()
            .map_err(translate)?;
        if expired.is_some() {
            return Ok(true);
        }
        dir.push('/');
        dir.push_str(seg);
    }
    Ok(false)
}

fn purge_if_expired(conn: &Connection, parent: &str, name: &str, now: i64) -> Result<()> {
    let expired: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM nodes WHERE parent = ?1 AND name = ?2
             AND expires_at IS NOT NULL AND expires_at <= ?3",
            params![parent, name, now],
            |row| row.get(0),
        )
        .optional()
        .map_err(translate)?;
    if expired.is_some() {
        remove(conn, parent, name)?;
    }
    Ok(())
}

/// Creates every missing ancestor directory of `key`.
fn ensure_parents(conn: &Connection, key: &Key, now: i64) -> Result<()> {
    let segments = key.segments();
    for depth in 1..segments.len() {
        let dir = Key::new(segments[..depth].iter().cloned());
        let (parent, name) = split(&dir);
        purge_if_expired(conn, &parent, &name, now)?;
        match lookup(conn, &parent, &name, now)? {
            Some(node) if node.is_dir => {}
            Some(_) => {
                return Err(CairnError::BadParameter(format!(
                    "{dir} is a value, cannot hold {key}"
                )));
            }
            None => store_dir(conn, &parent, &name, None)?,
        }
    }
    Ok(())
}

fn store_dir(conn: &Connection, parent: &str, name: &str, expires: Option<i64>) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO nodes (parent, name, is_dir, value, expires_at)
         VALUES (?1, ?2, 1, NULL, ?3)",
        params![parent, name, expires],
    )
    .map_err(translate)?;
    Ok(())
}

fn store_leaf(
    conn: &Connection,
    parent: &str,
    name: &str,
    val: &[u8],
    expires: Option<i64>,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO nodes (parent, name, is_dir, value, expires_at)
         VALUES (?1, ?2, 0, ?3, ?4)",
        params![parent, name, val, expires],
    )
    .map_err(translate)?;
    Ok(())
}

/// Deletes the node and, for directories, everything below it.
fn remove(conn: &Connection, parent: &str, name: &str) -> Result<()> {
    let path = format!("{parent}/{name}");
    // '0' sorts right after '/', bounding the subtree range.
    conn.execute(
        "DELETE FROM nodes WHERE parent = ?1 OR (parent >= ?2 AND parent < ?3)",
        params![path, format!("{path}/"), format!("{path}0")],
    )
    .map_err(translate)?;
    conn.execute(
        "DELETE FROM nodes WHERE parent = ?1 AND name = ?2",
        params![parent, name],
    )
    .map_err(translate)?;
    Ok(())
}
