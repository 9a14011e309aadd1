//! Domain-facing storage API.
//!
//! Every accessor composes an engine [`Key`] of the form
//! `root/<prefix>/<id>...` from the fixed prefix vocabulary below; the
//! segment names are part of the on-disk format and must not change.

pub mod accounts;
pub mod authorities;
pub mod election;
pub mod operations;
pub mod packages;
pub mod resources;
pub mod sites;

use crate::core::config::BackendConfig;
use crate::core::error::Result;
use crate::core::time::{self, Clock, SystemClock};
use crate::kv::sqlite::SqliteOptions;
use crate::kv::{Engine, EngineExt, Key, MultiClientEngine, NodeKind, SqliteEngine};
use crate::ops::plan::OperationPlan;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

pub use election::Election;

pub(crate) const ROOT: &str = "root";
pub(crate) const ACCOUNTS: &str = "accounts";
pub(crate) const SITES: &str = "sites";
pub(crate) const VAL: &str = "val";
pub(crate) const OPS: &str = "ops";
pub(crate) const PLAN: &str = "plan";
pub(crate) const CHANGELOG: &str = "changelog";
pub(crate) const PROGRESS: &str = "progress";
pub(crate) const REPOSITORIES: &str = "repositories";
pub(crate) const PACKAGES: &str = "packages";
pub(crate) const USERS: &str = "users";
pub(crate) const KEYS: &str = "keys";
pub(crate) const ROLES: &str = "roles";
pub(crate) const TOKENS: &str = "tokens";
pub(crate) const TUNNELS: &str = "tunnels";
pub(crate) const PEERS: &str = "peers";
pub(crate) const AUTHORITIES: &str = "authorities";
pub(crate) const DEACTIVATED: &str = "deactivated";
pub(crate) const TRUSTED_CLUSTERS: &str = "trustedclusters";
pub(crate) const CONNECTORS: &str = "connectors";
pub(crate) const LEADER: &str = "leader";

/// Composes `root/<parts>...`.
pub(crate) fn key<const N: usize>(parts: [&str; N]) -> Key {
    Key::new(std::iter::once(ROOT).chain(parts))
}

pub struct Backend {
    engine: Box<dyn Engine>,
    clock: Arc<dyn Clock>,
    /// Decoded plans by operation ID. Entries are replaced wholesale on every
    /// write so readers never observe a partially updated plan.
    plans: RwLock<HashMap<String, Arc<OperationPlan>>>,
}

impl Backend {
    pub fn open(config: BackendConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(config: BackendConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.check()?;
        let options = SqliteOptions::from_config(&config, clock.clone());
        let engine: Box<dyn Engine> = if config.multi_client {
            Box::new(MultiClientEngine::open(&config.path, options)?)
        } else {
            Box::new(SqliteEngine::open(&config.path, options)?)
        };
        info!(
            path = %config.path.display(),
            multi_client = config.multi_client,
            "backend ready"
        );
        Ok(Self::with_engine(engine, clock))
    }

    /// Wraps an already opened engine.
    pub fn with_engine(engine: Box<dyn Engine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            clock,
            plans: RwLock::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// TTL for an entity expiring at `expires`, relative to the backend clock.
    pub fn ttl(&self, expires: Option<DateTime<Utc>>) -> Duration {
        time::ttl(self.clock.as_ref(), expires)
    }

    /// Drops cached state and closes the engine.
    pub fn close(&self) -> Result<()> {
        self.clear_plan_cache();
        self.engine.close()
    }

    /// Reads and decodes `key`, tagging failures with `what`.
    fn get_typed<T: DeserializeOwned>(&self, key: &Key, what: &str) -> Result<T> {
        self.engine.get_val(key).map_err(|e| e.with_context(what))
    }

    /// Decodes every leaf directly below `dir`. Subdirectories and entries
    /// that vanish between listing and reading are skipped; a leaf that fails
    /// to decode is an error.
    fn get_all<T: DeserializeOwned>(&self, dir: &Key) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for name in self.engine.get_keys(dir)? {
            let child = dir.join(name);
            match self.engine.get_val(&child) {
                Ok(v) => out.push(v),
                Err(e) if e.is_not_found() => continue,
                Err(e) if e.is_bad_parameter() => match self.engine.get_kind(&child)? {
                    Some(NodeKind::Dir) | None => continue,
                    Some(NodeKind::Leaf) => {
                        return Err(e.with_context(format!("decoding {child}")));
                    }
                },
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}
