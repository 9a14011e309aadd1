//! Backend construction settings.
//!
//! Loaded from a TOML file such as:
//!
//! ```toml
//! path = "/var/lib/cairn/cairn.db"
//! read_only = false
//! multi_client = true
//! timeout_ms = 0        # 0 = default, negative = fail fast
//! legacy_base64 = false
//! ```

use crate::core::codec::{Codec, DEFAULT_COMPRESSION_THRESHOLD};
use crate::core::error::{CairnError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Open timeout used when none is configured.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long opening the store waits for the file lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenTimeout {
    #[default]
    Default,
    After(Duration),
    /// Do not wait at all; a held lock fails the open immediately.
    FailFast,
}

impl OpenTimeout {
    /// Zero means the default, negative means fail-fast.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => OpenTimeout::Default,
            ms if ms < 0 => OpenTimeout::FailFast,
            ms => OpenTimeout::After(Duration::from_millis(ms as u64)),
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            OpenTimeout::Default => DEFAULT_OPEN_TIMEOUT,
            OpenTimeout::After(d) => *d,
            OpenTimeout::FailFast => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Path to the embedded store file.
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    /// Reopen the store around every call so other processes can interleave.
    #[serde(default)]
    pub multi_client: bool,
    #[serde(default)]
    pub timeout_ms: i64,
    #[serde(default)]
    pub legacy_base64: bool,
    #[serde(default = "default_threshold")]
    pub compression_threshold: usize,
}

fn default_threshold() -> usize {
    DEFAULT_COMPRESSION_THRESHOLD
}

impl BackendConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
            multi_client: false,
            timeout_ms: 0,
            legacy_base64: false,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn multi_client(mut self, multi_client: bool) -> Self {
        self.multi_client = multi_client;
        self
    }

    pub fn timeout(mut self, timeout: OpenTimeout) -> Self {
        self.timeout_ms = match timeout {
            OpenTimeout::Default => 0,
            OpenTimeout::FailFast => -1,
            OpenTimeout::After(d) => d.as_millis().clamp(1, i64::MAX as u128) as i64,
        };
        self
    }

    pub fn open_timeout(&self) -> OpenTimeout {
        OpenTimeout::from_millis(self.timeout_ms)
    }

    pub fn codec(&self) -> Codec {
        Codec::default()
            .with_threshold(self.compression_threshold)
            .with_legacy_base64(self.legacy_base64)
    }

    pub fn check(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(CairnError::BadParameter("missing store path".to_string()));
        }
        Ok(())
    }
}

/// Load backend settings from a TOML file.
pub fn load_config(path: &Path) -> Result<BackendConfig> {
    let content = fs::read_to_string(path).map_err(|e| {
        CairnError::BadParameter(format!("failed to read config {}: {e}", path.display()))
    })?;
    let config: BackendConfig = toml::from_str(&content)
        .map_err(|e| CairnError::BadParameter(format!("invalid config {}: {e}", path.display())))?;
    config.check()?;
    Ok(config)
}
