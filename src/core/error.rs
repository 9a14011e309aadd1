use std::io;
use thiserror::Error;

/// Error kinds shared by every storage engine and the backend on top of them.
///
/// Engines translate native failures into these variants at the point of
/// occurrence; nothing above `kv` ever matches on a `rusqlite` error.
#[derive(Error, Debug)]
pub enum CairnError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("compare failed: {0}")]
    CompareFailed(String),
    #[error("bad parameter: {0}")]
    BadParameter(String),
    #[error("connection problem: {0}")]
    ConnectionProblem(String),
    #[error("unsupported filesystem: {0}")]
    UnsupportedFilesystem(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CairnError>;

impl CairnError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CairnError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, CairnError::AlreadyExists(_))
    }

    pub fn is_compare_failed(&self) -> bool {
        matches!(self, CairnError::CompareFailed(_))
    }

    pub fn is_bad_parameter(&self) -> bool {
        matches!(self, CairnError::BadParameter(_))
    }

    pub fn is_connection_problem(&self) -> bool {
        matches!(self, CairnError::ConnectionProblem(_))
    }

    pub fn is_unsupported_filesystem(&self) -> bool {
        matches!(self, CairnError::UnsupportedFilesystem(_))
    }

    /// Prefixes the message with entity context while keeping the kind, so
    /// `is_not_found()` and friends still answer for the wrapped error.
    pub fn with_context(self, context: impl AsRef<str>) -> Self {
        let ctx = context.as_ref();
        match self {
            CairnError::NotFound(m) => CairnError::NotFound(format!("{ctx}: {m}")),
            CairnError::AlreadyExists(m) => CairnError::AlreadyExists(format!("{ctx}: {m}")),
            CairnError::CompareFailed(m) => CairnError::CompareFailed(format!("{ctx}: {m}")),
            CairnError::BadParameter(m) => CairnError::BadParameter(format!("{ctx}: {m}")),
            CairnError::ConnectionProblem(m) => {
                CairnError::ConnectionProblem(format!("{ctx}: {m}"))
            }
            CairnError::UnsupportedFilesystem(m) => {
                CairnError::UnsupportedFilesystem(format!("{ctx}: {m}"))
            }
            CairnError::Storage(m) => CairnError::Storage(format!("{ctx}: {m}")),
            CairnError::Io(e) => CairnError::Io(io::Error::new(e.kind(), format!("{ctx}: {e}"))),
        }
    }
}

/// Returns `Ok(())` for `NotFound`, passing every other outcome through.
/// Cascading deletes use this so that already-removed dependents are not errors.
pub fn ignore_not_found(res: Result<()>) -> Result<()> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
