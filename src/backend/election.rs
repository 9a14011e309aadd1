//! Advisory leader election over compare-and-swap.
//!
//! The leader key holds the current leader's voter ID and expires after one
//! term unless renewed. An absent or empty value means the seat is vacant.

use super::{Backend, LEADER, key};
use crate::core::error::{CairnError, Result};
use crate::kv::Key;
use std::time::Duration;
use tracing::{debug, info};

pub struct Election<'a> {
    backend: &'a Backend,
    key: Key,
    voter: String,
    term: Duration,
}

impl<'a> Election<'a> {
    pub fn new(backend: &'a Backend, name: &str, voter: &str, term: Duration) -> Result<Self> {
        if voter.is_empty() {
            return Err(CairnError::BadParameter("election: missing voter".to_string()));
        }
        if term.is_zero() {
            return Err(CairnError::BadParameter(format!(
                "election {name}: term must be positive"
            )));
        }
        let key = key([LEADER, name]);
        key.check()?;
        Ok(Self {
            backend,
            key,
            voter: voter.to_string(),
            term,
        })
    }

    /// Takes the seat if vacant, or renews it if already held by this voter.
    /// Returns whether this voter leads afterwards.
    pub fn campaign(&self) -> Result<bool> {
        let engine = self.backend.engine();
        match engine.compare_and_swap(&self.key, self.voter.as_bytes(), None, self.term) {
            Ok(_) => {
                info!(election = %self.key, voter = %self.voter, "won election");
                return Ok(true);
            }
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        match self.leader()? {
            Some(leader) if leader == self.voter => self.renew(),
            Some(leader) => {
                debug!(election = %self.key, %leader, "seat taken");
                Ok(false)
            }
            // stepped down: the value is present but empty
            None => self.swap_from(b""),
        }
    }

    /// Extends the term while this voter still leads.
    pub fn renew(&self) -> Result<bool> {
        self.swap_from(self.voter.as_bytes())
    }

    /// Current leader, if any.
    pub fn leader(&self) -> Result<Option<String>> {
        match self.backend.engine().get_val_bytes(&self.key) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Vacates the seat if this voter holds it.
    pub fn step_down(&self) -> Result<()> {
        match self.backend.engine().compare_and_swap(
            &self.key,
            b"",
            Some(self.voter.as_bytes()),
            self.term,
        ) {
            Ok(_) => {
                info!(election = %self.key, voter = %self.voter, "stepped down");
                Ok(())
            }
            Err(e) if e.is_compare_failed() || e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn swap_from(&self, expected: &[u8]) -> Result<bool> {
        match self.backend.engine().compare_and_swap(
            &self.key,
            self.voter.as_bytes(),
            Some(expected),
            self.term,
        ) {
            Ok(_) => Ok(true),
            Err(e) if e.is_compare_failed() || e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
