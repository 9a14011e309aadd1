//! Clock, TTL and identifier helpers.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ulid::Ulid;

/// Time source used for TTL computation and record timestamps.
///
/// Injected into the backend so tests can move time deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The TTL value that never expires.
pub const FOREVER: Duration = Duration::ZERO;

/// Remaining lifetime of an entity expiring at `expires`.
///
/// Anything at or before the clock's current time, and entities without an
/// expiry, collapse to [`FOREVER`].
pub fn ttl(clock: &dyn Clock, expires: Option<DateTime<Utc>>) -> Duration {
    let Some(expires) = expires else {
        return FOREVER;
    };
    let remaining = expires - clock.now();
    if remaining <= chrono::Duration::zero() {
        return FOREVER;
    }
    remaining.to_std().unwrap_or(FOREVER)
}

/// Unix nanoseconds for `at + ttl`, or `None` when `ttl` is forever.
pub fn expires_at_nanos(at: DateTime<Utc>, ttl: Duration) -> Option<i64> {
    if ttl.is_zero() {
        return None;
    }
    let delta = chrono::Duration::from_std(ttl).ok()?;
    (at + delta).timestamp_nanos_opt()
}

pub fn new_id() -> String {
    Ulid::new().to_string().to_lowercase()
}
