//! Wall-clock timestamps carried on the wire.
//!
//! `Instant` is not serializable, so requests and speech carry microseconds
//! since the Unix epoch instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The current wall-clock time. Clocks set before 1970 read as zero.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self(micros)
    }

    /// Raw microsecond count.
    pub fn as_micros(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

/// Hands out strictly increasing timestamps.
///
/// Two predictions created within the same microsecond must still order, or
/// reconciliation could discard the newer one together with the older.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    /// Creates a clock that has issued nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `max(now, previous + 1)`.
    pub fn next(&self) -> Timestamp {
        let now = Timestamp::now().0;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Timestamp(candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}
