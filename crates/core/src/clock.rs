use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::{AppError, AppResult};

/// Source of the current wall-clock time.
///
/// Lease expiry, dedup windows and lock TTLs all read time through this port so
/// adapters can be exercised deterministically.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock frozen at the given instant.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    /// Replaces the current instant.
    pub fn set(&self, value: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Converts a configuration duration into a signed clock offset.
pub fn clock_offset(value: std::time::Duration) -> AppResult<Duration> {
    Duration::from_std(value)
        .map_err(|error| AppError::Validation(format!("duration {value:?} is out of range: {error}")))
}

/// Returns `now + value`, failing instead of overflowing the calendar.
pub fn expiry_after(now: DateTime<Utc>, value: std::time::Duration) -> AppResult<DateTime<Utc>> {
    now.checked_add_signed(clock_offset(value)?).ok_or_else(|| {
        AppError::Validation(format!(
            "duration {value:?} past {now} exceeds the supported time range"
        ))
    })
}
