//! Helpers shared by the PostgreSQL adapters.

use std::time::Duration;

/// Converts a duration into the seconds argument of `make_interval`.
pub(crate) fn interval_seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}
