//! Simulation Time
//!
//! Nanosecond timestamps shared by the catalog, the merge engine and the replay
//! driver, plus the monotonic clock the replay driver advances batch by batch.

use std::fmt;

/// Nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
pub type Nanos = i64;

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Monotonic replay clock.
///
/// The clock only moves forward. `try_advance_to` reports a rewind instead of
/// moving, so callers can surface it as an error rather than panicking mid-replay.
#[derive(Debug, Clone)]
pub struct SimClock {
    current: Nanos,
}

impl SimClock {
    #[inline]
    pub fn new(start_time: Nanos) -> Self {
        Self {
            current: start_time,
        }
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        self.current
    }

    /// Advance to `new_time`. Returns `Err(current)` if that would move backward.
    #[inline]
    pub fn try_advance_to(&mut self, new_time: Nanos) -> Result<(), Nanos> {
        if new_time < self.current {
            return Err(self.current);
        }
        self.current = new_time;
        Ok(())
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Display for SimClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.current / NANOS_PER_SEC;
        let nanos = self.current % NANOS_PER_SEC;
        write!(f, "{}.{:09}s", secs, nanos)
    }
}

#[inline]
pub fn datetime_to_nanos(dt: &chrono::DateTime<chrono::Utc>) -> Nanos {
    dt.timestamp_nanos_opt().unwrap_or(0)
}

/// Render nanoseconds as a UTC timestamp, falling back to the raw value when out of range.
pub fn format_nanos(nanos: Nanos) -> String {
    use chrono::TimeZone;
    let secs = nanos.div_euclid(NANOS_PER_SEC);
    let nsecs = nanos.rem_euclid(NANOS_PER_SEC) as u32;
    chrono::Utc
        .timestamp_opt(secs, nsecs)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| format!("{}ns", nanos))
}

/// Parse an RFC3339 string to Nanos.
pub fn parse_timestamp(s: &str) -> Option<Nanos> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| datetime_to_nanos(&dt.with_timezone(&chrono::Utc)))
}
