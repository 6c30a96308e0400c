//! Wall-clock abstraction.
//!
//! The key lifecycle subsystem needs `now()` in two flavors: a real one for
//! production, and a fixed/advanceable one for tests that exercise TTL
//! expiry and daily quota-reset math deterministically.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Anything that can report the current instant.
///
/// Implementations must be `Send + Sync` since the registry and pool are
/// shared across tasks behind an `Arc`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A fake clock for tests. Starts at a fixed instant and only advances when
/// told to, so batch-stagger and TTL-expiry tests don't race real time.
pub struct FakeClock {
    millis: AtomicI64,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        self.millis.fetch_add(delta.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .expect("fake clock millis always valid")
    }
}

/// Compute the next daily wall-clock reset instant at `reset_hour:00:00` in
/// timezone `tz`, given the current instant `now`.
///
/// If `now` is already at or past today's reset, the deadline rolls to
/// tomorrow's; otherwise it's today's. The result is a fixed wall-time
/// boundary, not a rolling `now + delta` window, because upstream quota
/// resets on the provider's daily clock rather than on a sliding window.
pub fn next_daily_reset(now: DateTime<Utc>, tz: chrono_tz::Tz, reset_hour: u32) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    // A misconfigured reset hour (e.g. from a bad config file) wraps rather
    // than panics; this is wall-clock math on an external input, not an
    // internal invariant.
    let today_reset_naive = local_now
        .date_naive()
        .and_hms_opt(reset_hour % 24, 0, 0)
        .expect("reset_hour % 24 is always 0..=23");

    let today_reset = tz
        .from_local_datetime(&today_reset_naive)
        .single()
        .unwrap_or_else(|| tz.from_utc_datetime(&today_reset_naive));

    let deadline_local = if local_now >= today_reset {
        today_reset + chrono::Duration::days(1)
    } else {
        today_reset
    };

    deadline_local.with_timezone(&Utc)
}

/// Parse a timezone name, falling back to UTC on anything unrecognized.
pub fn parse_tz(name: &str) -> chrono_tz::Tz {
    name.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn before_reset_hour_returns_today() {
        let now = chrono_tz::UTC.with_ymd_and_hms(2026, 7, 29, 10, 0, 0).unwrap();
        let deadline = next_daily_reset(now.with_timezone(&Utc), chrono_tz::UTC, 12);
        assert_eq!(deadline, chrono_tz::UTC.with_ymd_and_hms(2026, 7, 29, 12, 0, 0).unwrap());
    }

    #[test]
    fn after_reset_hour_rolls_to_tomorrow() {
        let now = chrono_tz::UTC.with_ymd_and_hms(2026, 7, 29, 13, 0, 0).unwrap();
        let deadline = next_daily_reset(now.with_timezone(&Utc), chrono_tz::UTC, 12);
        assert_eq!(deadline, chrono_tz::UTC.with_ymd_and_hms(2026, 7, 30, 12, 0, 0).unwrap());
    }

    #[test]
    fn out_of_range_reset_hour_wraps_instead_of_panicking() {
        let now = chrono_tz::UTC.with_ymd_and_hms(2026, 7, 29, 10, 0, 0).unwrap();
        let deadline = next_daily_reset(now.with_timezone(&Utc), chrono_tz::UTC, 36);
        assert_eq!(deadline, chrono_tz::UTC.with_ymd_and_hms(2026, 7, 29, 12, 0, 0).unwrap());
    }

    #[test]
    fn deterministic_within_same_day() {
        let now = chrono_tz::US::Pacific.with_ymd_and_hms(2026, 7, 29, 3, 0, 0).unwrap();
        let a = next_daily_reset(now.with_timezone(&Utc), chrono_tz::US::Pacific, 0);
        let b = next_daily_reset(now.with_timezone(&Utc), chrono_tz::US::Pacific, 0);
        assert_eq!(a, b);
    }
}
