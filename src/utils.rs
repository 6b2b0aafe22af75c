//! Utility functions and the clock abstraction for the fitband-ble crate.

use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use parking_lot::RwLock;

/// Number of days in the rolling step history window.
pub const HISTORY_WINDOW_DAYS: usize = 7;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Current calendar date in the user's local time.
    fn today(&self) -> NaiveDate;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Clock pinned to a settable instant.
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    /// Create a clock pinned to `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Move the clock.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }

    fn today(&self) -> NaiveDate {
        self.now.read().date_naive()
    }
}

/// The contiguous window of dates ending at `today`, oldest first.
///
/// # Example
///
/// ```
/// use chrono::NaiveDate;
/// use fitband_ble::utils::history_window;
///
/// let today = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
/// let window = history_window(today);
/// assert_eq!(window[0], NaiveDate::from_ymd_opt(2024, 2, 25).unwrap());
/// assert_eq!(window[6], today);
/// ```
pub fn history_window(today: NaiveDate) -> [NaiveDate; HISTORY_WINDOW_DAYS] {
    let mut window = [today; HISTORY_WINDOW_DAYS];
    for (i, slot) in window.iter_mut().enumerate() {
        let back = (HISTORY_WINDOW_DAYS - 1 - i) as u64;
        *slot = today.checked_sub_days(Days::new(back)).unwrap_or(NaiveDate::MIN);
    }
    window
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_history_window_is_contiguous() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let window = history_window(today);

        assert_eq!(window.len(), 7);
        assert_eq!(window[6], today);
        for pair in window.windows(2) {
            assert_eq!(pair[0].succ_opt(), Some(pair[1]));
        }
        // Crosses the year boundary
        assert_eq!(window[0], NaiveDate::from_ymd_opt(2023, 12, 28).unwrap());
    }

    #[test]
    fn test_fixed_clock() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());

        clock.set(start + chrono::Duration::days(1));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
    }
}
