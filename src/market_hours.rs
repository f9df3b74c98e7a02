// =============================================================================
// Market Hours — fixed weekly schedule for the traded instruments
// =============================================================================
//
// The instruments trade round the clock during the week:
//   - closed all of Saturday,
//   - closed Sunday before `sunday_open_hour` (UTC),
//   - closed Friday from `friday_close_hour` (UTC) onwards.
//
// `last_session` gives the window of the most recently completed weekly
// session, which the history resolver serves while the market is shut.
// =============================================================================

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use serde::Serialize;

/// Weekly open/close cutoffs, hours in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketSchedule {
    friday_close_hour: u32,
    sunday_open_hour: u32,
}

/// A completed trading session, epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionWindow {
    pub open: i64,
    pub close: i64,
}

impl MarketSchedule {
    pub fn new(friday_close_hour: u32, sunday_open_hour: u32) -> Self {
        Self {
            friday_close_hour: friday_close_hour.min(23),
            sunday_open_hour: sunday_open_hour.min(23),
        }
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        match now.weekday() {
            Weekday::Sat => false,
            Weekday::Sun => now.hour() >= self.sunday_open_hour,
            Weekday::Fri => now.hour() < self.friday_close_hour,
            _ => true,
        }
    }

    /// Most recent Friday close at or before `now`, paired with the Sunday
    /// open that started that week's session.
    pub fn last_session(&self, now: DateTime<Utc>) -> SessionWindow {
        let today = now.date_naive();
        let days_since_friday = (today.weekday().num_days_from_monday() + 7
            - Weekday::Fri.num_days_from_monday())
            % 7;
        let mut close_day = today - Duration::days(i64::from(days_since_friday));
        let mut close = at_hour(close_day, self.friday_close_hour);
        if close > now {
            close_day = close_day - Duration::days(7);
            close = at_hour(close_day, self.friday_close_hour);
        }
        let open = at_hour(close_day - Duration::days(5), self.sunday_open_hour);

        SessionWindow {
            open: open.timestamp(),
            close: close.timestamp(),
        }
    }
}

impl Default for MarketSchedule {
    fn default() -> Self {
        Self::new(22, 22)
    }
}

fn at_hour(day: NaiveDate, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    Utc.from_utc_datetime(&day.and_time(time))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn weekly_schedule() {
        let s = MarketSchedule::default();
        // 2024-01-03 is a Wednesday.
        assert!(s.is_open(utc(2024, 1, 3, 12, 0)));
        assert!(s.is_open(utc(2024, 1, 5, 21, 59)));
        assert!(!s.is_open(utc(2024, 1, 5, 22, 0)));
        assert!(!s.is_open(utc(2024, 1, 6, 12, 0)));
        assert!(!s.is_open(utc(2024, 1, 7, 21, 0)));
        assert!(s.is_open(utc(2024, 1, 7, 22, 0)));
    }

    #[test]
    fn last_session_during_weekend() {
        let s = MarketSchedule::default();
        let w = s.last_session(utc(2024, 1, 6, 10, 0));
        assert_eq!(w.close, utc(2024, 1, 5, 22, 0).timestamp());
        assert_eq!(w.open, utc(2023, 12, 31, 22, 0).timestamp());
    }

    #[test]
    fn last_session_friday_before_close_is_previous_week() {
        let s = MarketSchedule::default();
        let w = s.last_session(utc(2024, 1, 5, 12, 0));
        assert_eq!(w.close, utc(2023, 12, 29, 22, 0).timestamp());
        assert_eq!(w.open, utc(2023, 12, 24, 22, 0).timestamp());
    }

    #[test]
    fn last_session_friday_after_close() {
        let s = MarketSchedule::new(21, 23);
        let w = s.last_session(utc(2024, 1, 5, 21, 30));
        assert_eq!(w.close, utc(2024, 1, 5, 21, 0).timestamp());
        assert_eq!(w.open, utc(2023, 12, 31, 23, 0).timestamp());
        assert!(w.open < w.close);
    }

    #[test]
    fn hours_are_clamped() {
        let s = MarketSchedule::new(99, 30);
        assert_eq!(s, MarketSchedule::new(23, 23));
    }
}
