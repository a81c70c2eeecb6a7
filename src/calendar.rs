//! Recurring event calendar
//!
//! Annual date-bounded windows during which periodic data changes quickly
//! and cache staleness thresholds tighten. The default calendar holds the
//! four quarterly earnings seasons.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// One annual window, inclusive on both ends
///
/// Supports single-month windows (`start_month == end_month`), cross-month
/// windows, and windows that wrap the year boundary (`start > end`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarWindow {
    /// Month the window opens (1-12)
    pub start_month: u32,
    /// Day of month the window opens
    pub start_day: u32,
    /// Month the window closes (1-12)
    pub end_month: u32,
    /// Day of month the window closes
    pub end_day: u32,
}

impl CalendarWindow {
    /// Create a window from inclusive (month, day) bounds
    pub fn new(start_month: u32, start_day: u32, end_month: u32, end_day: u32) -> Self {
        Self {
            start_month,
            start_day,
            end_month,
            end_day,
        }
    }

    fn contains(&self, month: u32, day: u32) -> bool {
        let date = (month, day);
        let start = (self.start_month, self.start_day);
        let end = (self.end_month, self.end_day);

        if start <= end {
            start <= date && date <= end
        } else {
            // Window wraps the year boundary (e.g. Dec 15 - Jan 15)
            date >= start || date <= end
        }
    }
}

/// Fixed set of annual windows checked by the staleness policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCalendar {
    windows: Vec<CalendarWindow>,
}

impl EventCalendar {
    /// Build a calendar from explicit windows
    pub fn new(windows: Vec<CalendarWindow>) -> Self {
        Self { windows }
    }

    /// The four quarterly earnings seasons:
    /// Jan 15 - Feb 15, Apr 15 - May 15, Jul 15 - Aug 15, Oct 15 - Nov 15
    pub fn earnings_seasons() -> Self {
        Self::new(vec![
            CalendarWindow::new(1, 15, 2, 15),
            CalendarWindow::new(4, 15, 5, 15),
            CalendarWindow::new(7, 15, 8, 15),
            CalendarWindow::new(10, 15, 11, 15),
        ])
    }

    /// A calendar with no windows - never active
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// True if `date` falls inside any window (inclusive)
    pub fn is_active(&self, date: NaiveDate) -> bool {
        let (month, day) = (date.month(), date.day());
        self.windows.iter().any(|w| w.contains(month, day))
    }
}

impl Default for EventCalendar {
    fn default() -> Self {
        Self::earnings_seasons()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn date(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, day).unwrap()
    }

    #[test]
    fn earnings_season_bounds_are_inclusive() {
        let calendar = EventCalendar::earnings_seasons();
        assert!(calendar.is_active(date(1, 15)));
        assert!(calendar.is_active(date(2, 15)));
        assert!(!calendar.is_active(date(1, 14)));
        assert!(!calendar.is_active(date(2, 16)));
    }

    #[test]
    fn all_four_seasons_recognized() {
        let calendar = EventCalendar::earnings_seasons();
        assert!(calendar.is_active(date(1, 20)));
        assert!(calendar.is_active(date(4, 30)));
        assert!(calendar.is_active(date(8, 1)));
        assert!(calendar.is_active(date(11, 10)));
    }

    #[test]
    fn gaps_between_seasons_are_inactive() {
        let calendar = EventCalendar::earnings_seasons();
        assert!(!calendar.is_active(date(3, 10)));
        assert!(!calendar.is_active(date(6, 1)));
        assert!(!calendar.is_active(date(9, 15)));
        assert!(!calendar.is_active(date(12, 25)));
    }

    #[test]
    fn single_month_window() {
        let calendar = EventCalendar::new(vec![CalendarWindow::new(6, 1, 6, 10)]);
        assert!(calendar.is_active(date(6, 1)));
        assert!(calendar.is_active(date(6, 10)));
        assert!(!calendar.is_active(date(6, 11)));
        assert!(!calendar.is_active(date(5, 31)));
    }

    #[test]
    fn year_wrapping_window() {
        let calendar = EventCalendar::new(vec![CalendarWindow::new(12, 15, 1, 15)]);
        assert!(calendar.is_active(date(12, 20)));
        assert!(calendar.is_active(date(1, 10)));
        assert!(calendar.is_active(date(12, 15)));
        assert!(calendar.is_active(date(1, 15)));
        assert!(!calendar.is_active(date(11, 30)));
        assert!(!calendar.is_active(date(2, 1)));
    }

    #[test]
    fn multi_month_window_covers_interior_months() {
        let calendar = EventCalendar::new(vec![CalendarWindow::new(3, 10, 6, 20)]);
        assert!(calendar.is_active(date(4, 1)));
        assert!(calendar.is_active(date(5, 31)));
        assert!(!calendar.is_active(date(3, 9)));
        assert!(!calendar.is_active(date(6, 21)));
    }

    #[test]
    fn empty_calendar_never_active() {
        let calendar = EventCalendar::empty();
        assert!(!calendar.is_active(date(1, 20)));
        assert!(!calendar.is_active(date(7, 31)));
    }
}
