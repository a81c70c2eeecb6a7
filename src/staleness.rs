//! Staleness policy
//!
//! Decides whether a cached record must be refreshed from its age and the
//! event calendar. Continuous series are never trusted from cache;
//! periodic series are trusted for `long_threshold_days`, tightened to
//! `short_threshold_days` inside an active calendar window.

use crate::calendar::EventCalendar;
use crate::config::Config;
use crate::types::SeriesKind;
use chrono::{DateTime, Utc};

/// Cache-trust policy for series records
#[derive(Clone, Debug)]
pub struct StalenessPolicy {
    short_threshold_days: i64,
    long_threshold_days: i64,
    calendar: EventCalendar,
}

impl StalenessPolicy {
    /// Create a policy from explicit thresholds and a calendar
    pub fn new(short_threshold_days: i64, long_threshold_days: i64, calendar: EventCalendar) -> Self {
        Self {
            short_threshold_days,
            long_threshold_days,
            calendar,
        }
    }

    /// Build a policy from configuration, using the default earnings calendar
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.short_threshold_days,
            config.long_threshold_days,
            EventCalendar::default(),
        )
    }

    /// The threshold in days that applies at `now`
    pub fn threshold_days(&self, now: DateTime<Utc>) -> i64 {
        if self.calendar.is_active(now.date_naive()) {
            self.short_threshold_days
        } else {
            self.long_threshold_days
        }
    }

    /// Decide whether a cached record must be refreshed
    ///
    /// A record that was never fetched is stale. A negative age (clock skew)
    /// is treated as stale. Age is computed in whole days, floored.
    pub fn needs_refresh(
        &self,
        kind: SeriesKind,
        last_refresh_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        match kind {
            // No cache trust is extended to continuous series
            SeriesKind::Continuous => true,
            SeriesKind::Periodic => {
                let Some(last) = last_refresh_at else {
                    return true;
                };
                let age = now.signed_duration_since(last);
                if age < chrono::Duration::zero() {
                    return true;
                }
                age.num_days() >= self.threshold_days(now)
            }
        }
    }
}
