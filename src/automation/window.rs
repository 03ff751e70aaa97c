//! Messaging window guard and business-hours evaluation.
//!
//! The provider only accepts free-form (non-template) messages within 24 hours
//! of the user's most recent inbound message. All checks here are pure
//! functions of timestamps so callers decide where `now` comes from.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Length of the free-form messaging window.
pub const MESSAGING_WINDOW_HOURS: i64 = 24;

pub fn messaging_window() -> Duration {
    Duration::hours(MESSAGING_WINDOW_HOURS)
}

/// True iff `now - last_inbound_at < 24h`. Closed exactly at the boundary and
/// when there has never been an inbound message.
pub fn can_send_free_form(last_inbound_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_inbound_at {
        Some(last) => now.signed_duration_since(last) < messaging_window(),
        None => false,
    }
}

/// Seconds left in the window, never negative.
pub fn remaining_seconds(last_inbound_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    match last_inbound_at {
        Some(last) => (messaging_window() - now.signed_duration_since(last))
            .num_seconds()
            .max(0),
        None => 0,
    }
}

/// A conversation state is stale once its window has closed.
pub fn is_stale(last_inbound_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    !can_send_free_form(last_inbound_at, now)
}

/// Whether a delay that resumes at `resume_at` is due. A missing timestamp is
/// never due.
pub fn delay_due(resume_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    resume_at.is_some_and(|at| now >= at)
}

/// Parse an IANA zone name, falling back to UTC.
pub fn parse_timezone(name: Option<&str>) -> Tz {
    match name {
        Some(name) => name.parse::<Tz>().unwrap_or_else(|e| {
            warn!(timezone = %name, error = %e, "Unknown time zone, using UTC");
            Tz::UTC
        }),
        None => Tz::UTC,
    }
}

/// Start of the current local day in `tz`, as a UTC instant.
pub fn local_midnight(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let midnight = local.date_naive().and_time(NaiveTime::MIN);
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        // Midnight skipped by a DST transition: count from the first valid local instant.
        .unwrap_or_else(|| {
            now - Duration::seconds(i64::from(local.num_seconds_from_midnight()))
        })
}

/// Opening hours for one day, as `HH:MM` strings in the account's zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub open: String,
    pub close: String,
}

impl DayHours {
    pub fn new(open: &str, close: &str) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }

    /// `open <= t < close`; a close earlier than open spans midnight and equal
    /// times mean open all day.
    pub fn contains(&self, t: NaiveTime) -> bool {
        let (Some(open), Some(close)) = (parse_clock(&self.open), parse_clock(&self.close)) else {
            warn!(open = %self.open, close = %self.close, "Unparseable business hours, treating as closed");
            return false;
        };
        if open == close {
            true
        } else if open < close {
            open <= t && t < close
        } else {
            t >= open || t < close
        }
    }
}

fn parse_clock(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M:%S"))
        .ok()
}

/// Per-weekday schedule. A missing day is closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeeklySchedule {
    pub monday: Option<DayHours>,
    pub tuesday: Option<DayHours>,
    pub wednesday: Option<DayHours>,
    pub thursday: Option<DayHours>,
    pub friday: Option<DayHours>,
    pub saturday: Option<DayHours>,
    pub sunday: Option<DayHours>,
}

impl WeeklySchedule {
    pub fn for_day(&self, day: Weekday) -> Option<&DayHours> {
        match day {
            Weekday::Mon => self.monday.as_ref(),
            Weekday::Tue => self.tuesday.as_ref(),
            Weekday::Wed => self.wednesday.as_ref(),
            Weekday::Thu => self.thursday.as_ref(),
            Weekday::Fri => self.friday.as_ref(),
            Weekday::Sat => self.saturday.as_ref(),
            Weekday::Sun => self.sunday.as_ref(),
        }
    }

    /// Same hours Monday to Friday, weekend closed.
    pub fn weekdays(open: &str, close: &str) -> Self {
        let hours = Some(DayHours::new(open, close));
        Self {
            monday: hours.clone(),
            tuesday: hours.clone(),
            wednesday: hours.clone(),
            thursday: hours.clone(),
            friday: hours,
            saturday: None,
            sunday: None,
        }
    }
}

/// An explicit override for one calendar date. `hours: None` closes the day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateException {
    pub date: NaiveDate,
    #[serde(default)]
    pub hours: Option<DayHours>,
}

/// Business-hours configuration for an account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    #[serde(default)]
    pub weekly: WeeklySchedule,
    #[serde(default)]
    pub exceptions: Vec<DateException>,
}

impl BusinessHours {
    /// Evaluate the schedule at `now` in zone `tz`. Date exceptions take
    /// precedence over the weekly schedule.
    pub fn is_open(&self, now: DateTime<Utc>, tz: Tz) -> bool {
        let local = now.with_timezone(&tz);
        let date = local.date_naive();
        let time = local.time();

        if let Some(exception) = self.exceptions.iter().find(|e| e.date == date) {
            return exception.hours.as_ref().is_some_and(|h| h.contains(time));
        }

        self.weekly
            .for_day(local.weekday())
            .is_some_and(|h| h.contains(time))
    }
}

/// Per-account settings loaded into each automation snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSettings {
    /// IANA zone used for business hours and daily caps. UTC when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_hours: Option<BusinessHours>,
    /// Overrides the configured recovery message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_message: Option<String>,
}

impl AccountSettings {
    pub fn tz(&self) -> Tz {
        parse_timezone(self.timezone.as_deref())
    }

    pub fn within_business_hours(&self, now: DateTime<Utc>) -> bool {
        within_business_hours(self.business_hours.as_ref(), now, self.tz())
    }
}

/// No configuration means always within hours.
pub fn within_business_hours(hours: Option<&BusinessHours>, now: DateTime<Utc>, tz: Tz) -> bool {
    hours.is_none_or(|h| h.is_open(now, tz))
}
