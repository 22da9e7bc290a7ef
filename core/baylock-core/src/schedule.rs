//! Time-of-day labels to wall-clock instants.
//!
//! Bookings carry labels like "1:00 PM" for the current day. Labels are
//! interpreted in the kiosk's local wall clock; the booking service is expected
//! to generate them in the same zone, so no conversion happens here.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{KioskError, Result};

static RE_TIME_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(\d{1,2}):(\d{2})\s*([AP])\.?M\.?\s*$").unwrap());

/// Combines a 12-hour label ("h:mm AM" / "hh:mm PM") with `date`.
///
/// `12 AM` is midnight, `12 PM` is noon, and any other PM hour adds twelve.
pub fn parse_time_of_day(label: &str, date: NaiveDate) -> Result<NaiveDateTime> {
    let invalid = || KioskError::InvalidTimeLabel(label.to_string());
    let caps = RE_TIME_LABEL.captures(label).ok_or_else(invalid)?;

    let hour: u32 = caps[1].parse().map_err(|_| invalid())?;
    let minute: u32 = caps[2].parse().map_err(|_| invalid())?;
    if !(1..=12).contains(&hour) || minute > 59 {
        return Err(invalid());
    }

    let is_pm = caps[3].eq_ignore_ascii_case("p");
    let hour = match (hour, is_pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, true) => h + 12,
        (h, false) => h,
    };

    let time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)?;
    Ok(date.and_time(time))
}

/// Parses `label` against the date of `now`.
pub fn parse_today(label: &str, now: NaiveDateTime) -> Result<NaiveDateTime> {
    parse_time_of_day(label, now.date())
}

/// Start and end of a booking window, both on the date of `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Window {
    pub fn parse(start: &str, end: &str, now: NaiveDateTime) -> Result<Self> {
        Ok(Self {
            start: parse_today(start, now)?,
            end: parse_today(end, now)?,
        })
    }

    /// Start inclusive, end exclusive.
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        self.start <= at && at < self.end
    }
}
