//! Date/time parsing primitives for the rule engine.
//!
//! Each `DateStyle` corresponds to one locale/format family a bundled
//! `ServerType` names in `catalog.rs`. A listing line never carries its own
//! year for the common Unix case, so the no-year resolution rule prefers
//! the past when the naive month/day would otherwise land in the future
//! relative to "now".

use crate::parser::types::DateStyle;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

const ENGLISH_MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

const GERMAN_MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mär", "Apr", "Mai", "Jun", "Jul", "Aug", "Sep", "Okt", "Nov", "Dez",
];

fn month_index(name: &str, table: &[&str; 12]) -> Option<u32> {
    table
        .iter()
        .position(|m| m.eq_ignore_ascii_case(name))
        .map(|i| i as u32 + 1)
}

/// Parse a date/time capture according to `style`. `now` is injected by the
/// caller (never sampled internally) so the no-year resolution rule is
/// deterministic and testable.
pub fn parse_date(raw: &str, style: DateStyle, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match style {
        DateStyle::UnixNoYear => parse_unix_no_year(raw, &ENGLISH_MONTHS, now),
        DateStyle::UnixNoYearGerman => parse_unix_no_year(raw, &GERMAN_MONTHS, now),
        DateStyle::UnixYearOnly => parse_unix_year_only(raw, &ENGLISH_MONTHS),
        DateStyle::WindowsAmPm => parse_windows(raw, true),
        DateStyle::Windows24Hour => parse_windows(raw, false),
        DateStyle::Vms => parse_vms(raw),
        DateStyle::Mlsd => parse_mlsd(raw),
    }
}

/// `Mon dd HH:MM` with no year — resolve against `now`, preferring the past.
fn parse_unix_no_year(raw: &str, months: &[&str; 12], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = raw.split_whitespace().collect();
    if parts.len() != 3 {
        return None;
    }
    let month = month_index(parts[0], months)?;
    let day: u32 = parts[1].parse().ok()?;
    let (hour, minute) = parts[2].split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;

    let this_year = now.year();
    let candidate = NaiveDate::from_ymd_opt(this_year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))?;
    let candidate_utc = Utc.from_utc_datetime(&candidate);

    let resolved = if candidate_utc > now {
        let prev_year = NaiveDate::from_ymd_opt(this_year - 1, month, day)?;
        Utc.from_utc_datetime(&prev_year.and_hms_opt(hour, minute, 0)?)
    } else {
        candidate_utc
    };
    Some(resolved)
}

/// `Mon dd  yyyy` — an old file, no time of day reported.
fn parse_unix_year_only(raw: &str, months: &[&str; 12]) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = raw.split_whitespace().collect();
    if parts.len() != 3 {
        return None;
    }
    let month = month_index(parts[0], months)?;
    let day: u32 = parts[1].parse().ok()?;
    let year: i32 = parts[2].parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

/// `MM-DD-YY  hh:mmAM/PM` or `MM-DD-YY  HH:MM`.
fn parse_windows(raw: &str, am_pm: bool) -> Option<DateTime<Utc>> {
    let mut parts = raw.split_whitespace();
    let date_part = parts.next()?;
    let time_part = parts.next()?;

    let mut dparts = date_part.split('-');
    let month: u32 = dparts.next()?.parse().ok()?;
    let day: u32 = dparts.next()?.parse().ok()?;
    let year: i32 = dparts.next()?.parse().ok()?;
    let year = if year < 100 { 2000 + year } else { year };
    let date = NaiveDate::from_ymd_opt(year, month, day)?;

    let time = if am_pm {
        let (is_pm, clock) = if let Some(s) = time_part.strip_suffix("PM") {
            (true, s)
        } else if let Some(s) = time_part.strip_suffix("AM") {
            (false, s)
        } else {
            return None;
        };
        let (h, m) = clock.split_once(':')?;
        let mut hour: u32 = h.parse().ok()?;
        let minute: u32 = m.parse().ok()?;
        if is_pm && hour != 12 {
            hour += 12;
        }
        if !is_pm && hour == 12 {
            hour = 0;
        }
        NaiveTime::from_hms_opt(hour, minute, 0)?
    } else {
        let (h, m) = time_part.split_once(':')?;
        NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)?
    };

    Some(Utc.from_utc_datetime(&NaiveDateTime::new(date, time)))
}

/// `DD-MMM-YYYY HH:MM` (OpenVMS).
fn parse_vms(raw: &str) -> Option<DateTime<Utc>> {
    let mut parts = raw.split_whitespace();
    let date_part = parts.next()?;
    let time_part = parts.next()?;

    let mut dparts = date_part.split('-');
    let day: u32 = dparts.next()?.parse().ok()?;
    let month = month_index(dparts.next()?, &ENGLISH_MONTHS)?;
    let year: i32 = dparts.next()?.parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;

    let (h, m) = time_part.split_once(':')?;
    let time = NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)?;
    Some(Utc.from_utc_datetime(&NaiveDateTime::new(date, time)))
}

/// `YYYYMMDDHHMMSS` as used in MLSD `modify=` facts.
fn parse_mlsd(raw: &str) -> Option<DateTime<Utc>> {
    let dt = NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S").ok()?;
    Some(Utc.from_utc_datetime(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn no_year_date_in_the_past_resolves_to_current_year() {
        let now = at(2026, 7, 27, 12, 0);
        let parsed = parse_date("Jan 15 09:30", DateStyle::UnixNoYear, now).unwrap();
        assert_eq!(parsed.year(), 2026);
    }

    #[test]
    fn no_year_date_that_would_be_future_resolves_to_previous_year() {
        let now = at(2026, 1, 10, 12, 0);
        let parsed = parse_date("Dec 20 09:30", DateStyle::UnixNoYear, now).unwrap();
        assert_eq!(parsed.year(), 2025);
    }

    #[test]
    fn german_month_abbreviations_are_recognised() {
        let now = at(2026, 7, 27, 12, 0);
        let parsed = parse_date("Mär 3 10:00", DateStyle::UnixNoYearGerman, now).unwrap();
        assert_eq!(parsed.month(), 3);
    }

    #[test]
    fn windows_am_pm_parses() {
        let parsed = parse_date("03-15-24  02:30PM", DateStyle::WindowsAmPm, Utc::now()).unwrap();
        assert_eq!(parsed.year(), 2024);
        assert_eq!(parsed.hour(), 14);
    }

    #[test]
    fn vms_date_parses() {
        let parsed = parse_date("15-MAR-2024 10:00", DateStyle::Vms, Utc::now()).unwrap();
        assert_eq!(parsed.year(), 2024);
        assert_eq!(parsed.month(), 3);
    }

    #[test]
    fn mlsd_compact_timestamp_parses() {
        let parsed = parse_date("20240315142233", DateStyle::Mlsd, Utc::now()).unwrap();
        assert_eq!(parsed.year(), 2024);
        assert_eq!(parsed.hour(), 14);
    }
}
