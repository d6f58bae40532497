//! Date normalization for the messy date strings government release pages
//! actually ship: RFC 3339 in structured data if you are lucky, otherwise
//! things like "June 5, 2024 10:30 AM", "2024-06-05" or "5 June 2024" in a
//! labelled corner of the page.
//!
//! Callers hand over raw candidate strings in priority order; the first one
//! that parses to a plausible calendar date wins. Anything that would
//! silently coerce to an epoch-era date is rejected outright.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// Years at or below this are treated as parse artifacts, not real release
/// dates (epoch-zero coercion, two-digit-year mishaps).
const MIN_PLAUSIBLE_YEAR: i32 = 1972;

// "June 5, 2024", "Sept. 3, 2024 10:30 AM", "March 1, 2023 14:05"
static MONTH_DAY_YEAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)([A-Za-z]{3,9})\.?\s+(\d{1,2}),\s*(\d{4})(?:\s+(\d{1,2}):(\d{2})(?::\d{2})?(?:\s*([AaPp])\.?\s*[Mm]\.?)?)?",
    )
    .unwrap()
});

// "2024-06-05", "2024-06-05T10:30"
static YMD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})(?:[T ](\d{2}):(\d{2}))?").unwrap());

// "5 June 2024", "18 Oct 2025"
static DAY_MONTH_YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d{1,2})\s+([A-Za-z]{3,9})\.?\s+(\d{4})").unwrap());

/// Try each raw candidate in priority order; first plausible parse wins.
pub fn normalize(candidates: &[Option<String>]) -> Option<DateTime<Utc>> {
    candidates
        .iter()
        .flatten()
        .find_map(|raw| parse_single(raw))
}

/// Parse one raw date string into a UTC instant.
///
/// Strict chrono parsing is tried first (RFC 3339, RFC 2822, bare
/// `YYYY-MM-DD[THH:MM[:SS]]`), then the human-text layouts. Missing time
/// means midnight UTC. Returns `None` for anything implausible rather than
/// guessing.
pub fn parse_single(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(dt) = parse_strict(raw) {
        return Some(dt);
    }
    parse_human(raw)
}

fn parse_strict(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return plausible(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return plausible(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return plausible(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return plausible(date.and_time(NaiveTime::MIN).and_utc());
    }
    None
}

fn parse_human(raw: &str) -> Option<DateTime<Utc>> {
    if let Some(c) = MONTH_DAY_YEAR_RE.captures(raw) {
        let month = month_number(c.get(1)?.as_str())?;
        let day: u32 = c.get(2)?.as_str().parse().ok()?;
        let year: i32 = c.get(3)?.as_str().parse().ok()?;
        let time = match (c.get(4), c.get(5)) {
            (Some(h), Some(m)) => clock_time(
                h.as_str().parse().ok()?,
                m.as_str().parse().ok()?,
                c.get(6).map(|p| p.as_str().to_ascii_lowercase() == "p"),
            )?,
            _ => NaiveTime::MIN,
        };
        return build(year, month, day, time);
    }

    if let Some(c) = YMD_RE.captures(raw) {
        let year: i32 = c.get(1)?.as_str().parse().ok()?;
        let month: u32 = c.get(2)?.as_str().parse().ok()?;
        let day: u32 = c.get(3)?.as_str().parse().ok()?;
        let time = match (c.get(4), c.get(5)) {
            (Some(h), Some(m)) => {
                NaiveTime::from_hms_opt(h.as_str().parse().ok()?, m.as_str().parse().ok()?, 0)?
            }
            _ => NaiveTime::MIN,
        };
        return build(year, month, day, time);
    }

    if let Some(c) = DAY_MONTH_YEAR_RE.captures(raw) {
        let day: u32 = c.get(1)?.as_str().parse().ok()?;
        let month = month_number(c.get(2)?.as_str())?;
        let year: i32 = c.get(3)?.as_str().parse().ok()?;
        return build(year, month, day, NaiveTime::MIN);
    }

    None
}

fn build(year: i32, month: u32, day: u32, time: NaiveTime) -> Option<DateTime<Utc>> {
    if year < MIN_PLAUSIBLE_YEAR || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    // from_ymd_opt still rejects things like February 30.
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    plausible(date.and_time(time).and_utc())
}

fn plausible(dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    use chrono::Datelike;
    (dt.year() >= MIN_PLAUSIBLE_YEAR).then_some(dt)
}

/// 12-hour clock when a meridiem is present, 24-hour otherwise.
fn clock_time(hour: u32, minute: u32, pm: Option<bool>) -> Option<NaiveTime> {
    let hour = match pm {
        Some(pm) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            match (hour, pm) {
                (12, false) => 0,
                (12, true) => 12,
                (h, false) => h,
                (h, true) => h + 12,
            }
        }
        None => hour,
    };
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn month_number(name: &str) -> Option<u32> {
    // Three-letter abbreviations plus the irregular "Sept".
    match name.to_ascii_lowercase().as_str() {
        "jan" | "january" => Some(1),
        "feb" | "february" => Some(2),
        "mar" | "march" => Some(3),
        "apr" | "april" => Some(4),
        "may" => Some(5),
        "jun" | "june" => Some(6),
        "jul" | "july" => Some(7),
        "aug" | "august" => Some(8),
        "sep" | "sept" | "september" => Some(9),
        "oct" | "october" => Some(10),
        "nov" | "november" => Some(11),
        "dec" | "december" => Some(12),
        _ => None,
    }
}
