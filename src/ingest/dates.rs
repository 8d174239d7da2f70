use std::sync::OnceLock;

use chrono::{Duration, NaiveDate};
use regex::Regex;

use crate::ingest::decode::CellValue;

// Serial day 0 of the 1900 date system. The off-by-two epoch absorbs the
// historical Lotus leap-year bug, so serial 45678 lands on 2025-01-21.
const SERIAL_EPOCH: (i32, u32, u32) = (1899, 12, 30);
// Serial for 9999-12-31; anything past it cannot render as a timestamp.
const MAX_SERIAL: f64 = 2_958_465.0;

fn iso_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(\d{4})-(\d{1,2})-(\d{1,2})(?:[ T](\d{1,2}):(\d{1,2})(?::(\d{1,2}))?)?$",
        )
        .expect("iso pattern compiles")
    })
}

fn dmy_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(\d{1,2})[/-](\d{1,2})[/-](\d{4})(?:\s+(\d{1,2}):(\d{1,2})(?::(\d{1,2}))?)?$",
        )
        .expect("day-first pattern compiles")
    })
}

/// Normalizes a last-access cell to `YYYY-MM-DD HH:mm:ss`. The fixed-width,
/// zero-padded form makes lexicographic order match chronological order.
///
/// Returns `None` when nothing parses; callers must keep that distinct from
/// any real timestamp, a missing access date is not day zero.
pub fn normalize_timestamp(cell: &CellValue) -> Option<String> {
    match cell {
        CellValue::Empty => None,
        CellValue::Number(n) => from_serial(*n),
        CellValue::Text(t) => from_text(t),
    }
}

fn from_text(raw: &str) -> Option<String> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(serial) = t.parse::<f64>() {
        return from_serial(serial);
    }
    if let Some(caps) = iso_re().captures(t) {
        return build(
            cap_i32(&caps, 1),
            cap_u32(&caps, 2),
            cap_u32(&caps, 3),
            cap_u32(&caps, 4),
            cap_u32(&caps, 5),
            cap_u32(&caps, 6),
        );
    }
    if let Some(caps) = dmy_re().captures(t) {
        // Day-first regional order: 21/01/2025, never 01/21/2025.
        return build(
            cap_i32(&caps, 3),
            cap_u32(&caps, 2),
            cap_u32(&caps, 1),
            cap_u32(&caps, 4),
            cap_u32(&caps, 5),
            cap_u32(&caps, 6),
        );
    }
    None
}

fn from_serial(serial: f64) -> Option<String> {
    if !serial.is_finite() || serial <= 0.0 || serial > MAX_SERIAL {
        return None;
    }
    let days = serial.floor();
    let mut secs = ((serial - days) * 86_400.0).round() as i64;
    let (ey, em, ed) = SERIAL_EPOCH;
    let mut date = NaiveDate::from_ymd_opt(ey, em, ed)? + Duration::days(days as i64);
    if secs >= 86_400 {
        date += Duration::days(1);
        secs -= 86_400;
    }
    Some(format!(
        "{} {:02}:{:02}:{:02}",
        date.format("%Y-%m-%d"),
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    ))
}

fn build(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> Option<String> {
    // Calendar validation happens here: 31/02 is rejected, not clamped.
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    if hour > 23 || minute > 59 || second > 59 {
        return None;
    }
    Some(format!(
        "{} {:02}:{:02}:{:02}",
        date.format("%Y-%m-%d"),
        hour,
        minute,
        second
    ))
}

fn cap_i32(caps: &regex::Captures<'_>, i: usize) -> i32 {
    caps.get(i)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn cap_u32(caps: &regex::Captures<'_>, i: usize) -> u32 {
    caps.get(i)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}
