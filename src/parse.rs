//! Tolerant cell-value parsing.
//!
//! Source exports are messy: quoted numbers, unit suffixes, comma decimal
//! separators, dot-separated dates, localized AM/PM markers. Parsing here is
//! deliberately permissive and pure: same input string plus same configured
//! offset always yields the same output. Failures return `None`; the
//! normalizer decides what a missing value means for the row.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};

/// Parse a numeric cell into `f64`.
///
/// Accepts surrounding quotes, a `kg` suffix, percent signs and thousands
/// separators. A single comma with no period present is a decimal separator
/// (European/Korean locales); otherwise commas are thousands separators.
/// Empty, `nan`, `none` or non-numeric residue yields `None`.
pub fn parse_number(raw: &str) -> Option<f64> {
    let mut s = raw
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_string();

    let lowered = s.to_lowercase();
    if lowered.is_empty() || lowered == "nan" || lowered == "none" || lowered == "null" {
        return None;
    }
    if let Some(stripped) = lowered.strip_suffix("kg") {
        s.truncate(stripped.len());
    }
    s = s.replace('%', "");
    s = s.trim().to_string();

    if s.contains(',') {
        if !s.contains('.') && s.matches(',').count() == 1 {
            s = s.replace(',', ".");
        } else {
            s = s.replace(',', "");
        }
    }

    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Candidate datetime formats tried in order, after text normalization.
/// Covers 24-hour, 12-hour with trailing or leading AM/PM, with and
/// without seconds.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %I:%M:%S %p",
    "%Y-%m-%d %I:%M %p",
    "%Y-%m-%d %p %I:%M:%S",
    "%Y-%m-%d %p %I:%M",
];

/// Parse a combined date or date+time string into a naive local datetime.
/// Date-only input defaults the time-of-day to midnight.
pub fn parse_local_datetime(raw: &str) -> Option<NaiveDateTime> {
    let s = normalize_datetime_text(raw);
    if s.is_empty() {
        return None;
    }

    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&s, format) {
            return Some(dt);
        }
    }

    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Resolve the timestamp for one row, in priority order: combined datetime
/// column, then date + time, then date alone (the date cell may itself carry
/// an embedded time in some exports). The configured fixed offset is applied
/// to whatever naive local datetime wins.
pub fn parse_row_instant(
    datetime: Option<&str>,
    date: Option<&str>,
    time: Option<&str>,
    default_offset: FixedOffset,
) -> Option<DateTime<FixedOffset>> {
    let datetime = datetime.map(str::trim).filter(|s| !s.is_empty());
    let date = date.map(str::trim).filter(|s| !s.is_empty());
    let time = time.map(str::trim).filter(|s| !s.is_empty());

    let mut candidates: Vec<String> = Vec::new();
    if let Some(dt) = datetime {
        candidates.push(dt.to_string());
    }
    if let Some(d) = date {
        if let Some(t) = time {
            candidates.push(format!("{d} {t}"));
        }
        candidates.push(d.to_string());
    }

    let naive = candidates.iter().find_map(|c| parse_local_datetime(c))?;
    default_offset.from_local_datetime(&naive).single()
}

/// Normalize separator and marker variants so a small fixed format table
/// can handle them: quotes stripped, localized AM/PM markers mapped,
/// dot/slash date separators mapped to dashes, whitespace collapsed.
fn normalize_datetime_text(raw: &str) -> String {
    let s = raw
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .replace("오전", "AM")
        .replace("오후", "PM");

    // Fractional seconds are cut before dots become date dashes; sub-minute
    // precision is discarded downstream anyway
    let s = s
        .split_whitespace()
        .map(strip_second_fraction)
        .collect::<Vec<_>>()
        .join(" ");

    s.replace('/', "-")
        .replace('.', "-")
        .trim_end_matches('-')
        .to_string()
}

/// Cut a trailing `.<digits>` fraction off a time-bearing token, so
/// `07:30:00.5` degrades to `07:30:00` instead of failing to parse.
/// Dotted date tokens carry no colon and pass through untouched.
fn strip_second_fraction(token: &str) -> &str {
    if !token.contains(':') {
        return token;
    }
    match token.split_once('.') {
        Some((head, tail)) if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) => {
            head
        }
        _ => token,
    }
}
