//! Header resolution: maps the actual column names of an export (Korean or
//! English) to the canonical semantic fields the pipeline reads.
//!
//! Matching is case-insensitive and ignores whitespace and punctuation, so
//! `몸무게`, `Weight`, `weight_kg` and `몸무게(kg)` all resolve the same way.
//! A file missing its weight column, or missing both a date and a combined
//! datetime column, is rejected outright.

use anyhow::Result;
use csv::StringRecord;

/// Known aliases per canonical field, stored pre-normalized.
const DATETIME_ALIASES: &[&str] = &["kst", "datetime", "timestamp", "날짜시간"];
const DATE_ALIASES: &[&str] = &["날짜", "date"];
const TIME_ALIASES: &[&str] = &["시간", "time"];
const WEIGHT_ALIASES: &[&str] = &["몸무게", "체중", "weight", "weightkg"];

/// Body-composition fields are an open set; each entry maps a canonical
/// attribute name to its known header aliases.
const ATTRIBUTE_ALIASES: &[(&str, &[&str])] = &[
    ("body_fat_percent", &["체지방률", "체지방", "bodyfat", "fatpercent"]),
    ("body_water_percent", &["총체수분", "체수분", "bodywater", "hydration"]),
    ("bone_mass_kg", &["골량", "bonemass"]),
    ("muscle_mass_kg", &["근육량", "musclemass"]),
    ("bmr_kcal", &["기본대사율", "기초대사량", "bmr", "basalmetabolicrate"]),
    ("bmi", &["bmi", "체질량지수"]),
];

/// Resolved column indexes for one source table.
#[derive(Debug)]
pub struct ColumnMap {
    pub datetime: Option<usize>,
    pub date: Option<usize>,
    pub time: Option<usize>,
    pub weight: usize,
    /// (canonical attribute name, column index)
    pub attributes: Vec<(String, usize)>,
}

/// Normalize a header for comparison: lowercase, alphanumeric only.
fn normalize_header(header: &str) -> String {
    header
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Find the first header matching any of the candidate aliases, skipping
/// columns already claimed by an earlier field.
fn find_column(
    normalized: &[String],
    candidates: &[&str],
    claimed: &[usize],
) -> Option<usize> {
    for (idx, header) in normalized.iter().enumerate() {
        if header.is_empty() || claimed.contains(&idx) {
            continue;
        }
        for candidate in candidates {
            if header == candidate || header.contains(candidate) {
                return Some(idx);
            }
        }
    }
    None
}

/// Resolve the headers of one file into a `ColumnMap`.
///
/// The combined datetime column is claimed first so that a `datetime` header
/// never doubles as the `date` or `time` column.
pub fn resolve(headers: &StringRecord) -> Result<ColumnMap> {
    let normalized: Vec<String> = headers.iter().map(normalize_header).collect();
    let mut claimed: Vec<usize> = Vec::new();

    let datetime = find_column(&normalized, DATETIME_ALIASES, &claimed);
    if let Some(idx) = datetime {
        claimed.push(idx);
    }
    let date = find_column(&normalized, DATE_ALIASES, &claimed);
    if let Some(idx) = date {
        claimed.push(idx);
    }
    let time = find_column(&normalized, TIME_ALIASES, &claimed);
    if let Some(idx) = time {
        claimed.push(idx);
    }

    let weight = find_column(&normalized, WEIGHT_ALIASES, &claimed);
    let Some(weight) = weight else {
        anyhow::bail!(
            "AMBIGUITY: no weight column found. Expected one of: 몸무게, 체중, weight. Headers: {:?}",
            headers.iter().collect::<Vec<_>>()
        );
    };
    claimed.push(weight);

    if datetime.is_none() && date.is_none() {
        anyhow::bail!(
            "AMBIGUITY: no date or datetime column found. Expected one of: 날짜, date, kst, datetime. Headers: {:?}",
            headers.iter().collect::<Vec<_>>()
        );
    }

    let mut attributes = Vec::new();
    for (canonical, aliases) in ATTRIBUTE_ALIASES {
        if let Some(idx) = find_column(&normalized, aliases, &claimed) {
            claimed.push(idx);
            attributes.push(((*canonical).to_string(), idx));
        }
    }

    Ok(ColumnMap {
        datetime,
        date,
        time,
        weight,
        attributes,
    })
}
