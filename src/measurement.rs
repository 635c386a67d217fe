//! Canonical measurement record and its deduplication key.
//!
//! A `Measurement` is built once per valid source row and is immutable
//! afterwards. Identity for dedup purposes is the `MeasurementKey`: the
//! instant truncated to the minute plus the weight at fixed precision, so
//! differing sub-minute precision between exports never produces spurious
//! duplicates.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Timelike};

/// Strftime shape of the instant half of a key. Seconds are always zero
/// after truncation; the explicit offset keeps the instant unambiguous.
const KEY_INSTANT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// One body-weight reading from a source file.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Authoritative moment of the reading.
    pub instant: DateTime<FixedOffset>,
    /// Body mass in kilograms, always > 0 once normalized.
    pub weight_kg: f64,
    /// Optional body-composition values (body fat %, muscle mass, ...).
    /// Absent fields are omitted, never stored as zero.
    pub attributes: BTreeMap<String, f64>,
}

impl Measurement {
    pub fn key(&self) -> MeasurementKey {
        MeasurementKey::new(self.instant, self.weight_kg)
    }
}

/// Stable identity for a measurement: `<minute-truncated instant>|<weight>`.
///
/// Two measurements with the same key are the same real-world reading.
/// The string form is what gets persisted in the state file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeasurementKey(String);

impl MeasurementKey {
    pub fn new(instant: DateTime<FixedOffset>, weight_kg: f64) -> Self {
        let truncated = truncate_to_minute(instant);
        Self(format!(
            "{}|{:.3}",
            truncated.format(KEY_INSTANT_FORMAT),
            weight_kg
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Parse the instant back out of a persisted key string. Returns `None`
    /// for malformed keys; pruning treats those as oldest.
    pub fn parse_instant(key: &str) -> Option<DateTime<FixedOffset>> {
        let (instant_part, _weight_part) = key.split_once('|')?;
        DateTime::parse_from_str(instant_part, KEY_INSTANT_FORMAT).ok()
    }
}

/// Drop seconds and sub-second precision. Manual weigh-in entries carry no
/// meaningful sub-minute information.
fn truncate_to_minute(instant: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    instant
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(instant)
}
