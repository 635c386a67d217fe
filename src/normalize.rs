//! Turns resolved raw rows into the canonical, deduplicated measurement set.
//!
//! Per row: resolve the timestamp and the weight; a row missing either, or
//! carrying a non-positive weight, is dropped and counted, never an error.
//! Surviving rows are deduplicated in-batch by key (first occurrence in
//! source order wins, matching re-export behavior) and sorted by instant
//! ascending with a stable sort so ties keep source order.

use std::collections::HashSet;

use chrono::FixedOffset;
use csv::StringRecord;

use crate::columns::ColumnMap;
use crate::measurement::{Measurement, MeasurementKey};
use crate::parse::{parse_number, parse_row_instant};

/// Per-file row accounting.
#[derive(Debug, Default, Clone, Copy)]
pub struct RowStats {
    /// Data rows seen in the file.
    pub parsed_rows: usize,
    /// Rows dropped for a missing/invalid timestamp or weight.
    pub skipped_rows: usize,
    /// Rows dropped as exact in-batch repeats.
    pub duplicate_rows: usize,
}

/// Normalize one file's rows into sorted, deduplicated measurements.
pub fn normalize_rows(
    records: &[StringRecord],
    cols: &ColumnMap,
    default_offset: FixedOffset,
) -> (Vec<Measurement>, RowStats) {
    let mut stats = RowStats::default();
    let mut seen: HashSet<MeasurementKey> = HashSet::new();
    let mut measurements: Vec<Measurement> = Vec::new();

    for record in records {
        stats.parsed_rows += 1;

        let cell = |idx: Option<usize>| idx.and_then(|i| record.get(i));
        let instant = parse_row_instant(
            cell(cols.datetime),
            cell(cols.date),
            cell(cols.time),
            default_offset,
        );
        let weight = record.get(cols.weight).and_then(parse_number);

        let (Some(instant), Some(weight)) = (instant, weight) else {
            stats.skipped_rows += 1;
            continue;
        };
        if weight <= 0.0 {
            stats.skipped_rows += 1;
            continue;
        }

        // Zero-valued composition fields mean "not provided" in the source
        let attributes = cols
            .attributes
            .iter()
            .filter_map(|(name, idx)| {
                record
                    .get(*idx)
                    .and_then(parse_number)
                    .filter(|v| *v > 0.0)
                    .map(|v| (name.clone(), v))
            })
            .collect();

        let measurement = Measurement {
            instant,
            weight_kg: weight,
            attributes,
        };

        if !seen.insert(measurement.key()) {
            stats.duplicate_rows += 1;
            continue;
        }
        measurements.push(measurement);
    }

    // Stable: equal instants keep their source order
    measurements.sort_by_key(|m| m.instant);

    (measurements, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns;
    use chrono::TimeZone;

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn korean_cols() -> ColumnMap {
        columns::resolve(&StringRecord::from(vec!["날짜", "시간", "몸무게", "체지방률"]))
            .unwrap()
    }

    fn row(cells: &[&str]) -> StringRecord {
        StringRecord::from(cells.to_vec())
    }

    #[test]
    fn test_normalize_valid_rows_sorted_chronologically() {
        let records = vec![
            row(&["2024.01.02", "08:00:00", "70.4", "15.0"]),
            row(&["2024.01.01", "07:30:00", "70.5", "15.2"]),
            row(&["2024.01.01", "22:15:00", "70.2", ""]),
        ];
        let (out, stats) = normalize_rows(&records, &korean_cols(), kst());

        assert_eq!(out.len(), 3);
        assert_eq!(stats.parsed_rows, 3);
        assert_eq!(stats.skipped_rows, 0);
        assert_eq!(
            out[0].instant,
            kst().with_ymd_and_hms(2024, 1, 1, 7, 30, 0).unwrap()
        );
        assert_eq!(
            out[2].instant,
            kst().with_ymd_and_hms(2024, 1, 2, 8, 0, 0).unwrap()
        );
        assert_eq!(out[0].attributes.get("body_fat_percent"), Some(&15.2));
        assert!(out[1].attributes.is_empty());
    }

    #[test]
    fn test_normalize_drops_invalid_rows() {
        let records = vec![
            row(&["2024.01.01", "07:30:00", "70.5", ""]),
            row(&["", "07:30:00", "70.5", ""]),          // no date
            row(&["2024.01.01", "08:00:00", "", ""]),    // no weight
            row(&["2024.01.01", "09:00:00", "0", ""]),   // zero weight
            row(&["2024.01.01", "10:00:00", "-5", ""]),  // negative weight
            row(&["garbage", "10:00:00", "70.1", ""]),   // bad date
        ];
        let (out, stats) = normalize_rows(&records, &korean_cols(), kst());

        assert_eq!(out.len(), 1);
        assert_eq!(stats.skipped_rows, 5);
        assert_eq!(stats.duplicate_rows, 0);
    }

    #[test]
    fn test_normalize_dedup_keeps_first_occurrence() {
        let records = vec![
            row(&["2024.01.01", "07:30:00", "70.5", "15.2"]),
            row(&["2024.01.01", "07:30:00", "70.5", "14.0"]), // same key, later row
            row(&["2024.01.01", "07:30:30", "70.5", ""]),     // same minute, same key
        ];
        let (out, stats) = normalize_rows(&records, &korean_cols(), kst());

        assert_eq!(out.len(), 1);
        assert_eq!(stats.duplicate_rows, 2);
        // First occurrence's attributes survive
        assert_eq!(out[0].attributes.get("body_fat_percent"), Some(&15.2));
    }

    #[test]
    fn test_normalize_distinct_keys_all_kept() {
        // n rows, k distinct keys => exactly k records out
        let records = vec![
            row(&["2024.01.01", "07:30:00", "70.5", ""]),
            row(&["2024.01.01", "07:30:00", "70.6", ""]), // different weight
            row(&["2024.01.01", "07:31:00", "70.5", ""]), // different minute
            row(&["2024.01.01", "07:30:00", "70.5", ""]), // repeat of the first
        ];
        let (out, stats) = normalize_rows(&records, &korean_cols(), kst());

        assert_eq!(out.len(), 3);
        assert_eq!(stats.duplicate_rows, 1);
    }

    #[test]
    fn test_normalize_zero_attribute_treated_as_absent() {
        let records = vec![row(&["2024.01.01", "07:30:00", "70.5", "0"])];
        let (out, _) = normalize_rows(&records, &korean_cols(), kst());
        assert!(out[0].attributes.is_empty());
    }

    #[test]
    fn test_normalize_combined_datetime_column() {
        let cols =
            columns::resolve(&StringRecord::from(vec!["KST", "체중", "체지방률"])).unwrap();
        let records = vec![
            row(&["2025-09-18 07:45:00", "70.1", "15.0"]),
            row(&["2025-09-18 21:10:30", "70.3", "15.2"]),
        ];
        let (out, stats) = normalize_rows(&records, &cols, kst());

        assert_eq!(out.len(), 2);
        assert_eq!(stats.skipped_rows, 0);
        assert_eq!(
            out[1].instant,
            kst().with_ymd_and_hms(2025, 9, 18, 21, 10, 30).unwrap()
        );
    }

    #[test]
    fn test_normalize_empty_input() {
        let (out, stats) = normalize_rows(&[], &korean_cols(), kst());
        assert!(out.is_empty());
        assert_eq!(stats.parsed_rows, 0);
    }
}
