//! Per-record upload drive: outcome classification, retry with exponential
//! backoff, dry-run simulation and run-level counters.
//!
//! The wire format of the remote weight endpoint is the adapter's problem;
//! this module only sees the `Uploader` contract. Records are processed in
//! chronological order (the batch arrives sorted) so the remote service sees
//! insertions in causal order. One record's failure never aborts the batch.

use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use tokio::time::sleep;

use crate::measurement::Measurement;
use crate::state::{RemoteEntry, UploadState};

/// Classified result of one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The remote recorded the measurement.
    Success,
    /// The remote already has this reading. Treated as success: idempotence
    /// is preserved at this boundary.
    AlreadyExists,
    /// Plausibly resolved by retrying (network blip, rate limit, 5xx).
    TransientFailure(String),
    /// Retrying will not help (malformed-request equivalent).
    PermanentFailure(String),
}

/// Capability handle for the remote weight API. One adapter implements the
/// current remote contract; the pipeline never inspects wire details.
pub trait Uploader {
    /// Attempt to record one measurement remotely.
    fn upload(
        &self,
        measurement: &Measurement,
    ) -> impl std::future::Future<Output = UploadOutcome> + Send;

    /// Entries already present remotely within a date range, for the
    /// secondary duplicate check.
    fn existing_entries(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl std::future::Future<Output = Result<Vec<RemoteEntry>>> + Send;
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Simulate: classify and count without invoking the uploader.
    pub dry_run: bool,
    /// Total attempts per record, transient retries included.
    pub max_retries: u32,
    /// Base delay, doubled per attempt.
    pub retry_backoff_seconds: f64,
}

/// Counters for one file's trip through the pipeline; merged across files
/// into the run summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunResult {
    pub parsed_rows: usize,
    pub skipped_rows: usize,
    pub duplicate_rows: usize,
    pub already_uploaded: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl RunResult {
    pub fn merge(&mut self, other: &RunResult) {
        self.parsed_rows += other.parsed_rows;
        self.skipped_rows += other.skipped_rows;
        self.duplicate_rows += other.duplicate_rows;
        self.already_uploaded += other.already_uploaded;
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

/// Ceiling on a single backoff wait; keeps a large attempt budget from
/// producing hour-long sleeps.
const MAX_BACKOFF_SECONDS: f64 = 60.0;

/// Exponential backoff delay for the given attempt number (1-based).
/// The exponent is clamped so a large configured attempt ceiling can never
/// overflow into a negative or non-finite delay.
fn backoff_delay(base_seconds: f64, attempt: u32) -> f64 {
    let exponent = i32::try_from(attempt.saturating_sub(1))
        .unwrap_or(i32::MAX)
        .min(30);
    (base_seconds * 2f64.powi(exponent)).min(MAX_BACKOFF_SECONDS)
}

/// Upload a filtered batch record by record, oldest first.
///
/// `Success` and `AlreadyExists` mark the key in state so later files and
/// later runs skip it. Transient failures retry with exponential backoff up
/// to the attempt ceiling. In dry-run mode every candidate counts as a
/// simulated success and the uploader is never invoked; keys are still
/// marked in memory so duplicate rows across files are filtered, but the
/// caller must not persist state afterwards.
pub async fn upload_batch<U: Uploader>(
    uploader: &U,
    batch: &[Measurement],
    state: &mut UploadState,
    opts: &UploadOptions,
) -> RunResult {
    let mut result = RunResult::default();

    for measurement in batch {
        result.attempted += 1;
        let stamp = measurement.instant.format("%Y-%m-%d %H:%M");

        if opts.dry_run {
            println!(
                "  ✓ (dry run) would upload {} {:.2} kg",
                stamp, measurement.weight_kg
            );
            state.mark(measurement.key());
            result.succeeded += 1;
            continue;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match uploader.upload(measurement).await {
                UploadOutcome::Success => {
                    println!("  ✓ Uploaded {} {:.2} kg", stamp, measurement.weight_kg);
                    state.mark(measurement.key());
                    result.succeeded += 1;
                    break;
                }
                UploadOutcome::AlreadyExists => {
                    println!(
                        "  ✓ Already recorded {} {:.2} kg",
                        stamp, measurement.weight_kg
                    );
                    state.mark(measurement.key());
                    result.succeeded += 1;
                    break;
                }
                UploadOutcome::TransientFailure(reason) if attempt < opts.max_retries => {
                    let delay = backoff_delay(opts.retry_backoff_seconds, attempt);
                    eprintln!(
                        "  ⚠ Transient failure for {} (attempt {}/{}): {}. Retrying in {:.1}s",
                        stamp, attempt, opts.max_retries, reason, delay
                    );
                    sleep(Duration::from_secs_f64(delay)).await;
                }
                UploadOutcome::TransientFailure(reason) => {
                    eprintln!(
                        "  ✗ Giving up on {} after {} attempts: {}",
                        stamp, attempt, reason
                    );
                    result.failed += 1;
                    break;
                }
                UploadOutcome::PermanentFailure(reason) => {
                    eprintln!("  ✗ Permanent failure for {}: {}", stamp, reason);
                    result.failed += 1;
                    break;
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns;
    use crate::normalize::normalize_rows;
    use crate::state::{self, filter_new};
    use chrono::{FixedOffset, TimeZone};
    use csv::StringRecord;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn measurement(day: u32, hour: u32, weight: f64) -> Measurement {
        Measurement {
            instant: kst().with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap(),
            weight_kg: weight,
            attributes: BTreeMap::new(),
        }
    }

    fn no_wait() -> UploadOptions {
        UploadOptions {
            dry_run: false,
            max_retries: 3,
            retry_backoff_seconds: 0.0,
        }
    }

    /// Scripted uploader: pops the next outcome per call, records call count.
    struct MockUploader {
        outcomes: Mutex<Vec<UploadOutcome>>,
        calls: Mutex<usize>,
    }

    impl MockUploader {
        fn new(mut outcomes: Vec<UploadOutcome>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl Uploader for MockUploader {
        async fn upload(&self, _measurement: &Measurement) -> UploadOutcome {
            *self.calls.lock().unwrap() += 1;
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(UploadOutcome::Success)
        }

        async fn existing_entries(
            &self,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<RemoteEntry>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_success_marks_state() {
        let uploader = MockUploader::new(vec![UploadOutcome::Success]);
        let mut state = UploadState::default();
        let batch = vec![measurement(1, 7, 70.5)];

        let result = upload_batch(&uploader, &batch, &mut state, &no_wait()).await;

        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 0);
        assert!(state.contains(&batch[0].key()));
    }

    #[tokio::test]
    async fn test_already_exists_counts_as_success() {
        let uploader = MockUploader::new(vec![UploadOutcome::AlreadyExists]);
        let mut state = UploadState::default();
        let batch = vec![measurement(1, 7, 70.5)];

        let result = upload_batch(&uploader, &batch, &mut state, &no_wait()).await;

        assert_eq!(result.succeeded, 1);
        assert!(state.contains(&batch[0].key()));
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let uploader = MockUploader::new(vec![
            UploadOutcome::TransientFailure("timeout".into()),
            UploadOutcome::TransientFailure("timeout".into()),
            UploadOutcome::Success,
        ]);
        let mut state = UploadState::default();
        let batch = vec![measurement(1, 7, 70.5)];

        let result = upload_batch(&uploader, &batch, &mut state, &no_wait()).await;

        assert_eq!(uploader.call_count(), 3);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_exhausts_attempts() {
        let uploader = MockUploader::new(vec![
            UploadOutcome::TransientFailure("503".into()),
            UploadOutcome::TransientFailure("503".into()),
            UploadOutcome::TransientFailure("503".into()),
        ]);
        let mut state = UploadState::default();
        let batch = vec![measurement(1, 7, 70.5)];

        let result = upload_batch(&uploader, &batch, &mut state, &no_wait()).await;

        assert_eq!(uploader.call_count(), 3);
        assert_eq!(result.failed, 1);
        assert!(!state.contains(&batch[0].key()));
    }

    #[tokio::test]
    async fn test_transient_failures_with_large_attempt_ceiling() {
        // MAX_RETRIES is env-supplied; a generous value must exhaust
        // cleanly instead of blowing up in the delay arithmetic
        let uploader = MockUploader::new(vec![
            UploadOutcome::TransientFailure("503".into());
            40
        ]);
        let mut state = UploadState::default();
        let batch = vec![measurement(1, 7, 70.5)];
        let opts = UploadOptions {
            max_retries: 40,
            ..no_wait()
        };

        let result = upload_batch(&uploader, &batch, &mut state, &opts).await;

        assert_eq!(uploader.call_count(), 40);
        assert_eq!(result.failed, 1);
        assert!(!state.contains(&batch[0].key()));
    }

    #[test]
    fn test_backoff_delay_doubles_then_caps() {
        assert_eq!(backoff_delay(1.0, 1), 1.0);
        assert_eq!(backoff_delay(1.0, 2), 2.0);
        assert_eq!(backoff_delay(1.0, 3), 4.0);
        assert_eq!(backoff_delay(1.0, 7), MAX_BACKOFF_SECONDS);
    }

    #[test]
    fn test_backoff_delay_never_negative_for_high_attempts() {
        for attempt in [31, 32, 33, 64, u32::MAX] {
            let delay = backoff_delay(1.0, attempt);
            assert!(delay.is_finite());
            assert!(delay >= 0.0);
            assert!(delay <= MAX_BACKOFF_SECONDS);
        }
        assert_eq!(backoff_delay(0.0, 40), 0.0);
    }

    #[tokio::test]
    async fn test_permanent_failure_no_retry() {
        let uploader = MockUploader::new(vec![UploadOutcome::PermanentFailure("400".into())]);
        let mut state = UploadState::default();
        let batch = vec![measurement(1, 7, 70.5)];

        let result = upload_batch(&uploader, &batch, &mut state, &no_wait()).await;

        assert_eq!(uploader.call_count(), 1);
        assert_eq!(result.failed, 1);
    }

    #[tokio::test]
    async fn test_one_failure_never_aborts_the_batch() {
        let uploader = MockUploader::new(vec![
            UploadOutcome::PermanentFailure("400".into()),
            UploadOutcome::Success,
        ]);
        let mut state = UploadState::default();
        let batch = vec![measurement(1, 7, 70.5), measurement(2, 8, 70.4)];

        let result = upload_batch(&uploader, &batch, &mut state, &no_wait()).await;

        assert_eq!(result.attempted, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.succeeded, 1);
    }

    #[tokio::test]
    async fn test_dry_run_never_invokes_uploader() {
        let uploader = MockUploader::new(vec![]);
        let mut state = UploadState::default();
        let batch = vec![measurement(1, 7, 70.5), measurement(2, 8, 70.4)];
        let opts = UploadOptions {
            dry_run: true,
            ..no_wait()
        };

        let result = upload_batch(&uploader, &batch, &mut state, &opts).await;

        assert_eq!(uploader.call_count(), 0);
        assert_eq!(result.succeeded, 2);
        // Keys are marked in memory so later files in the run are filtered
        assert!(state.contains(&batch[0].key()));
    }

    // -------------------------------------------------------------------------
    // END-TO-END SCENARIOS
    // -------------------------------------------------------------------------

    fn sample_records() -> (Vec<StringRecord>, crate::columns::ColumnMap) {
        let cols =
            columns::resolve(&StringRecord::from(vec!["날짜", "시간", "몸무게"])).unwrap();
        let records = vec![
            StringRecord::from(vec!["2024.01.01", "07:30:00", "70.5"]),
            StringRecord::from(vec!["2024.01.01", "22:15:00", "70.2"]),
            StringRecord::from(vec!["2024.01.02", "08:00:00", "70.4"]),
        ];
        (records, cols)
    }

    #[tokio::test]
    async fn test_three_row_csv_uploads_three_records() {
        let (records, cols) = sample_records();
        let (measurements, stats) = normalize_rows(&records, &cols, kst());
        assert_eq!(measurements.len(), 3);
        assert_eq!(stats.skipped_rows, 0);
        assert!(measurements.windows(2).all(|w| w[0].instant <= w[1].instant));

        let mut state = UploadState::default();
        let (fresh, skipped) = filter_new(measurements, &state);
        assert_eq!(skipped, 0);

        let uploader = MockUploader::new(vec![
            UploadOutcome::Success,
            UploadOutcome::Success,
            UploadOutcome::Success,
        ]);
        let result = upload_batch(&uploader, &fresh, &mut state, &no_wait()).await;

        assert_eq!(result.attempted, 3);
        assert_eq!(result.succeeded, 3);
        assert_eq!(state.uploaded_keys.len(), 3);
    }

    #[tokio::test]
    async fn test_second_run_with_same_file_uploads_nothing() {
        let (records, cols) = sample_records();
        let mut state = UploadState::default();

        // First run
        let (measurements, _) = normalize_rows(&records, &cols, kst());
        let (fresh, _) = filter_new(measurements, &state);
        let uploader = MockUploader::new(vec![]);
        upload_batch(&uploader, &fresh, &mut state, &no_wait()).await;
        assert_eq!(state.uploaded_keys.len(), 3);

        // Second run against the persisted state
        let (measurements, _) = normalize_rows(&records, &cols, kst());
        let (fresh, skipped) = filter_new(measurements, &state);
        assert_eq!(skipped, 3);
        assert!(fresh.is_empty());

        let uploader = MockUploader::new(vec![]);
        let calls_before = uploader.call_count();
        let result = upload_batch(&uploader, &fresh, &mut state, &no_wait()).await;
        assert_eq!(uploader.call_count(), calls_before);
        assert_eq!(result.attempted, 0);
    }

    #[tokio::test]
    async fn test_persisted_state_round_trip_filters_second_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let (records, cols) = sample_records();

        let mut state = UploadState::default();
        let (measurements, _) = normalize_rows(&records, &cols, kst());
        let (fresh, _) = filter_new(measurements, &state);
        let uploader = MockUploader::new(vec![]);
        upload_batch(&uploader, &fresh, &mut state, &no_wait()).await;
        state::save(&path, &mut state, 1000).await.unwrap();

        let reloaded = state::load(&path).await;
        let (measurements, _) = normalize_rows(&records, &cols, kst());
        let (fresh, skipped) = filter_new(measurements, &reloaded);
        assert!(fresh.is_empty());
        assert_eq!(skipped, 3);
    }
}
