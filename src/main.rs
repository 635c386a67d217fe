//! Weight Uploader - pushes body-weight CSV exports to Garmin Connect
//!
//! Responsibilities:
//! - Decode and read one or more exported CSV files (UTF-8 or EUC-KR)
//! - Resolve Korean/English column headers to canonical fields
//! - Normalize rows into deduplicated, chronologically sorted measurements
//! - Filter out measurements already uploaded (local state, optional remote check)
//! - Upload the rest with retry/backoff and persist the updated state
//!
//! Usage:
//!   # Live upload:
//!   GARMIN_TOKEN=... cargo run -- export1.csv export2.csv
//!
//!   # Preview without network or state changes:
//!   cargo run -- --dry-run export1.csv
//!
//!   # Distrusted/fresh state file (e.g. CI cache miss):
//!   GARMIN_TOKEN=... cargo run -- --remote-check export1.csv

mod columns;
mod config;
mod garmin;
mod measurement;
mod normalize;
mod parse;
mod state;
mod upload;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use csv::StringRecord;
use tokio::fs;

use crate::config::{parse_utc_offset, Config};
use crate::garmin::GarminUploader;
use crate::normalize::normalize_rows;
use crate::upload::{upload_batch, RunResult, UploadOptions, Uploader};

#[derive(Parser, Debug)]
#[command(
    name = "weight-uploader",
    about = "Uploads body-weight CSV exports to Garmin Connect"
)]
struct Args {
    /// CSV files to process
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Dry run - no uploads, no state changes
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Also query the remote service for existing entries in the batch's
    /// date span (secondary duplicate check)
    #[arg(long, default_value = "false")]
    remote_check: bool,

    /// State file path (overrides STATE_FILE)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Default UTC offset for zoneless timestamps, e.g. +09:00
    /// (overrides DEFAULT_TIMEZONE)
    #[arg(long)]
    timezone: Option<String>,
}

/// Decode raw CSV bytes: UTF-8 first (BOM tolerated), then EUC-KR, since
/// older exports arrive as cp949.
fn decode_csv_bytes(bytes: &[u8]) -> String {
    let (text, _, had_errors) = encoding_rs::UTF_8.decode(bytes);
    if !had_errors {
        return text.into_owned();
    }
    let (text, _, _) = encoding_rs::EUC_KR.decode(bytes);
    text.into_owned()
}

/// Run one file through the full pipeline. A structural problem (missing
/// required column, unreadable file) is fatal for this file only.
async fn process_file<U: Uploader>(
    path: &Path,
    config: &Config,
    uploader: &U,
    run_state: &mut state::UploadState,
    opts: &UploadOptions,
    remote_check: bool,
) -> Result<RunResult> {
    let bytes = fs::read(path).await.context("Failed to read input file")?;
    let content = decode_csv_bytes(&bytes);
    let content = content.strip_prefix('\u{feff}').unwrap_or(&content);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers = reader
        .headers()
        .context("Failed to read CSV headers")?
        .clone();
    let cols = columns::resolve(&headers)?;

    let mut result = RunResult::default();
    let mut records: Vec<StringRecord> = Vec::new();
    for row in reader.records() {
        match row {
            Ok(record) => records.push(record),
            Err(e) => {
                eprintln!("  Warning: skipping malformed row: {e}");
                result.skipped_rows += 1;
            }
        }
    }

    let (measurements, stats) = normalize_rows(&records, &cols, config.default_timezone);
    result.parsed_rows += stats.parsed_rows;
    result.skipped_rows += stats.skipped_rows;
    result.duplicate_rows += stats.duplicate_rows;
    println!(
        "  Rows: {} parsed, {} skipped, {} in-batch duplicates",
        stats.parsed_rows, stats.skipped_rows, stats.duplicate_rows
    );

    let (fresh, skipped_known) = state::filter_new(measurements, run_state);
    result.already_uploaded += skipped_known;

    // Secondary check against the remote, advisory only: a failed fetch is
    // a warning, and the duplicate-status upload response still backstops us
    let fresh = if remote_check && !opts.dry_run && !fresh.is_empty() {
        let start = fresh[0].instant.date_naive();
        let end = fresh[fresh.len() - 1].instant.date_naive();
        match uploader.existing_entries(start, end).await {
            Ok(existing) => {
                let (kept, skipped_remote) = state::filter_against_remote(fresh, &existing);
                if skipped_remote > 0 {
                    println!("  Remote check: {skipped_remote} already recorded");
                }
                result.already_uploaded += skipped_remote;
                kept
            }
            Err(e) => {
                eprintln!("  Warning: remote duplicate check failed: {e:#}");
                fresh
            }
        }
    } else {
        fresh
    };

    println!(
        "  New measurements: {} ({} previously uploaded)",
        fresh.len(),
        result.already_uploaded
    );

    let report = upload_batch(uploader, &fresh, run_state, opts).await;
    result.merge(&report);

    Ok(result)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(path) = args.state_file {
        config.state_file_path = path;
    }
    if let Some(tz) = &args.timezone {
        config.default_timezone =
            parse_utc_offset(tz).context("Invalid --timezone offset")?;
        config.timezone_label = tz.clone();
    }

    println!("=== Weight Uploader ===");
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });
    println!("Timezone: {}", config.timezone_label);
    println!("State file: {}", config.state_file_path.display());

    if !args.dry_run && config.api_token.is_empty() {
        anyhow::bail!("GARMIN_TOKEN env var missing (required for live uploads)");
    }

    let mut run_state = state::load(&config.state_file_path).await;
    println!("Known uploaded keys: {}", run_state.uploaded_keys.len());

    let uploader = GarminUploader::new(&config)?;
    let opts = UploadOptions {
        dry_run: args.dry_run,
        max_retries: config.max_retries,
        retry_backoff_seconds: config.retry_backoff_seconds,
    };

    let mut totals = RunResult::default();
    let mut failed_files = 0usize;

    for path in &args.files {
        println!("\n[{}]", path.display());
        match process_file(
            path,
            &config,
            &uploader,
            &mut run_state,
            &opts,
            args.remote_check,
        )
        .await
        {
            Ok(result) => totals.merge(&result),
            Err(e) => {
                eprintln!("  ✗ Failed: {e:#}");
                failed_files += 1;
            }
        }
    }

    if args.dry_run {
        println!("\nDry run - state file not updated");
    } else {
        state::save(
            &config.state_file_path,
            &mut run_state,
            config.state_max_entries,
        )
        .await?;
        println!("\nState saved: {}", config.state_file_path.display());
    }

    println!("\n=== Upload Summary ===");
    println!("Files processed: {} ({} failed)", args.files.len(), failed_files);
    println!("Rows parsed: {}", totals.parsed_rows);
    println!("Rows skipped: {}", totals.skipped_rows);
    println!("In-batch duplicates: {}", totals.duplicate_rows);
    println!("Previously uploaded: {}", totals.already_uploaded);
    println!("Uploads attempted: {}", totals.attempted);
    println!("Uploads succeeded: {}", totals.succeeded);
    println!("Uploads failed: {}", totals.failed);

    if config.fail_on_upload_errors && (totals.failed > 0 || failed_files > 0) {
        anyhow::bail!(
            "{} upload(s) and {} file(s) failed",
            totals.failed,
            failed_files
        );
    }

    Ok(())
}
