//! Run configuration: environment variables with defaults, overridable from
//! the CLI. No module-level constants; everything the pipeline needs is
//! passed in explicitly so per-run overrides and tests stay cheap.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::FixedOffset;

/// The CSV comes from a mobile export in the user's home timezone, so the
/// default is that fixed zone, not the host's.
const DEFAULT_TIMEZONE: &str = "+09:00";
const DEFAULT_STATE_FILE: &str = "./data/upload_state.json";
const DEFAULT_STATE_MAX_ENTRIES: usize = 1000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF_SECONDS: f64 = 1.0;
const DEFAULT_API_BASE: &str = "https://connectapi.garmin.com";

#[derive(Debug, Clone)]
pub struct Config {
    /// Offset applied to timestamps that carry no zone information.
    pub default_timezone: FixedOffset,
    /// The offset as configured, for display and upload payloads.
    pub timezone_label: String,
    pub state_file_path: PathBuf,
    pub state_max_entries: usize,
    pub max_retries: u32,
    pub retry_backoff_seconds: f64,
    /// Whether partial upload failure fails the whole run. Either policy is
    /// defensible for a scheduled batch job, so it is an explicit setting.
    pub fail_on_upload_errors: bool,
    pub api_base: String,
    /// Pre-authenticated session token. Only required for live runs.
    pub api_token: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let timezone_label =
            std::env::var("DEFAULT_TIMEZONE").unwrap_or_else(|_| DEFAULT_TIMEZONE.to_string());
        let default_timezone = parse_utc_offset(&timezone_label)
            .context("DEFAULT_TIMEZONE is not a valid UTC offset")?;

        Ok(Self {
            default_timezone,
            timezone_label,
            state_file_path: PathBuf::from(
                std::env::var("STATE_FILE").unwrap_or_else(|_| DEFAULT_STATE_FILE.to_string()),
            ),
            state_max_entries: std::env::var("STATE_MAX_ENTRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_STATE_MAX_ENTRIES),
            max_retries: std::env::var("MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_RETRIES),
            retry_backoff_seconds: std::env::var("RETRY_BACKOFF_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RETRY_BACKOFF_SECONDS),
            fail_on_upload_errors: std::env::var("FAIL_ON_UPLOAD_ERRORS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            api_base: std::env::var("GARMIN_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            api_token: std::env::var("GARMIN_TOKEN").unwrap_or_default(),
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            default_timezone: parse_utc_offset(DEFAULT_TIMEZONE).unwrap(),
            timezone_label: DEFAULT_TIMEZONE.to_string(),
            state_file_path: PathBuf::from(DEFAULT_STATE_FILE),
            state_max_entries: DEFAULT_STATE_MAX_ENTRIES,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_seconds: 0.0,
            fail_on_upload_errors: false,
            api_base: "http://localhost:0".to_string(),
            api_token: "test-token".to_string(),
        }
    }
}

/// Parse a fixed UTC offset like `+09:00`, `-05:30`, `+0900` or `+9`.
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let s = raw.trim();
    let (sign, digits) = match s.chars().next() {
        Some('+') => (1, &s[1..]),
        Some('-') => (-1, &s[1..]),
        _ => (1, s),
    };

    let digits = digits.replace(':', "");
    let (hours, minutes): (i32, i32) = match digits.len() {
        1 | 2 => (digits.parse().context("Invalid offset hours")?, 0),
        3 | 4 => {
            let split = digits.len() - 2;
            (
                digits[..split].parse().context("Invalid offset hours")?,
                digits[split..].parse().context("Invalid offset minutes")?,
            )
        }
        _ => anyhow::bail!("Unrecognized UTC offset format: {raw}"),
    };

    if hours > 14 || minutes > 59 {
        anyhow::bail!("UTC offset out of range: {raw}");
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .with_context(|| format!("UTC offset out of range: {raw}"))
}
