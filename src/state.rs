//! Durable record of previously uploaded measurement keys.
//!
//! The state file is advisory, not authoritative: the remote service absorbs
//! re-delivery via its duplicate handling, so a missing or corrupt file is
//! never fatal. It only costs some redundant upload attempts. The file is a
//! bounded history: once the cap is exceeded the chronologically oldest keys
//! are evicted first.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::measurement::{Measurement, MeasurementKey};

pub const STATE_VERSION: u32 = 1;

/// Persisted shape: `{"version": 1, "saved_at": "...", "uploaded_keys": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub uploaded_keys: Vec<String>,
}

impl Default for UploadState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            uploaded_keys: Vec::new(),
        }
    }
}

impl UploadState {
    pub fn contains(&self, key: &MeasurementKey) -> bool {
        self.uploaded_keys.iter().any(|k| k == key.as_str())
    }

    /// Record a key as uploaded. Idempotent.
    pub fn mark(&mut self, key: MeasurementKey) {
        if !self.contains(&key) {
            self.uploaded_keys.push(key.into_string());
        }
    }

    /// Evict down to `limit` keys, oldest instant first. Keys whose instant
    /// no longer parses are treated as oldest and go first.
    pub fn prune(&mut self, limit: usize) {
        self.uploaded_keys = prune_keys(std::mem::take(&mut self.uploaded_keys), limit);
    }
}

/// Sort keys by embedded instant ascending and keep the most recent `limit`.
/// Under the cap the list is returned untouched, so repeated saves stay
/// byte-stable.
pub fn prune_keys(mut keys: Vec<String>, limit: usize) -> Vec<String> {
    if keys.len() <= limit {
        return keys;
    }
    // Option sorts None first, which is exactly "unparseable is oldest"
    keys.sort_by_key(|k| MeasurementKey::parse_instant(k));
    keys.drain(..keys.len() - limit);
    keys
}

/// Load state from disk. Missing file: empty state. Corrupt file: empty
/// state plus a warning, never a fatal error.
pub async fn load(path: &Path) -> UploadState {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(_) => return UploadState::default(),
    };

    match serde_json::from_str::<UploadState>(&content) {
        Ok(state) => state,
        Err(e) => {
            eprintln!(
                "Warning: state file {} is corrupt ({}), starting from empty state",
                path.display(),
                e
            );
            UploadState::default()
        }
    }
}

/// Persist state atomically: prune to the cap, write a sibling temp file,
/// rename over the target. The parent directory is created if needed.
pub async fn save(path: &Path, state: &mut UploadState, max_entries: usize) -> Result<()> {
    state.prune(max_entries);
    state.saved_at = Utc::now();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create state directory")?;
        }
    }

    let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json)
        .await
        .context("Failed to write state temp file")?;
    fs::rename(&tmp_path, path)
        .await
        .context("Failed to move state file into place")?;

    Ok(())
}

/// Keep only the measurements whose key is not already recorded.
/// Order-preserving.
pub fn filter_new(
    batch: Vec<Measurement>,
    state: &UploadState,
) -> (Vec<Measurement>, usize) {
    let known: HashSet<&str> = state.uploaded_keys.iter().map(String::as_str).collect();
    let before = batch.len();
    let fresh: Vec<Measurement> = batch
        .into_iter()
        .filter(|m| !known.contains(m.key().as_str()))
        .collect();
    let skipped = before - fresh.len();
    (fresh, skipped)
}

/// One existing entry reported by the remote service. Sub-day granularity is
/// not guaranteed remotely, so comparison is by calendar date plus, when the
/// remote exposes it, the weight value.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub date: NaiveDate,
    pub weight_kg: Option<f64>,
}

/// Secondary duplicate check against entries fetched from the remote
/// service. Used when the local state file is unavailable or distrusted.
pub fn filter_against_remote(
    batch: Vec<Measurement>,
    existing: &[RemoteEntry],
) -> (Vec<Measurement>, usize) {
    let before = batch.len();
    let fresh: Vec<Measurement> = batch
        .into_iter()
        .filter(|m| {
            let local_date = m.instant.date_naive();
            !existing.iter().any(|entry| {
                entry.date == local_date
                    && entry
                        .weight_kg
                        .map_or(true, |w| weights_match(w, m.weight_kg))
            })
        })
        .collect();
    let skipped = before - fresh.len();
    (fresh, skipped)
}

/// Same rounding the key uses, so local and remote agree on "same reading".
fn weights_match(a: f64, b: f64) -> bool {
    format!("{a:.3}") == format!("{b:.3}")
}
