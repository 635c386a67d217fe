//! The one concrete adapter for the remote weight API.
//!
//! Everything wire-specific lives here: endpoint paths, payload field names,
//! and the mapping from HTTP responses to `UploadOutcome`. The login
//! handshake is external; the adapter consumes a pre-authenticated bearer
//! token. If the remote contract shifts again, this file is the only place
//! that changes.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::config::Config;
use crate::measurement::Measurement;
use crate::state::RemoteEntry;
use crate::upload::{UploadOutcome, Uploader};

const WEIGHT_POST_PATH: &str = "/weight/weight";
const WEIGHT_RANGE_GET_PATH: &str = "/weight/weight/dateRange";

/// Canonical attribute name → payload extension field.
const ATTRIBUTE_PAYLOAD_FIELDS: &[(&str, &str)] = &[
    ("body_fat_percent", "bodyFat"),
    ("body_water_percent", "bodyWater"),
    ("bone_mass_kg", "boneMass"),
    ("muscle_mass_kg", "muscleMass"),
    ("bmr_kcal", "bmr"),
    ("bmi", "bmi"),
];

pub struct GarminUploader {
    client: reqwest::Client,
    base_url: String,
    token: String,
    /// Offset label sent in the payload, e.g. "+09:00".
    timezone: String,
}

impl GarminUploader {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("weight-uploader/0.1")
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.api_base.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            timezone: config.timezone_label.clone(),
        })
    }

    fn payload(&self, measurement: &Measurement) -> serde_json::Value {
        let mut payload = json!({
            "date": measurement.instant.format("%Y-%m-%d").to_string(),
            "time": measurement.instant.format("%H:%M:%S").to_string(),
            "weight": measurement.weight_kg,
            "unitKey": "kg",
            "sourceType": "USER_ENTERED",
            "timeZone": self.timezone,
        });
        for (canonical, field) in ATTRIBUTE_PAYLOAD_FIELDS {
            if let Some(value) = measurement.attributes.get(*canonical) {
                payload[*field] = json!(value);
            }
        }
        payload
    }
}

/// Map an HTTP status onto the outcome taxonomy. Conflict means the remote
/// already has the reading; rate limits and server errors are worth a retry;
/// any other client error will not improve by retrying.
pub(crate) fn classify_status(status: StatusCode) -> UploadOutcome {
    if status.is_success() {
        UploadOutcome::Success
    } else if status == StatusCode::CONFLICT {
        UploadOutcome::AlreadyExists
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        UploadOutcome::TransientFailure(format!("HTTP {status}"))
    } else {
        UploadOutcome::PermanentFailure(format!("HTTP {status}"))
    }
}

/// One item of the date-range listing. The remote does not guarantee
/// sub-day granularity, hence date plus optional weight only.
#[derive(Debug, Deserialize)]
struct RangeItem {
    date: Option<NaiveDate>,
    weight: Option<f64>,
}

impl Uploader for GarminUploader {
    async fn upload(&self, measurement: &Measurement) -> UploadOutcome {
        let url = format!("{}{}", self.base_url, WEIGHT_POST_PATH);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&self.payload(measurement))
            .send()
            .await;

        match response {
            Ok(resp) => classify_status(resp.status()),
            // Transport errors (DNS, timeout, reset) are retryable
            Err(e) => UploadOutcome::TransientFailure(format!("request error: {e}")),
        }
    }

    async fn existing_entries(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RemoteEntry>> {
        let url = format!("{}{}", self.base_url, WEIGHT_RANGE_GET_PATH);
        let items: Vec<RangeItem> = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[
                ("startDate", start.to_string()),
                ("endDate", end.to_string()),
            ])
            .send()
            .await
            .context("Date range request failed")?
            .error_for_status()
            .context("Date range request rejected")?
            .json()
            .await
            .context("Failed to decode date range response")?;

        Ok(items
            .into_iter()
            .filter_map(|item| {
                item.date.map(|date| RemoteEntry {
                    date,
                    weight_kg: item.weight,
                })
            })
            .collect())
    }
}
