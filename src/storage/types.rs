//! Core data types for the versioned storage engine
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `DataPoint`: A single normalized observation of a series
//! - `Manifest`: Persisted metadata describing one published version
//! - `Changelog` and `DateRange`: Derived manifest sections
//! - `Version`: The immutable snapshot a manifest describes

use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single time-series data point
///
/// Produced by the upstream stages (extract, parse, normalize, transform)
/// and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPoint {
    /// Series identifier assigned by the normalizer
    pub internal_series_code: String,
    /// Observation time, with the offset the source reported
    pub obs_time: DateTime<FixedOffset>,
    /// The observed value
    pub value: f64,
    /// Unit of measurement (e.g., "index", "percent")
    #[serde(default)]
    pub unit: String,
    /// Sampling frequency (e.g., "M", "Q")
    #[serde(default)]
    pub frequency: String,
    /// When the source published this value, if known
    #[serde(default)]
    pub collection_date: Option<DateTime<Utc>>,
}

impl DataPoint {
    /// Create a data point from a zoned timestamp
    pub fn new<Tz: TimeZone>(
        internal_series_code: impl Into<String>,
        obs_time: DateTime<Tz>,
        value: f64,
    ) -> Self {
        Self {
            internal_series_code: internal_series_code.into(),
            obs_time: obs_time.fixed_offset(),
            value,
            unit: String::new(),
            frequency: String::new(),
            collection_date: None,
        }
    }

    /// Create a data point from a naive timestamp, which is taken to be UTC
    pub fn from_naive(
        internal_series_code: impl Into<String>,
        obs_time: NaiveDateTime,
        value: f64,
    ) -> Self {
        Self::new(internal_series_code, obs_time.and_utc(), value)
    }

    /// Builder method: set unit
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Builder method: set frequency
    pub fn frequency(mut self, frequency: impl Into<String>) -> Self {
        self.frequency = frequency.into();
        self
    }

    /// Builder method: set collection date
    pub fn collection_date(mut self, collection_date: DateTime<Utc>) -> Self {
        self.collection_date = Some(collection_date);
        self
    }

    /// Observation time normalized to UTC
    pub fn obs_time_utc(&self) -> DateTime<Utc> {
        self.obs_time.with_timezone(&Utc)
    }
}

/// Parse a timestamp in any of the accepted input formats
///
/// RFC 3339 values keep their offset. Naive values (with or without a time
/// part) are interpreted as UTC.
pub fn parse_timestamp(input: &str) -> Option<DateTime<FixedOffset>> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt);
    }

    let datetime_formats = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];
    for fmt in datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, fmt) {
            return Some(dt.and_utc().fixed_offset());
        }
    }

    let date_formats = ["%Y-%m-%d", "%Y/%m/%d"];
    for fmt in date_formats {
        if let Ok(date) = NaiveDate::parse_from_str(input, fmt) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().fixed_offset());
        }
    }

    None
}

/// Serde adapter for manifest timestamps: `YYYY-MM-DDTHH:MM:SSZ`
pub mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            dt: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => s.serialize_some(&dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw: Option<String> = Option::deserialize(d)?;
            raw.map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
        }
    }
}

/// Observation time span of a version (both ends absent for an empty batch)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateRange {
    #[serde(with = "iso8601::option")]
    pub min_obs_time: Option<DateTime<Utc>>,
    #[serde(with = "iso8601::option")]
    pub max_obs_time: Option<DateTime<Utc>>,
}

/// Difference between a version and its predecessor
///
/// Classification is by series presence, not a row-level diff: a series
/// present in both versions is "updated" even if none of its values changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Changelog {
    pub new_series: BTreeSet<String>,
    pub updated_series: BTreeSet<String>,
    pub data_points_added: usize,
    pub data_points_updated: usize,
}

/// Persisted metadata for one version (`versions/{version_id}/manifest.json`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub version_id: String,
    pub dataset_id: String,
    #[serde(with = "iso8601")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "iso8601::option")]
    pub collection_date: Option<DateTime<Utc>>,
    pub data_points_count: usize,
    pub series_count: usize,
    pub series_codes: Vec<String>,
    pub date_range: DateRange,
    pub changelog: Changelog,
    /// Relative paths under `versions/{version_id}/data/`
    pub parquet_files: Vec<String>,
    pub partitions: Vec<String>,
    pub partition_strategy: String,
    pub previous_version: Option<String>,
}

impl Manifest {
    /// The immutable version this manifest describes
    pub fn version(&self) -> Version {
        Version {
            version_id: self.version_id.clone(),
            dataset_id: self.dataset_id.clone(),
            created_at: self.created_at,
            partitions: self.partitions.iter().cloned().collect(),
            files: self.parquet_files.clone(),
        }
    }

    /// Whether this version carries any data points
    pub fn has_data(&self) -> bool {
        self.data_points_count > 0
    }
}

/// A published, immutable snapshot of a dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub version_id: String,
    pub dataset_id: String,
    pub created_at: DateTime<Utc>,
    pub partitions: BTreeSet<String>,
    pub files: Vec<String>,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} ({} partitions, {} files, created {})",
            self.dataset_id,
            self.version_id,
            self.partitions.len(),
            self.files.len(),
            self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}
