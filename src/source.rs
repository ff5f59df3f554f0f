//! CSV Source
//!
//! Reads long-format CSV (one observation per row) into data points and
//! drops rows already covered by the dataset's watermarks.
//!
//! ```text
//! series,obs_time,value,unit,frequency
//! S1,2024-01-15,1.0,index,M
//! ```

use crate::pipeline::{StageError, Stages};
use crate::state::Watermarks;
use crate::storage::{parse_timestamp, DataPoint};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Column positions of a long-format file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvColumns {
    pub series: usize,
    pub obs_time: usize,
    pub value: usize,
    pub unit: Option<usize>,
    pub frequency: Option<usize>,
    pub collection_date: Option<usize>,
}

impl Default for CsvColumns {
    /// `series, obs_time, value, unit, frequency`
    fn default() -> Self {
        Self {
            series: 0,
            obs_time: 1,
            value: 2,
            unit: Some(3),
            frequency: Some(4),
            collection_date: None,
        }
    }
}

impl CsvColumns {
    /// Map columns by header name
    pub fn detect(headers: &csv::StringRecord) -> Result<Self, StageError> {
        let require = |names: &[&str]| {
            find_column(headers, names).ok_or_else(|| {
                StageError::Parse(format!("CSV header has no {} column", names[0]))
            })
        };

        Ok(Self {
            series: require(&["series", "internal_series_code", "series_code"][..])?,
            obs_time: require(&["obs_time", "date", "timestamp", "time"][..])?,
            value: require(&["value"][..])?,
            unit: find_column(headers, &["unit"]),
            frequency: find_column(headers, &["frequency", "freq"]),
            collection_date: find_column(headers, &["collection_date"]),
        })
    }
}

fn find_column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers.iter().position(|header| {
        let header = header.trim().to_lowercase();
        names.iter().any(|name| header == *name)
    })
}

/// Result of reading a CSV file
#[derive(Debug, Default)]
pub struct CsvReadResult {
    pub points: Vec<DataPoint>,
    pub rows_read: usize,
    pub rows_failed: usize,
    pub errors: Vec<String>,
}

/// A [`Stages`] implementation backed by one CSV file
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
    columns: Option<CsvColumns>,
    has_header: bool,
    delimiter: u8,
    strict: bool,
    default_unit: String,
    default_frequency: String,
}

impl CsvSource {
    /// Header row expected, columns detected from it
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            columns: None,
            has_header: true,
            delimiter: b',',
            strict: false,
            default_unit: String::new(),
            default_frequency: String::new(),
        }
    }

    /// Builder method: fixed column positions instead of header detection
    pub fn with_columns(mut self, columns: CsvColumns) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Builder method: set whether the file has a header row
    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Builder method: fail on the first bad row instead of skipping it
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Builder method: unit for rows that leave it empty
    pub fn default_unit(mut self, unit: impl Into<String>) -> Self {
        self.default_unit = unit.into();
        self
    }

    /// Builder method: frequency for rows that leave it empty
    pub fn default_frequency(mut self, frequency: impl Into<String>) -> Self {
        self.default_frequency = frequency.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse CSV text
    pub fn read_str(&self, data: &str) -> Result<CsvReadResult, StageError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(self.has_header)
            .delimiter(self.delimiter)
            .flexible(true)
            .from_reader(data.as_bytes());

        let columns = match (self.columns, self.has_header) {
            (Some(columns), _) => columns,
            (None, true) => {
                let headers = reader
                    .headers()
                    .map_err(|e| StageError::Parse(e.to_string()))?;
                CsvColumns::detect(headers)?
            }
            (None, false) => CsvColumns::default(),
        };

        let mut result = CsvReadResult::default();
        for (index, record) in reader.records().enumerate() {
            let line = if self.has_header { index + 2 } else { index + 1 };
            let parsed = record
                .map_err(|e| e.to_string())
                .and_then(|record| self.parse_row(&record, &columns));

            match parsed {
                Ok(Some(point)) => {
                    result.rows_read += 1;
                    result.points.push(point);
                }
                // Blank line
                Ok(None) => {}
                Err(message) => {
                    if self.strict {
                        return Err(StageError::Parse(format!("Line {}: {}", line, message)));
                    }
                    result.rows_failed += 1;
                    result.errors.push(format!("Line {}: {}", line, message));
                }
            }
        }

        // Truncate errors if too many
        if result.errors.len() > 100 {
            let total = result.errors.len();
            result.errors.truncate(100);
            result.errors.push(format!("... and {} more errors", total - 100));
        }

        Ok(result)
    }

    /// Read and parse the configured file
    pub async fn read(&self) -> Result<CsvReadResult, StageError> {
        let data = tokio::fs::read_to_string(&self.path).await?;
        self.read_str(&data)
    }

    fn parse_row(
        &self,
        record: &csv::StringRecord,
        columns: &CsvColumns,
    ) -> Result<Option<DataPoint>, String> {
        if record.iter().all(|field| field.trim().is_empty()) {
            return Ok(None);
        }

        let field = |index: usize| record.get(index).map(str::trim).unwrap_or("");
        let optional = |index: Option<usize>| index.map(field).filter(|v| !v.is_empty());

        let series = field(columns.series);
        if series.is_empty() {
            return Err("missing series code".to_string());
        }

        let raw_time = field(columns.obs_time);
        let obs_time = parse_timestamp(raw_time)
            .ok_or_else(|| format!("could not parse timestamp: {:?}", raw_time))?;

        let raw_value = field(columns.value);
        let value: f64 = raw_value
            .parse()
            .map_err(|_| format!("could not parse value: {:?}", raw_value))?;

        let mut point = DataPoint::new(series, obs_time, value)
            .unit(optional(columns.unit).unwrap_or(self.default_unit.as_str()))
            .frequency(optional(columns.frequency).unwrap_or(self.default_frequency.as_str()));

        if let Some(raw) = optional(columns.collection_date) {
            let collected = parse_timestamp(raw)
                .ok_or_else(|| format!("could not parse collection date: {:?}", raw))?;
            point = point.collection_date(collected.with_timezone(&Utc));
        }

        Ok(Some(point))
    }
}

#[async_trait]
impl Stages for CsvSource {
    async fn extract(
        &self,
        dataset_id: &str,
        watermarks: &Watermarks,
    ) -> Result<Vec<DataPoint>, StageError> {
        let result = self.read().await?;
        if result.rows_failed > 0 {
            tracing::warn!(
                dataset_id,
                path = ?self.path,
                rows_failed = result.rows_failed,
                first_error = result.errors.first().map(String::as_str).unwrap_or(""),
                "Skipped unparseable CSV rows"
            );
        }

        let rows_read = result.rows_read;
        let points: Vec<DataPoint> = result
            .points
            .into_iter()
            .filter(|point| watermarks.is_new(point))
            .collect();

        tracing::info!(
            dataset_id,
            path = ?self.path,
            rows_read,
            new_points = points.len(),
            "Extracted CSV"
        );
        Ok(points)
    }
}
