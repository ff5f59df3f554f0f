//! Columnar partition files
//!
//! Each partition of a batch becomes one Parquet file (or several `part-NNNNN`
//! files when `max_rows_per_file` is set) under the version's data root. The
//! file schema is fixed and does not depend on the partition strategy.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::partition::PartitionStrategy;
use crate::storage::store::{self, RetryingStore};
use crate::storage::types::DataPoint;
use arrow::array::{
    Array, ArrayRef, AsArray, Float64Array, StringArray, TimestampNanosecondArray,
};
use arrow::datatypes::{DataType, Field, Float64Type, Schema, SchemaRef, TimeUnit, TimestampNanosecondType};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use futures_util::future::BoxFuture;
use futures_util::{stream, FutureExt, StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::PutPayload;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::sync::{Arc, OnceLock};

/// File name used when a partition fits in a single file
pub const SINGLE_FILE_NAME: &str = "data.parquet";

const UTC: &str = "UTC";

/// The fixed schema every partition file is written with
pub fn data_point_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            let ts = DataType::Timestamp(TimeUnit::Nanosecond, Some(UTC.into()));
            Arc::new(Schema::new(vec![
                Field::new("obs_time", ts.clone(), false),
                Field::new("internal_series_code", DataType::Utf8, false),
                Field::new("value", DataType::Float64, false),
                Field::new("unit", DataType::Utf8, false),
                Field::new("frequency", DataType::Utf8, false),
                Field::new("collection_date", ts, true),
            ]))
        })
        .clone()
}

/// Parse a configured compression codec name
pub fn parse_compression(name: &str) -> StorageResult<Compression> {
    match name.trim().to_ascii_lowercase().as_str() {
        "snappy" => Ok(Compression::SNAPPY),
        "zstd" => Ok(Compression::ZSTD(ZstdLevel::default())),
        "lz4" => Ok(Compression::LZ4_RAW),
        "gzip" => Ok(Compression::GZIP(GzipLevel::default())),
        "uncompressed" | "none" => Ok(Compression::UNCOMPRESSED),
        other => Err(StorageError::Config(format!(
            "Unknown compression codec: {} (expected snappy, zstd, lz4, gzip or uncompressed)",
            other
        ))),
    }
}

/// Knobs for [`ParquetWriter`]
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub compression: Compression,
    /// Split a partition into `part-NNNNN.parquet` files above this many rows
    pub max_rows_per_file: Option<usize>,
    /// Partition files uploaded at once
    pub write_concurrency: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            compression: Compression::SNAPPY,
            max_rows_per_file: None,
            write_concurrency: 4,
        }
    }
}

/// Serializes groups of data points into columnar files
#[async_trait]
pub trait ColumnarWriter: Send + Sync + std::fmt::Debug {
    /// Write `points` under `base_path`, grouped by `strategy`
    ///
    /// Returns the written paths relative to `base_path`, sorted.
    async fn write(
        &self,
        points: &[DataPoint],
        base_path: &ObjectPath,
        strategy: &dyn PartitionStrategy,
    ) -> StorageResult<Vec<String>>;

    /// Decode a file written by [`ColumnarWriter::write`]
    async fn read_file(&self, path: &ObjectPath) -> StorageResult<Vec<DataPoint>>;
}

/// Parquet implementation of [`ColumnarWriter`]
#[derive(Debug, Clone)]
pub struct ParquetWriter {
    store: RetryingStore,
    options: WriterOptions,
}

impl ParquetWriter {
    pub fn new(store: RetryingStore, options: WriterOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Relative file names for one partition, with the rows each one holds
    fn plan_files<'a>(
        &self,
        partition: &str,
        points: Vec<&'a DataPoint>,
    ) -> Vec<(String, Vec<&'a DataPoint>)> {
        match self.options.max_rows_per_file {
            Some(limit) if limit > 0 && points.len() > limit => points
                .chunks(limit)
                .enumerate()
                .map(|(i, chunk)| {
                    (
                        format!("{}/part-{:05}.parquet", partition, i),
                        chunk.to_vec(),
                    )
                })
                .collect(),
            _ => vec![(format!("{}/{}", partition, SINGLE_FILE_NAME), points)],
        }
    }

    fn encode(&self, points: &[&DataPoint], location: &ObjectPath) -> StorageResult<Bytes> {
        let batch = to_record_batch(points).map_err(|e| with_location(e, location))?;

        let props = WriterProperties::builder()
            .set_compression(self.options.compression)
            .build();
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;

        Ok(Bytes::from(buffer))
    }
}

#[async_trait]
impl ColumnarWriter for ParquetWriter {
    async fn write(
        &self,
        points: &[DataPoint],
        base_path: &ObjectPath,
        strategy: &dyn PartitionStrategy,
    ) -> StorageResult<Vec<String>> {
        if points.is_empty() {
            return Ok(Vec::new());
        }

        let groups = strategy.group_by_partition(points)?;
        let partition_count = groups.len();
        let jobs: Vec<(String, Vec<&DataPoint>)> = groups
            .into_iter()
            .flat_map(|(key, group)| self.plan_files(&key.to_string(), group))
            .collect();

        let tasks: Vec<BoxFuture<'_, StorageResult<String>>> = jobs
            .into_iter()
            .map(|(relative, rows)| {
                async move {
                    let location = store::join(base_path, &relative);
                    let bytes = self.encode(&rows, &location)?;
                    let size = bytes.len();
                    self.store.put(&location, PutPayload::from(bytes)).await?;
                    tracing::debug!(path = %location, rows = rows.len(), bytes = size, "Wrote partition file");
                    Ok::<_, StorageError>(relative)
                }
                .boxed()
            })
            .collect();

        let mut written: Vec<String> = stream::iter(tasks)
            .buffer_unordered(self.options.write_concurrency.max(1))
            .try_collect()
            .await?;

        written.sort();
        tracing::info!(
            base_path = %base_path,
            partitions = partition_count,
            files = written.len(),
            points = points.len(),
            "Wrote partitioned parquet files"
        );
        Ok(written)
    }

    async fn read_file(&self, path: &ObjectPath) -> StorageResult<Vec<DataPoint>> {
        let bytes = self.store.get_bytes(path).await?.ok_or_else(|| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("parquet file not found: {}", path),
            ))
        })?;

        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
        validate_schema(builder.schema()).map_err(|e| with_location(e, path))?;

        let mut points = Vec::new();
        for batch in builder.build()? {
            let batch = batch?;
            points.extend(from_record_batch(&batch).map_err(|e| with_location(e, path))?);
        }
        Ok(points)
    }
}

fn with_location(err: StorageError, location: &ObjectPath) -> StorageError {
    match err {
        StorageError::SchemaViolation(msg) => {
            StorageError::SchemaViolation(format!("{}: {}", location, msg))
        }
        other => other,
    }
}

fn to_record_batch(points: &[&DataPoint]) -> StorageResult<RecordBatch> {
    let mut obs_times = Vec::with_capacity(points.len());
    let mut collection_dates = Vec::with_capacity(points.len());

    for point in points {
        let obs = point.obs_time.timestamp_nanos_opt().ok_or_else(|| {
            StorageError::SchemaViolation(format!(
                "obs_time {} of series {} is outside the nanosecond timestamp range",
                point.obs_time, point.internal_series_code
            ))
        })?;
        obs_times.push(obs);

        let collected = match point.collection_date {
            Some(date) => Some(date.timestamp_nanos_opt().ok_or_else(|| {
                StorageError::SchemaViolation(format!(
                    "collection_date {} of series {} is outside the nanosecond timestamp range",
                    date, point.internal_series_code
                ))
            })?),
            None => None,
        };
        collection_dates.push(collected);
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampNanosecondArray::from(obs_times).with_timezone(UTC)),
        Arc::new(StringArray::from_iter_values(
            points.iter().map(|p| p.internal_series_code.as_str()),
        )),
        Arc::new(Float64Array::from_iter_values(points.iter().map(|p| p.value))),
        Arc::new(StringArray::from_iter_values(points.iter().map(|p| p.unit.as_str()))),
        Arc::new(StringArray::from_iter_values(
            points.iter().map(|p| p.frequency.as_str()),
        )),
        Arc::new(TimestampNanosecondArray::from(collection_dates).with_timezone(UTC)),
    ];

    Ok(RecordBatch::try_new(data_point_schema(), columns)?)
}

fn validate_schema(schema: &SchemaRef) -> StorageResult<()> {
    let expected = data_point_schema();
    let matches = schema.fields().len() == expected.fields().len()
        && schema
            .fields()
            .iter()
            .zip(expected.fields().iter())
            .all(|(actual, wanted)| {
                actual.name() == wanted.name() && actual.data_type() == wanted.data_type()
            });

    if matches {
        Ok(())
    } else {
        let found: Vec<String> = schema
            .fields()
            .iter()
            .map(|f| format!("{}: {}", f.name(), f.data_type()))
            .collect();
        Err(StorageError::SchemaViolation(format!(
            "unexpected file schema [{}]",
            found.join(", ")
        )))
    }
}

fn from_record_batch(batch: &RecordBatch) -> StorageResult<Vec<DataPoint>> {
    let mismatch = |column: &str| StorageError::SchemaViolation(format!("column {} has the wrong type", column));

    let obs_times = batch
        .column(0)
        .as_primitive_opt::<TimestampNanosecondType>()
        .ok_or_else(|| mismatch("obs_time"))?;
    let codes = batch
        .column(1)
        .as_string_opt::<i32>()
        .ok_or_else(|| mismatch("internal_series_code"))?;
    let values = batch
        .column(2)
        .as_primitive_opt::<Float64Type>()
        .ok_or_else(|| mismatch("value"))?;
    let units = batch
        .column(3)
        .as_string_opt::<i32>()
        .ok_or_else(|| mismatch("unit"))?;
    let frequencies = batch
        .column(4)
        .as_string_opt::<i32>()
        .ok_or_else(|| mismatch("frequency"))?;
    let collection_dates = batch
        .column(5)
        .as_primitive_opt::<TimestampNanosecondType>()
        .ok_or_else(|| mismatch("collection_date"))?;

    let points = (0..batch.num_rows())
        .map(|row| {
            let obs_time = DateTime::from_timestamp_nanos(obs_times.value(row));
            let mut point = DataPoint::new(codes.value(row), obs_time, values.value(row))
                .unit(units.value(row))
                .frequency(frequencies.value(row));
            if !collection_dates.is_null(row) {
                point = point.collection_date(DateTime::from_timestamp_nanos(
                    collection_dates.value(row),
                ));
            }
            point
        })
        .collect();
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::partition::{SeriesYearMonthStrategy, SeriesYearStrategy};
    use crate::storage::retry::RetryPolicy;
    use chrono::{FixedOffset, TimeZone, Utc};
    use object_store::memory::InMemory;

    fn writer(options: WriterOptions) -> ParquetWriter {
        ParquetWriter::new(
            RetryingStore::new(Arc::new(InMemory::new()), RetryPolicy::none()),
            options,
        )
    }

    fn point(series: &str, month: u32, day: u32, value: f64) -> DataPoint {
        DataPoint::new(
            series,
            Utc.with_ymd_and_hms(2024, month, day, 0, 0, 0).unwrap(),
            value,
        )
        .unit("index")
        .frequency("M")
    }

    fn base() -> ObjectPath {
        store::version_data_root("d1", "v1")
    }

    #[test]
    fn test_parse_compression() {
        assert_eq!(parse_compression("snappy").unwrap(), Compression::SNAPPY);
        assert_eq!(parse_compression("ZSTD").unwrap(), Compression::ZSTD(ZstdLevel::default()));
        assert_eq!(parse_compression("uncompressed").unwrap(), Compression::UNCOMPRESSED);
        assert!(matches!(parse_compression("brotli9"), Err(StorageError::Config(_))));
    }

    #[tokio::test]
    async fn test_one_file_per_partition() {
        let writer = writer(WriterOptions::default());
        let points = vec![point("S1", 1, 1, 1.0), point("S1", 1, 15, 2.0), point("S2", 2, 1, 3.0)];

        let files = writer
            .write(&points, &base(), &SeriesYearMonthStrategy)
            .await
            .unwrap();
        assert_eq!(
            files,
            vec![
                "S1/year=2024/month=01/data.parquet",
                "S2/year=2024/month=02/data.parquet"
            ]
        );

        let jan = writer
            .read_file(&store::join(&base(), &files[0]))
            .await
            .unwrap();
        assert_eq!(jan.len(), 2);
        assert_eq!(jan[0].internal_series_code, "S1");
        assert_eq!(jan[1].value, 2.0);
        assert_eq!(jan[0].unit, "index");
        assert!(jan[0].collection_date.is_none());
    }

    #[tokio::test]
    async fn test_empty_batch_writes_nothing() {
        let writer = writer(WriterOptions::default());
        let files = writer
            .write(&[], &base(), &SeriesYearMonthStrategy)
            .await
            .unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_split_large_partitions() {
        let writer = writer(WriterOptions {
            max_rows_per_file: Some(2),
            ..Default::default()
        });
        let points: Vec<DataPoint> = (1..=5).map(|d| point("S1", 3, d, d as f64)).collect();

        let files = writer
            .write(&points, &base(), &SeriesYearMonthStrategy)
            .await
            .unwrap();
        assert_eq!(
            files,
            vec![
                "S1/year=2024/month=03/part-00000.parquet",
                "S1/year=2024/month=03/part-00001.parquet",
                "S1/year=2024/month=03/part-00002.parquet"
            ]
        );

        let mut total = 0;
        for file in &files {
            total += writer
                .read_file(&store::join(&base(), file))
                .await
                .unwrap()
                .len();
        }
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_schema_is_strategy_independent() {
        let writer = writer(WriterOptions::default());
        let tz = FixedOffset::west_opt(3 * 3600).unwrap();
        let collected = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let points = vec![DataPoint::new(
            "S1",
            tz.with_ymd_and_hms(2024, 5, 31, 22, 0, 0).unwrap(),
            4.5,
        )
        .collection_date(collected)];

        let files = writer
            .write(&points, &base(), &SeriesYearStrategy)
            .await
            .unwrap();
        assert_eq!(files, vec!["S1/year=2024/data.parquet"]);

        let restored = writer
            .read_file(&store::join(&base(), &files[0]))
            .await
            .unwrap();
        assert_eq!(restored[0].obs_time_utc(), points[0].obs_time_utc());
        assert_eq!(restored[0].collection_date, Some(collected));
    }

    #[tokio::test]
    async fn test_out_of_range_timestamp_is_schema_violation() {
        let writer = writer(WriterOptions::default());
        let points = vec![DataPoint::new(
            "S1",
            Utc.with_ymd_and_hms(3000, 1, 1, 0, 0, 0).unwrap(),
            1.0,
        )];

        let err = writer
            .write(&points, &base(), &SeriesYearMonthStrategy)
            .await
            .unwrap_err();
        match err {
            StorageError::SchemaViolation(msg) => {
                assert!(msg.contains("datasets/d1/versions/v1/data/S1/year=3000/month=01"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_foreign_file_rejected() {
        let writer = writer(WriterOptions::default());
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(arrow::array::Int64Array::from(vec![1, 2]))],
        )
        .unwrap();
        let mut buffer = Vec::new();
        let mut w = ArrowWriter::try_new(&mut buffer, schema, None).unwrap();
        w.write(&batch).unwrap();
        w.close().unwrap();

        let path = ObjectPath::from("foreign.parquet");
        writer
            .store
            .put(&path, PutPayload::from(buffer))
            .await
            .unwrap();

        let err = writer.read_file(&path).await.unwrap_err();
        assert!(matches!(err, StorageError::SchemaViolation(_)));
    }
}
