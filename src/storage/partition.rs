//! Partition strategies
//!
//! A partition strategy maps each data point to the storage subtree it lives
//! in (e.g. `S1/year=2024/month=01`) and parses those subtrees back. Partition
//! fields exist only in the path, never as file columns.
//!
//! Strategies are selected by name through [`PartitionStrategyFactory`]:
//!
//! | name                | layout                               |
//! |---------------------|--------------------------------------|
//! | `series_year_month` | `{series}/year={YYYY}/month={MM}`    |
//! | `series_year`       | `{series}/year={YYYY}`               |

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::DataPoint;
use chrono::Datelike;
use object_store::path::PathPart;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

/// Name of the strategy used when configuration names none
pub const DEFAULT_PARTITION_STRATEGY: &str = "series_year_month";

/// Structured partition key
///
/// `month` is `None` for strategies that stop at the year.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    pub internal_series_code: String,
    pub year: i32,
    pub month: Option<u32>,
}

impl PartitionKey {
    fn build(series: &str, year: &str, month: Option<&str>) -> Option<Self> {
        let year: i32 = year.parse().ok()?;
        let month = match month {
            Some(raw) => {
                let month: u32 = raw.parse().ok()?;
                if !(1..=12).contains(&month) {
                    return None;
                }
                Some(month)
            }
            None => None,
        };
        Some(Self {
            internal_series_code: series.to_string(),
            year,
            month,
        })
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/year={}", self.internal_series_code, self.year)?;
        if let Some(month) = self.month {
            write!(f, "/month={:02}", month)?;
        }
        Ok(())
    }
}

/// Mapping from data points to storage partitions
pub trait PartitionStrategy: Send + Sync + std::fmt::Debug {
    /// Registry name, recorded in every manifest
    fn name(&self) -> &'static str;

    /// Derive the partition key for a point
    fn partition_key(&self, point: &DataPoint) -> StorageResult<PartitionKey>;

    /// Parse a partition path this strategy produced
    fn parse_partition_path(&self, path: &str) -> StorageResult<PartitionKey>;

    /// Find this strategy's partition segment anywhere inside a longer path
    fn find_partition(&self, path: &str) -> Option<PartitionKey>;

    fn get_partition_path(&self, point: &DataPoint) -> StorageResult<String> {
        Ok(self.partition_key(point)?.to_string())
    }

    /// Group points by partition; every point lands in exactly one group
    fn group_by_partition<'a>(
        &self,
        points: &'a [DataPoint],
    ) -> StorageResult<BTreeMap<PartitionKey, Vec<&'a DataPoint>>> {
        let mut groups: BTreeMap<PartitionKey, Vec<&'a DataPoint>> = BTreeMap::new();
        for point in points {
            groups.entry(self.partition_key(point)?).or_default().push(point);
        }
        Ok(groups)
    }

    /// Unique partitions referenced by a list of file paths
    fn get_all_partitions_from_paths(&self, paths: &[String]) -> BTreeSet<PartitionKey> {
        paths.iter().filter_map(|p| self.find_partition(p)).collect()
    }
}

/// Series codes become object keys verbatim, so anything the store would
/// percent-encode (or `.`/`..`) is rejected
fn validated_series_code(point: &DataPoint) -> StorageResult<&str> {
    let code = point.internal_series_code.as_str();
    if code.is_empty() || code.contains('/') || PathPart::from(code).as_ref() != code {
        return Err(StorageError::MalformedPartition(format!(
            "series code {:?} cannot be used as a path segment",
            code
        )));
    }
    Ok(code)
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("partition pattern is a valid regex"))
}

/// `{series}/year={YYYY}/month={MM}`, using the UTC calendar of `obs_time`
#[derive(Debug, Default, Clone, Copy)]
pub struct SeriesYearMonthStrategy;

impl SeriesYearMonthStrategy {
    fn exact() -> &'static Regex {
        static CELL: OnceLock<Regex> = OnceLock::new();
        regex(&CELL, r"^([^/]+)/year=(\d+)/month=(\d+)/?$")
    }

    fn embedded() -> &'static Regex {
        static CELL: OnceLock<Regex> = OnceLock::new();
        regex(&CELL, r"([^/]+)/year=(\d+)/month=(\d+)(?:/|$)")
    }
}

impl PartitionStrategy for SeriesYearMonthStrategy {
    fn name(&self) -> &'static str {
        "series_year_month"
    }

    fn partition_key(&self, point: &DataPoint) -> StorageResult<PartitionKey> {
        let code = validated_series_code(point)?;
        let obs = point.obs_time_utc();
        Ok(PartitionKey {
            internal_series_code: code.to_string(),
            year: obs.year(),
            month: Some(obs.month()),
        })
    }

    fn parse_partition_path(&self, path: &str) -> StorageResult<PartitionKey> {
        Self::exact()
            .captures(path)
            .and_then(|c| PartitionKey::build(&c[1], &c[2], Some(&c[3])))
            .ok_or_else(|| StorageError::MalformedPartition(path.to_string()))
    }

    fn find_partition(&self, path: &str) -> Option<PartitionKey> {
        let c = Self::embedded().captures(path)?;
        PartitionKey::build(&c[1], &c[2], Some(&c[3]))
    }
}

/// `{series}/year={YYYY}`, for sparse annual series
#[derive(Debug, Default, Clone, Copy)]
pub struct SeriesYearStrategy;

impl SeriesYearStrategy {
    fn exact() -> &'static Regex {
        static CELL: OnceLock<Regex> = OnceLock::new();
        regex(&CELL, r"^([^/]+)/year=(\d+)/?$")
    }

    fn embedded() -> &'static Regex {
        static CELL: OnceLock<Regex> = OnceLock::new();
        regex(&CELL, r"([^/]+)/year=(\d+)(?:/|$)")
    }
}

impl PartitionStrategy for SeriesYearStrategy {
    fn name(&self) -> &'static str {
        "series_year"
    }

    fn partition_key(&self, point: &DataPoint) -> StorageResult<PartitionKey> {
        let code = validated_series_code(point)?;
        Ok(PartitionKey {
            internal_series_code: code.to_string(),
            year: point.obs_time_utc().year(),
            month: None,
        })
    }

    fn parse_partition_path(&self, path: &str) -> StorageResult<PartitionKey> {
        Self::exact()
            .captures(path)
            .and_then(|c| PartitionKey::build(&c[1], &c[2], None))
            .ok_or_else(|| StorageError::MalformedPartition(path.to_string()))
    }

    fn find_partition(&self, path: &str) -> Option<PartitionKey> {
        let c = Self::embedded().captures(path)?;
        PartitionKey::build(&c[1], &c[2], None)
    }
}

type StrategyConstructor = fn() -> Arc<dyn PartitionStrategy>;

fn series_year_month() -> Arc<dyn PartitionStrategy> {
    Arc::new(SeriesYearMonthStrategy)
}

fn series_year() -> Arc<dyn PartitionStrategy> {
    Arc::new(SeriesYearStrategy)
}

const STRATEGIES: &[(&str, StrategyConstructor)] = &[
    ("series_year_month", series_year_month),
    ("series_year", series_year),
];

/// Selects a partition strategy by configured name
pub struct PartitionStrategyFactory;

impl PartitionStrategyFactory {
    /// Create the named strategy; `None` selects the default
    pub fn create(name: Option<&str>) -> StorageResult<Arc<dyn PartitionStrategy>> {
        let name = name.unwrap_or(DEFAULT_PARTITION_STRATEGY);
        STRATEGIES
            .iter()
            .find(|(registered, _)| *registered == name)
            .map(|(_, constructor)| constructor())
            .ok_or_else(|| StorageError::UnknownPartitionStrategy(name.to_string()))
    }

    /// Names of all registered strategies
    pub fn available() -> Vec<&'static str> {
        STRATEGIES.iter().map(|(name, _)| *name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone, Utc};

    fn point(series: &str, year: i32, month: u32, day: u32) -> DataPoint {
        DataPoint::new(
            series,
            Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap(),
            1.0,
        )
    }

    #[test]
    fn test_partition_path_format() {
        let strategy = SeriesYearMonthStrategy;
        assert_eq!(
            strategy.get_partition_path(&point("S1", 2024, 1, 15)).unwrap(),
            "S1/year=2024/month=01"
        );
        assert_eq!(
            strategy.get_partition_path(&point("S1", 2024, 11, 1)).unwrap(),
            "S1/year=2024/month=11"
        );
        assert_eq!(
            SeriesYearStrategy
                .get_partition_path(&point("S1", 2024, 11, 1))
                .unwrap(),
            "S1/year=2024"
        );
    }

    #[test]
    fn test_parse_roundtrip() {
        let strategies: Vec<Arc<dyn PartitionStrategy>> =
            vec![Arc::new(SeriesYearMonthStrategy), Arc::new(SeriesYearStrategy)];
        let points = vec![
            point("S1", 2024, 1, 15),
            point("IPC_GENERAL", 1999, 12, 31),
            point("a.b-c", 2030, 6, 1),
        ];

        for strategy in &strategies {
            for p in &points {
                let key = strategy.partition_key(p).unwrap();
                let path = strategy.get_partition_path(p).unwrap();
                assert_eq!(strategy.parse_partition_path(&path).unwrap(), key);
                // Trailing slash form is accepted too
                assert_eq!(
                    strategy.parse_partition_path(&format!("{}/", path)).unwrap(),
                    key
                );
            }
        }
    }

    #[test]
    fn test_offset_timestamps_partition_by_utc() {
        let tz = FixedOffset::east_opt(3 * 3600).unwrap();
        let p = DataPoint::new("S1", tz.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap(), 1.0);
        assert_eq!(
            SeriesYearMonthStrategy.get_partition_path(&p).unwrap(),
            "S1/year=2024/month=01"
        );
    }

    #[test]
    fn test_group_by_partition_is_exact() {
        let points = vec![
            point("S1", 2024, 1, 1),
            point("S1", 2024, 1, 20),
            point("S1", 2024, 2, 1),
            point("S2", 2024, 2, 1),
            point("S2", 2023, 2, 1),
        ];

        let groups = SeriesYearMonthStrategy.group_by_partition(&points).unwrap();
        assert_eq!(groups.len(), 4);
        let total: usize = groups.values().map(|g| g.len()).sum();
        assert_eq!(total, points.len());

        let jan = PartitionKey {
            internal_series_code: "S1".to_string(),
            year: 2024,
            month: Some(1),
        };
        assert_eq!(groups[&jan].len(), 2);

        let yearly = SeriesYearStrategy.group_by_partition(&points).unwrap();
        assert_eq!(yearly.len(), 3);
    }

    #[test]
    fn test_group_empty_input() {
        let groups = SeriesYearMonthStrategy.group_by_partition(&[]).unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_malformed_paths() {
        let strategy = SeriesYearMonthStrategy;
        for bad in [
            "",
            "S1",
            "S1/year=2024",
            "S1/year=abcd/month=01",
            "S1/year=2024/month=13",
            "S1/year=2024/month=00",
            "nested/S1/year=2024/month=01",
        ] {
            let err = strategy.parse_partition_path(bad).unwrap_err();
            assert!(matches!(err, StorageError::MalformedPartition(_)), "{bad}");
        }

        assert!(SeriesYearStrategy
            .parse_partition_path("S1/year=2024/month=01")
            .is_err());
    }

    #[test]
    fn test_invalid_series_code() {
        let strategy = SeriesYearMonthStrategy;
        assert!(strategy.partition_key(&point("", 2024, 1, 1)).is_err());
        assert!(strategy.partition_key(&point("a/b", 2024, 1, 1)).is_err());

        for code in ["IPC#1", "A[1]", "50%", "x?y", "..", "."] {
            assert!(
                matches!(
                    strategy.partition_key(&point(code, 2024, 1, 1)),
                    Err(StorageError::MalformedPartition(_))
                ),
                "{:?} should be rejected",
                code
            );
        }
        // Characters kept as-is by the store stay valid
        assert!(strategy.partition_key(&point("IPC GEN-2.1_x", 2024, 1, 1)).is_ok());
    }

    #[test]
    fn test_partitions_from_paths() {
        let paths = vec![
            "S1/year=2024/month=01/data.parquet".to_string(),
            "S1/year=2024/month=01/part-00001.parquet".to_string(),
            "datasets/d1/versions/v1/data/S2/year=2024/month=02/data.parquet".to_string(),
            "README.txt".to_string(),
        ];

        let partitions = SeriesYearMonthStrategy.get_all_partitions_from_paths(&paths);
        let rendered: Vec<String> = partitions.iter().map(|k| k.to_string()).collect();
        assert_eq!(rendered, vec!["S1/year=2024/month=01", "S2/year=2024/month=02"]);
    }

    #[test]
    fn test_factory() {
        assert_eq!(
            PartitionStrategyFactory::create(None).unwrap().name(),
            "series_year_month"
        );
        assert_eq!(
            PartitionStrategyFactory::create(Some("series_year"))
                .unwrap()
                .name(),
            "series_year"
        );

        let err = PartitionStrategyFactory::create(Some("by_week")).unwrap_err();
        assert!(matches!(err, StorageError::UnknownPartitionStrategy(name) if name == "by_week"));

        assert!(PartitionStrategyFactory::available().contains(&DEFAULT_PARTITION_STRATEGY));
    }
}
