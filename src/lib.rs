//! strata - an embedded, append-biased time-series storage engine
//!
//! strata ingests observations of the form `(source, metric, timestamp, value)`,
//! persists them durably through a write-ahead log, serves range queries, and
//! reclaims old data automatically. Recent data lives in writable in-memory
//! partitions; older partitions are compacted into read-only, memory-mapped
//! files with gzip-framed columnar extents.

pub mod concurrency;
pub mod db;
pub mod disk;
pub mod error;
pub mod iterator;
pub mod list;
pub mod memory;
pub mod mmap;
pub mod partition;
pub mod wal;

pub use db::Db;
pub use error::{Result, StrataError};
pub use iterator::SeriesIterator;

use serde::{Deserialize, Serialize};
use std::fmt;

/// An observation, the smallest unit of time-series data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Unix timestamp.
    pub timestamp: i64,
    /// The observed value.
    pub value: f64,
}

impl Point {
    /// Creates a new Point.
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Point(ts: {}, val: {})", self.timestamp, self.value)
    }
}

/// A row pairs a point with the source and metric it was observed on.
///
/// Source and metric names must each fit in 255 bytes; they are stored with
/// single-byte length prefixes on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Origin of the observation, e.g. a hostname.
    pub source: String,
    /// Name of the observed metric.
    pub metric: String,
    /// The data point.
    pub point: Point,
}

impl Row {
    /// Creates a new Row.
    pub fn new(source: impl Into<String>, metric: impl Into<String>, point: Point) -> Self {
        Self {
            source: source.into(),
            metric: metric.into(),
            point,
        }
    }
}

/// An ordered set of points for one (source, metric) over a range of time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// First timestamp in `points`.
    pub start: i64,
    /// Last timestamp in `points`.
    pub end: i64,
    pub source: String,
    pub metric: String,
    pub points: Vec<Point>,
}

/// A description of a single-series query: a source, a metric, and an
/// inclusive timestamp range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDesc {
    pub source: String,
    pub metric: String,
    pub start: i64,
    pub end: i64,
}

/// The result of querying the database with a set of [`QueryDesc`]s.
/// Series with no matching points are omitted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    pub series: Vec<Series>,
}
