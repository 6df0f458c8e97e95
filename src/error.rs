//! Error types for strata.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for strata operations.
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("invalid database directory {path:?}: {reason}")]
    DirectoryInvalid { path: PathBuf, reason: String },

    #[error("invalid partition file name {name:?}")]
    PartitionFileInvalid { name: String },

    #[error("cannot write to read-only partition {filename:?}")]
    ReadOnlyPartition { filename: PathBuf },

    #[error("partition {filename:?} is not read-only")]
    NotReadOnly { filename: PathBuf },

    #[error("partition {filename:?} is closed")]
    PartitionClosed { filename: PathBuf },

    #[error("source {source_name:?} not found")]
    SourceNotFound { source_name: String },

    #[error("metric {metric:?} not found for source {source_name:?}")]
    MetricNotFound { source_name: String, metric: String },

    #[error("row with timestamp {timestamp} falls below the retention boundary")]
    TooOld { timestamp: i64 },

    #[error("invalid WAL magic number")]
    InvalidWalMagic,

    #[error("invalid WAL file")]
    InvalidWalFile,

    #[error("invalid snapshot magic in {filename:?}")]
    InvalidSnapshotMagic { filename: PathBuf },

    #[error("partition with minimum timestamp {min_timestamp} already exists")]
    PartitionExists { min_timestamp: i64 },

    #[error("partition not found")]
    PartitionNotFound,

    #[error("no more points in iterator")]
    IteratorExhausted,

    #[error("invalid source or metric name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
