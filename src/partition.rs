//! The partition capability set shared by both backends.

use crate::{Point, Result, Row};
use std::io::{Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// A partition owns a disjoint slice of time and all points observed inside
/// it, indexed by (source, metric).
///
/// Two variants implement this set: the writable, WAL-backed
/// [`MemoryPartition`](crate::memory::MemoryPartition) and the read-only,
/// memory-mapped [`DiskPartition`](crate::disk::DiskPartition). The registry
/// holds either transparently.
pub trait Partition: Send + Sync {
    /// Inserts rows into the partition. Fails with `ReadOnlyPartition` once
    /// the partition is sealed.
    fn insert_rows(&self, rows: &[Row]) -> Result<()>;

    /// Returns points for (source, metric) with `start <= timestamp <= end`,
    /// in timestamp order.
    fn fetch_points(&self, source: &str, metric: &str, start: i64, end: i64)
    -> Result<Vec<Point>>;

    /// Returns a cursor over the points of (source, metric), positioned
    /// before the first point. The iterator keeps a shared hold on the
    /// partition until closed.
    fn new_iterator(self: Arc<Self>, source: &str, metric: &str) -> Result<Box<dyn PointIterator>>;

    /// Whether the partition rejects mutations.
    fn read_only(&self) -> bool;

    /// Seals the partition. Idempotent.
    fn set_read_only(&self);

    /// Path of the backing file: `<id>.wal` for a memory partition,
    /// `<id>.part` for a disk partition.
    fn filename(&self) -> PathBuf;

    /// Minimum observed timestamp, `i64::MAX` while empty.
    fn min_timestamp(&self) -> i64;

    /// Maximum observed timestamp, `i64::MIN` while empty.
    fn max_timestamp(&self) -> i64;

    /// Whether the partition has any points for `source`.
    fn has_source(&self, source: &str) -> bool;

    /// Whether the partition has any points for (source, metric).
    fn has_metric(&self, source: &str, metric: &str) -> bool;

    /// Source names present in the partition, sorted.
    fn sources(&self) -> Vec<String>;

    /// Metric names present for `source`, sorted.
    fn metrics(&self, source: &str) -> Vec<String>;

    /// Releases resources while keeping the backing file for later recovery.
    fn close(&self) -> Result<()>;

    /// Closes the partition and removes its backing file.
    fn destroy(&self) -> Result<()>;

    /// Serializes the partition into the on-disk snapshot format, writing
    /// everything into `sink`. Valid only on sealed memory partitions.
    /// Returns `Ok(false)` when the partition has no in-memory form to
    /// serialize (it is already on disk).
    fn compact_into(&self, sink: &mut dyn SnapshotWriter) -> Result<bool>;

    /// Acquires a shared hold. Readers and writers hold for the duration of
    /// an operation or iterator session to block the compactor.
    fn hold(&self);

    /// Releases a shared hold.
    fn release(&self);

    /// Acquires the exclusive hold, used when sealing, destroying, or
    /// swapping the partition.
    fn exclusive_hold(&self);

    /// Releases the exclusive hold.
    fn exclusive_release(&self);
}

/// Type alias for a shared partition reference.
pub type SharedPartition = Arc<dyn Partition>;

/// A seekable byte sink for partition snapshots.
pub trait SnapshotWriter: Write + Seek + Send {}

impl<T: Write + Seek + Send> SnapshotWriter for T {}

/// A cursor over the points of a single (source, metric) inside one
/// partition.
///
/// The cursor starts positioned before the first point; `next`, `reset`, or
/// `seek` must succeed before `point` returns valid data. Iterators MUST be
/// closed to release their hold on the partition; dropping an unclosed
/// iterator releases the hold and fires a debug assertion.
pub trait PointIterator: Send {
    /// Positions the cursor at the first point.
    fn reset(&mut self) -> Result<()>;

    /// Advances to the next point, or to the first point when the cursor has
    /// not been positioned yet. Fails with `IteratorExhausted` at the end.
    fn next(&mut self) -> Result<()>;

    /// Positions the cursor at the first point with `timestamp >= ts`.
    fn seek(&mut self, ts: i64) -> Result<()>;

    /// The point at the current position.
    fn point(&self) -> Point;

    /// Releases the hold on the underlying partition.
    fn close(&mut self);
}
