//! Memory partition implementation.
//!
//! A memory partition is the writable backend: inserts are appended to its
//! write-ahead log first, then applied to a sorted in-memory index of
//! source -> metric -> ordered points. Sealing freezes the partition so the
//! compactor can serialize it into the on-disk snapshot format.

use crate::concurrency::HoldLock;
use crate::disk::{EXTENT_SIZE, SNAPSHOT_MAGIC};
use crate::partition::{Partition, PointIterator, SnapshotWriter};
use crate::wal::{FileWal, WalEntry, WalOperation};
use crate::{Point, Result, Row, StrataError};
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tracing::debug;

/// A partition that lives in heap memory, backed by a WAL.
pub struct MemoryPartition {
    /// Minimum observed timestamp, `i64::MAX` while empty.
    min_ts: AtomicI64,
    /// Maximum observed timestamp, `i64::MIN` while empty.
    max_ts: AtomicI64,
    read_only: AtomicBool,
    /// Sources sorted by name; the snapshot format requires sorted order.
    sources: RwLock<BTreeMap<String, Arc<SourceEntry>>>,
    wal: FileWal,
    lock: HoldLock,
}

struct SourceEntry {
    metrics: RwLock<BTreeMap<String, Arc<MetricEntry>>>,
}

struct MetricEntry {
    points: Mutex<Vec<Point>>,
}

impl MemoryPartition {
    /// Creates an empty partition attached to a fresh WAL.
    pub fn new(wal: FileWal) -> Self {
        Self {
            min_ts: AtomicI64::new(i64::MAX),
            max_ts: AtomicI64::new(i64::MIN),
            read_only: AtomicBool::new(false),
            sources: RwLock::new(BTreeMap::new()),
            wal,
            lock: HoldLock::new(),
        }
    }

    /// Rebuilds a partition by replaying all insert entries from `wal`.
    ///
    /// Replay stops at the first read error (a torn tail, bad magic, or
    /// corrupt payload); the WAL is then truncated to the last good boundary
    /// and the partition reflects every successfully-read entry.
    pub fn recover(wal: FileWal) -> Result<Self> {
        let partition = Self::new(wal);
        let mut entries = 0usize;

        loop {
            match partition.wal.read_entry() {
                Ok(entry) => {
                    if entry.operation == WalOperation::Insert {
                        partition.apply_rows(&entry.rows);
                    }
                    entries += 1;
                }
                Err(e) => {
                    debug!(
                        wal = %partition.wal.filename().display(),
                        entries,
                        error = %e,
                        "WAL replay stopped"
                    );
                    break;
                }
            }
        }

        partition.wal.truncate()?;
        Ok(partition)
    }

    fn get_or_create_source(&self, name: &str) -> Arc<SourceEntry> {
        if let Some(source) = self.sources.read().get(name) {
            return Arc::clone(source);
        }

        let mut sources = self.sources.write();
        Arc::clone(sources.entry(name.to_string()).or_insert_with(|| {
            Arc::new(SourceEntry {
                metrics: RwLock::new(BTreeMap::new()),
            })
        }))
    }

    fn lookup_metric(&self, source: &str, metric: &str) -> Result<Arc<MetricEntry>> {
        let source_entry = self
            .sources
            .read()
            .get(source)
            .cloned()
            .ok_or_else(|| StrataError::SourceNotFound {
                source_name: source.to_string(),
            })?;

        let found =
            source_entry
                .metrics
                .read()
                .get(metric)
                .cloned()
                .ok_or_else(|| StrataError::MetricNotFound {
                    source_name: source.to_string(),
                    metric: metric.to_string(),
                })?;

        Ok(found)
    }

    /// Applies rows to the in-memory index without touching the WAL. Used by
    /// both the insert path (after a successful append) and WAL replay.
    fn apply_rows(&self, rows: &[Row]) {
        let mut batch_min = i64::MAX;
        let mut batch_max = i64::MIN;

        for row in rows {
            batch_min = batch_min.min(row.point.timestamp);
            batch_max = batch_max.max(row.point.timestamp);

            let source = self.get_or_create_source(&row.source);
            let metric = source.get_or_create_metric(&row.metric);
            metric.insert_point(row.point);
        }

        self.relax_min(batch_min);
        self.relax_max(batch_max);
    }

    fn relax_min(&self, candidate: i64) {
        let mut current = self.min_ts.load(Ordering::Acquire);
        while candidate < current {
            match self.min_ts.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    fn relax_max(&self, candidate: i64) {
        let mut current = self.max_ts.load(Ordering::Acquire);
        while candidate > current {
            match self.max_ts.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

impl SourceEntry {
    fn get_or_create_metric(&self, name: &str) -> Arc<MetricEntry> {
        if let Some(metric) = self.metrics.read().get(name) {
            return Arc::clone(metric);
        }

        let mut metrics = self.metrics.write();
        Arc::clone(metrics.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MetricEntry {
                points: Mutex::new(Vec::with_capacity(64)),
            })
        }))
    }
}

impl MetricEntry {
    /// Inserts a point, keeping the sequence non-decreasing in timestamp.
    ///
    /// Writes are overwhelmingly append-at-tail, so the insertion index is
    /// located by scanning back from the end; the common path is O(1). A
    /// duplicate timestamp overwrites the stored value (last-writer-wins).
    fn insert_point(&self, point: Point) {
        let mut points = self.points.lock();

        let mut idx = points.len();
        while idx > 0 && points[idx - 1].timestamp > point.timestamp {
            idx -= 1;
        }

        if idx > 0 && points[idx - 1].timestamp == point.timestamp {
            points[idx - 1].value = point.value;
        } else {
            points.insert(idx, point);
        }
    }

    fn select_range(&self, start: i64, end: i64) -> Vec<Point> {
        let points = self.points.lock();
        if start > end || points.is_empty() {
            return Vec::new();
        }

        let lo = points.partition_point(|p| p.timestamp < start);
        let hi = points.partition_point(|p| p.timestamp <= end);
        points[lo..hi].to_vec()
    }
}

impl Partition for MemoryPartition {
    fn insert_rows(&self, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        if self.read_only() {
            return Err(StrataError::ReadOnlyPartition {
                filename: self.filename(),
            });
        }

        // Durability first: the whole batch goes out as a single WAL entry.
        // A failed append has already truncated the log back to the previous
        // boundary, and the index stays untouched.
        let entry = WalEntry {
            operation: WalOperation::Insert,
            rows: rows.to_vec(),
        };
        self.wal.append(&entry)?;

        self.apply_rows(rows);
        Ok(())
    }

    fn fetch_points(
        &self,
        source: &str,
        metric: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Point>> {
        let metric_entry = self.lookup_metric(source, metric)?;
        Ok(metric_entry.select_range(start, end))
    }

    fn new_iterator(self: Arc<Self>, source: &str, metric: &str) -> Result<Box<dyn PointIterator>> {
        self.hold();

        let metric_entry = match self.lookup_metric(source, metric) {
            Ok(entry) => entry,
            Err(e) => {
                self.release();
                return Err(e);
            }
        };

        Ok(Box::new(MemoryIterator {
            partition: self,
            metric: metric_entry,
            positioned: false,
            current: Point::new(0, 0.0),
            closed: false,
        }))
    }

    fn read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn set_read_only(&self) {
        self.read_only.store(true, Ordering::Release);
    }

    fn filename(&self) -> PathBuf {
        self.wal.filename().to_path_buf()
    }

    fn min_timestamp(&self) -> i64 {
        self.min_ts.load(Ordering::Acquire)
    }

    fn max_timestamp(&self) -> i64 {
        self.max_ts.load(Ordering::Acquire)
    }

    fn has_source(&self, source: &str) -> bool {
        self.sources.read().contains_key(source)
    }

    fn has_metric(&self, source: &str, metric: &str) -> bool {
        match self.sources.read().get(source) {
            Some(entry) => entry.metrics.read().contains_key(metric),
            None => false,
        }
    }

    fn sources(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    fn metrics(&self, source: &str) -> Vec<String> {
        match self.sources.read().get(source) {
            Some(entry) => entry.metrics.read().keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    fn close(&self) -> Result<()> {
        self.wal.close()?;
        self.set_read_only();
        self.sources.write().clear();
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.set_read_only();
        self.wal.destroy()?;
        Ok(())
    }

    fn compact_into(&self, sink: &mut dyn SnapshotWriter) -> Result<bool> {
        if !self.read_only() {
            return Err(StrataError::NotReadOnly {
                filename: self.filename(),
            });
        }

        let sources = self.sources.read();

        // First pass streams extents out while accumulating the directory
        // that the metadata area needs.
        let mut directory: Vec<(String, Vec<MetricMeta>)> = Vec::with_capacity(sources.len());

        for (source_name, source_entry) in sources.iter() {
            let metrics = source_entry.metrics.read();
            let mut metric_metas = Vec::with_capacity(metrics.len());

            for (metric_name, metric_entry) in metrics.iter() {
                let points = metric_entry.points.lock().clone();

                let met_offset = sink.stream_position()? as i64;
                let mut extents = Vec::new();

                for chunk in points.chunks(EXTENT_SIZE) {
                    let offset = sink.stream_position()? as i64;

                    // Each extent is an independent gzip frame so reads only
                    // inflate the extents overlapping the query range.
                    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                    for point in chunk {
                        encoder.write_all(&point.timestamp.to_le_bytes())?;
                        encoder.write_all(&point.value.to_le_bytes())?;
                    }
                    let frame = encoder.finish()?;
                    sink.write_all(&frame)?;

                    extents.push(ExtentMeta {
                        start_ts: chunk[0].timestamp,
                        offset,
                        num_points: chunk.len() as u32,
                    });
                }

                metric_metas.push(MetricMeta {
                    name: metric_name.clone(),
                    offset: met_offset,
                    num_points: points.len() as u32,
                    extents,
                });
            }

            directory.push((source_name.clone(), metric_metas));
        }

        let meta_start = sink.stream_position()? as i64;

        sink.write_all(&SNAPSHOT_MAGIC.to_be_bytes())?;
        sink.write_all(&self.min_timestamp().to_le_bytes())?;
        sink.write_all(&self.max_timestamp().to_le_bytes())?;
        sink.write_all(&(directory.len() as u16).to_le_bytes())?;

        for (source_name, metric_metas) in &directory {
            sink.write_all(&[source_name.len() as u8])?;
            sink.write_all(source_name.as_bytes())?;
            sink.write_all(&(metric_metas.len() as u16).to_le_bytes())?;

            for meta in metric_metas {
                sink.write_all(&[meta.name.len() as u8])?;
                sink.write_all(meta.name.as_bytes())?;
                sink.write_all(&meta.offset.to_le_bytes())?;
                sink.write_all(&meta.num_points.to_le_bytes())?;
                sink.write_all(&(meta.extents.len() as u32).to_le_bytes())?;

                for extent in &meta.extents {
                    sink.write_all(&extent.start_ts.to_le_bytes())?;
                    sink.write_all(&extent.offset.to_le_bytes())?;
                    sink.write_all(&extent.num_points.to_le_bytes())?;
                }
            }
        }

        sink.write_all(&meta_start.to_le_bytes())?;

        Ok(true)
    }

    fn hold(&self) {
        self.lock.hold();
    }

    fn release(&self) {
        self.lock.release();
    }

    fn exclusive_hold(&self) {
        self.lock.exclusive_hold();
    }

    fn exclusive_release(&self) {
        self.lock.exclusive_release();
    }
}

struct MetricMeta {
    name: String,
    offset: i64,
    num_points: u32,
    extents: Vec<ExtentMeta>,
}

struct ExtentMeta {
    start_ts: i64,
    offset: i64,
    num_points: u32,
}

/// Cursor over one metric's points inside a memory partition.
///
/// Concurrent inserts may shift indices under the cursor, so every advance
/// re-anchors on the current timestamp; last-writer-wins keeps timestamps
/// unique within a metric.
struct MemoryIterator {
    partition: Arc<MemoryPartition>,
    metric: Arc<MetricEntry>,
    positioned: bool,
    current: Point,
    closed: bool,
}

impl PointIterator for MemoryIterator {
    fn reset(&mut self) -> Result<()> {
        let points = self.metric.points.lock();
        let first = *points.first().ok_or(StrataError::IteratorExhausted)?;
        self.positioned = true;
        self.current = first;
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if !self.positioned {
            return self.reset();
        }

        let points = self.metric.points.lock();
        let idx = points.partition_point(|p| p.timestamp <= self.current.timestamp);
        if idx >= points.len() {
            return Err(StrataError::IteratorExhausted);
        }

        self.current = points[idx];
        Ok(())
    }

    fn seek(&mut self, ts: i64) -> Result<()> {
        let points = self.metric.points.lock();
        let idx = points.partition_point(|p| p.timestamp < ts);
        if idx >= points.len() {
            return Err(StrataError::IteratorExhausted);
        }

        self.positioned = true;
        self.current = points[idx];
        Ok(())
    }

    fn point(&self) -> Point {
        self.current
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.partition.release();
        }
    }
}

impl Drop for MemoryIterator {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.partition.release();
            if !std::thread::panicking() {
                debug_assert!(false, "point iterator dropped without close");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with(points: &[(i64, f64)]) -> MetricEntry {
        let entry = MetricEntry {
            points: Mutex::new(Vec::new()),
        };
        for &(ts, value) in points {
            entry.insert_point(Point::new(ts, value));
        }
        entry
    }

    #[test]
    fn insert_point_keeps_order_for_out_of_order_writes() {
        let entry = entry_with(&[(10, 1.0), (30, 3.0), (20, 2.0), (5, 0.5)]);

        let points = entry.points.lock();
        let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![5, 10, 20, 30]);
    }

    #[test]
    fn insert_point_overwrites_duplicate_timestamp() {
        let entry = entry_with(&[(10, 1.0), (20, 2.0), (10, 9.0)]);

        let points = entry.points.lock();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], Point::new(10, 9.0));
        assert_eq!(points[1], Point::new(20, 2.0));
    }

    #[test]
    fn select_range_is_inclusive_on_both_ends() {
        let entry = entry_with(&[(1, 1.0), (2, 2.0), (3, 3.0), (4, 4.0)]);

        let points = entry.select_range(2, 3);
        let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![2, 3]);

        assert!(entry.select_range(5, 2).is_empty());
    }
}
