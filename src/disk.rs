//! Disk partition implementation.
//!
//! A disk partition is a read-only, memory-mapped file produced by compacting
//! a sealed memory partition. Points are grouped by (source, metric) and
//! split into independently gzip-framed extents, followed by a metadata
//! directory and a trailing 8-byte offset locating it:
//!
//! ```text
//! [ extents ]
//! [ metadata ]
//!   magic        : u32 be = 0xCAFEC0DE
//!   min_ts       : i64 le
//!   max_ts       : i64 le
//!   num_sources  : u16 le
//!   per source   : name (u8 len + bytes), num_metrics u16 le,
//!     per metric : name (u8 len + bytes), offset i64 le, num_points u32 le,
//!                  num_extents u32 le,
//!       per ext  : start_ts i64 le, offset i64 le, num_points u32 le
//! [ footer ]
//!   metadata start offset : i64 le   (final 8 bytes of the file)
//! ```

use crate::concurrency::HoldLock;
use crate::mmap::PlatformMmap;
use crate::partition::{Partition, PointIterator, SnapshotWriter};
use crate::{Point, Result, Row, StrataError};
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use parking_lot::RwLock;

/// Magic sequence at the start of the metadata area. Written big-endian,
/// unlike every other field.
pub const SNAPSHOT_MAGIC: u32 = 0xCAFE_C0DE;

/// Maximum number of points per extent. Each extent is a self-contained gzip
/// frame, so range reads inflate only the extents overlapping the query.
pub const EXTENT_SIZE: usize = 3600;

/// Fixed footer length: the little-endian metadata start offset.
const FOOTER_LEN: usize = 8;

/// Minimum metadata length: magic, min/max timestamps, source count.
const MIN_META_LEN: usize = 4 + 8 + 8 + 2;

#[derive(Debug, Clone, Copy)]
struct DiskExtent {
    start_ts: i64,
    offset: i64,
    num_points: u32,
}

#[derive(Debug, Clone)]
struct DiskMetric {
    /// Offset of the first extent. Informational; reads go through the
    /// extent directory.
    #[allow(dead_code)]
    offset: i64,
    extents: Vec<DiskExtent>,
}

#[derive(Debug)]
struct DiskSource {
    metrics: BTreeMap<String, DiskMetric>,
}

/// A read-only partition stored as a memory-mapped file on disk.
pub struct DiskPartition {
    filename: PathBuf,
    min_ts: i64,
    max_ts: i64,
    sources: BTreeMap<String, DiskSource>,
    mapped: RwLock<Option<PlatformMmap>>,
    lock: HoldLock,
}

impl std::fmt::Debug for DiskPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskPartition")
            .field("filename", &self.filename)
            .field("min_ts", &self.min_ts)
            .field("max_ts", &self.max_ts)
            .finish_non_exhaustive()
    }
}

impl DiskPartition {
    /// Opens the partition file at `path`: maps it read-only and shared,
    /// locates the metadata from the trailing offset, validates the magic,
    /// and decodes the source/metric/extent directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;

        if len < FOOTER_LEN + MIN_META_LEN {
            return Err(StrataError::InvalidSnapshotMagic {
                filename: path.to_path_buf(),
            });
        }

        let mapped = PlatformMmap::new_readonly(file, len)?;
        if let Err(e) = mapped.advise_random() {
            debug!(file = %path.display(), error = %e, "madvise failed");
        }

        let (min_ts, max_ts, sources) = decode_metadata(mapped.as_slice(), path)?;

        Ok(Self {
            filename: path.to_path_buf(),
            min_ts,
            max_ts,
            sources,
            mapped: RwLock::new(Some(mapped)),
            lock: HoldLock::new(),
        })
    }

    fn lookup_metric(&self, source: &str, metric: &str) -> Result<&DiskMetric> {
        let source_entry =
            self.sources
                .get(source)
                .ok_or_else(|| StrataError::SourceNotFound {
                    source_name: source.to_string(),
                })?;

        source_entry
            .metrics
            .get(metric)
            .ok_or_else(|| StrataError::MetricNotFound {
                source_name: source.to_string(),
                metric: metric.to_string(),
            })
    }

    /// Inflates one extent into its point records.
    fn extent_points(&self, mapped: &PlatformMmap, extent: &DiskExtent) -> Result<Vec<Point>> {
        let data = mapped.as_slice();
        let offset = extent.offset as usize;
        if extent.offset < 0 || offset >= data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("extent offset {} out of bounds", extent.offset),
            )
            .into());
        }

        let mut decoder = GzDecoder::new(&data[offset..]);
        let mut buf = vec![0u8; extent.num_points as usize * 16];
        decoder.read_exact(&mut buf)?;

        let mut points = Vec::with_capacity(extent.num_points as usize);
        for record in buf.chunks_exact(16) {
            let timestamp = i64::from_le_bytes(record[..8].try_into().unwrap());
            let value = f64::from_bits(u64::from_le_bytes(record[8..].try_into().unwrap()));
            points.push(Point::new(timestamp, value));
        }

        Ok(points)
    }
}

impl Partition for DiskPartition {
    fn insert_rows(&self, _rows: &[Row]) -> Result<()> {
        Err(StrataError::ReadOnlyPartition {
            filename: self.filename.clone(),
        })
    }

    fn fetch_points(
        &self,
        source: &str,
        metric: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Point>> {
        if start > end {
            return Ok(Vec::new());
        }

        let guard = self.mapped.read();
        let mapped = guard.as_ref().ok_or_else(|| StrataError::PartitionClosed {
            filename: self.filename.clone(),
        })?;

        let disk_metric = self.lookup_metric(source, metric)?;
        let extents = &disk_metric.extents;

        // Extents are written in timestamp order, so the extents overlapping
        // the range are contiguous: start at the last extent beginning at or
        // before `start` and stop past `end`.
        let mut idx = extents.partition_point(|e| e.start_ts <= start);
        idx = idx.saturating_sub(1);

        let mut out = Vec::new();
        'extents: for extent in &extents[idx..] {
            if extent.start_ts > end {
                break;
            }

            for point in self.extent_points(mapped, extent)? {
                if point.timestamp < start {
                    continue;
                }
                if point.timestamp > end {
                    break 'extents;
                }
                out.push(point);
            }
        }

        Ok(out)
    }

    fn new_iterator(self: Arc<Self>, source: &str, metric: &str) -> Result<Box<dyn PointIterator>> {
        self.hold();

        let extents = match self.lookup_metric(source, metric) {
            Ok(disk_metric) => disk_metric.extents.clone(),
            Err(e) => {
                self.release();
                return Err(e);
            }
        };

        Ok(Box::new(DiskIterator {
            partition: self,
            extents,
            extent_idx: 0,
            extent_points: Vec::new(),
            pos: 0,
            positioned: false,
            current: Point::new(0, 0.0),
            closed: false,
        }))
    }

    fn read_only(&self) -> bool {
        true
    }

    fn set_read_only(&self) {}

    fn filename(&self) -> PathBuf {
        self.filename.clone()
    }

    fn min_timestamp(&self) -> i64 {
        self.min_ts
    }

    fn max_timestamp(&self) -> i64 {
        self.max_ts
    }

    fn has_source(&self, source: &str) -> bool {
        self.sources.contains_key(source)
    }

    fn has_metric(&self, source: &str, metric: &str) -> bool {
        match self.sources.get(source) {
            Some(entry) => entry.metrics.contains_key(metric),
            None => false,
        }
    }

    fn sources(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    fn metrics(&self, source: &str) -> Vec<String> {
        match self.sources.get(source) {
            Some(entry) => entry.metrics.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    fn close(&self) -> Result<()> {
        // Dropping the mapping munmaps and closes the file descriptor.
        self.mapped.write().take();
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.close()?;
        std::fs::remove_file(&self.filename)?;
        Ok(())
    }

    fn compact_into(&self, _sink: &mut dyn SnapshotWriter) -> Result<bool> {
        Ok(false)
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

fn decode_metadata(
    data: &[u8],
    path: &Path,
) -> Result<(i64, i64, BTreeMap<String, DiskSource>)> {
    let invalid = || StrataError::InvalidSnapshotMagic {
        filename: path.to_path_buf(),
    };

    let footer = &data[data.len() - FOOTER_LEN..];
    let meta_start = i64::from_le_bytes(footer.try_into().unwrap());
    if meta_start < 0 || meta_start as usize + MIN_META_LEN > data.len() - FOOTER_LEN {
        return Err(invalid());
    }

    let mut reader = &data[meta_start as usize..data.len() - FOOTER_LEN];

    let magic = read_u32_be(&mut reader)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(invalid());
    }

    let min_ts = read_i64(&mut reader)?;
    let max_ts = read_i64(&mut reader)?;

    let num_sources = read_u16(&mut reader)?;
    let mut sources = BTreeMap::new();

    for _ in 0..num_sources {
        let source_name = read_name(&mut reader)?;
        let num_metrics = read_u16(&mut reader)?;
        let mut metrics = BTreeMap::new();

        for _ in 0..num_metrics {
            let metric_name = read_name(&mut reader)?;
            let offset = read_i64(&mut reader)?;
            let num_points = read_u32(&mut reader)?;
            let num_extents = read_u32(&mut reader)?;

            let mut extents = Vec::with_capacity(num_extents as usize);
            for _ in 0..num_extents {
                let start_ts = read_i64(&mut reader)?;
                let ext_offset = read_i64(&mut reader)?;
                let ext_points = read_u32(&mut reader)?;
                extents.push(DiskExtent {
                    start_ts,
                    offset: ext_offset,
                    num_points: ext_points,
                });
            }

            let extent_total: u64 = extents.iter().map(|e| e.num_points as u64).sum();
            if extent_total != num_points as u64 {
                return Err(invalid());
            }

            metrics.insert(metric_name, DiskMetric { offset, extents });
        }

        sources.insert(source_name, DiskSource { metrics });
    }

    Ok((min_ts, max_ts, sources))
}

fn read_name(reader: &mut &[u8]) -> Result<String> {
    let len = read_u8(reader)? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad name: {e}")).into()
    })
}

fn read_u8(reader: &mut &[u8]) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16(reader: &mut &[u8]) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(reader: &mut &[u8]) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u32_be(reader: &mut &[u8]) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_i64(reader: &mut &[u8]) -> Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

/// Cursor over one metric's points in a disk partition, inflating one extent
/// at a time.
struct DiskIterator {
    partition: Arc<DiskPartition>,
    extents: Vec<DiskExtent>,
    extent_idx: usize,
    extent_points: Vec<Point>,
    pos: usize,
    positioned: bool,
    current: Point,
    closed: bool,
}

impl DiskIterator {
    fn load_extent(&self, idx: usize) -> Result<Vec<Point>> {
        let guard = self.partition.mapped.read();
        let mapped = guard.as_ref().ok_or_else(|| StrataError::PartitionClosed {
            filename: self.partition.filename.clone(),
        })?;
        self.partition.extent_points(mapped, &self.extents[idx])
    }
}

impl PointIterator for DiskIterator {
    fn reset(&mut self) -> Result<()> {
        if self.extents.is_empty() {
            return Err(StrataError::IteratorExhausted);
        }

        self.extent_points = self.load_extent(0)?;
        self.extent_idx = 0;
        self.pos = 0;
        self.positioned = true;
        self.current = self.extent_points[0];
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if !self.positioned {
            return self.reset();
        }

        if self.pos + 1 < self.extent_points.len() {
            self.pos += 1;
            self.current = self.extent_points[self.pos];
            return Ok(());
        }

        if self.extent_idx + 1 >= self.extents.len() {
            return Err(StrataError::IteratorExhausted);
        }

        self.extent_points = self.load_extent(self.extent_idx + 1)?;
        self.extent_idx += 1;
        self.pos = 0;
        self.current = self.extent_points[0];
        Ok(())
    }

    fn seek(&mut self, ts: i64) -> Result<()> {
        if self.extents.is_empty() {
            return Err(StrataError::IteratorExhausted);
        }

        let mut idx = self.extents.partition_point(|e| e.start_ts <= ts);
        idx = idx.saturating_sub(1);

        while idx < self.extents.len() {
            let points = self.load_extent(idx)?;

            // Extent entirely before the target; move on.
            if points.last().is_some_and(|last| last.timestamp < ts) {
                idx += 1;
                continue;
            }

            let pos = points.partition_point(|p| p.timestamp < ts);
            self.extent_points = points;
            self.extent_idx = idx;
            self.pos = pos;
            self.positioned = true;
            self.current = self.extent_points[pos];
            return Ok(());
        }

        Err(StrataError::IteratorExhausted)
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

impl Drop for DiskIterator {
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
