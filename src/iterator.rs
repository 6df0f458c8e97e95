//! Cursor over a single (source, metric) series across all partitions.

use crate::list::PartitionList;
use crate::partition::{PointIterator, SharedPartition};
use crate::{Point, Result, StrataError};
use std::sync::Arc;

/// Presents one (source, metric) series as a contiguous cursor across every
/// partition that contains data for it.
///
/// While positioned, the iterator keeps a shared hold on its current
/// partition; that hold blocks the compactor from destroying the partition
/// until [`close`](SeriesIterator::close) is called. This back-pressure is
/// deliberate: an unclosed iterator stalls compaction rather than reading
/// freed memory.
pub struct SeriesIterator {
    source: String,
    metric: String,
    list: Arc<PartitionList>,
    inner: Option<Box<dyn PointIterator>>,
}

impl SeriesIterator {
    pub(crate) fn new(list: Arc<PartitionList>, source: &str, metric: &str) -> Result<Self> {
        let mut iter = Self {
            source: source.to_string(),
            metric: metric.to_string(),
            list,
            inner: None,
        };
        iter.attach_oldest()?;
        Ok(iter)
    }

    /// Scans the registry newest-first, keeping a hold on the last partition
    /// the predicate accepts (the oldest match). The returned partition is
    /// still held; the caller releases it.
    fn scan_for_partition<F>(&self, accept: F) -> Option<SharedPartition>
    where
        F: Fn(&SharedPartition) -> bool,
    {
        let mut best: Option<SharedPartition> = None;

        for partition in self.list.iter() {
            partition.hold();
            if accept(&partition) {
                if let Some(prev) = best.take() {
                    prev.release();
                }
                best = Some(partition);
            } else {
                partition.release();
            }
        }

        best
    }

    /// Opens an inner cursor on the oldest partition containing the metric,
    /// positioned before its first point.
    fn attach_oldest(&mut self) -> Result<()> {
        let source = &self.source;
        let metric = &self.metric;
        let partition = self
            .scan_for_partition(|p| p.has_metric(source, metric))
            .ok_or_else(|| StrataError::MetricNotFound {
                source_name: source.clone(),
                metric: metric.clone(),
            })?;

        // The iterator takes its own hold, so the scan hold can go.
        let inner = Arc::clone(&partition).new_iterator(&self.source, &self.metric);
        partition.release();

        self.inner = Some(inner?);
        Ok(())
    }

    fn close_inner(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.close();
        }
    }

    /// Positions the cursor at the earliest available point.
    pub fn reset(&mut self) -> Result<()> {
        self.close_inner();
        self.attach_oldest()?;
        match self.inner.as_mut() {
            Some(inner) => inner.reset(),
            None => Err(StrataError::IteratorExhausted),
        }
    }

    /// Advances to the next point. When the current partition's cursor is
    /// exhausted, seeks past the current timestamp; that both crosses
    /// partition boundaries and tolerates gaps.
    pub fn next(&mut self) -> Result<()> {
        let inner = self
            .inner
            .as_mut()
            .ok_or(StrataError::IteratorExhausted)?;

        let current = inner.point().timestamp;
        if inner.next().is_ok() {
            return Ok(());
        }

        self.seek(current.saturating_add(1))
    }

    /// Positions the cursor at the first point with `timestamp >= ts`,
    /// switching to the partition covering `ts` (or the earliest partition
    /// entirely after it).
    pub fn seek(&mut self, ts: i64) -> Result<()> {
        self.close_inner();

        let source = &self.source;
        let metric = &self.metric;
        let partition = self
            .scan_for_partition(|p| {
                p.has_metric(source, metric)
                    && (p.min_timestamp() >= ts
                        || (p.min_timestamp() <= ts && p.max_timestamp() >= ts))
            })
            .ok_or(StrataError::IteratorExhausted)?;

        let inner = Arc::clone(&partition).new_iterator(&self.source, &self.metric);
        partition.release();

        let mut inner = inner?;
        if let Err(e) = inner.seek(ts) {
            inner.close();
            return Err(e);
        }

        self.inner = Some(inner);
        Ok(())
    }

    /// The point at the current position. Valid after a successful `next`,
    /// `reset`, or `seek`.
    pub fn point(&self) -> Point {
        match &self.inner {
            Some(inner) => inner.point(),
            None => Point::new(0, 0.0),
        }
    }

    /// Releases the hold on the current partition. Iterators MUST be closed
    /// to unblock the compactor.
    pub fn close(&mut self) {
        self.close_inner();
    }
}

impl Drop for SeriesIterator {
    fn drop(&mut self) {
        self.close_inner();
    }
}
