use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use strata::disk::DiskPartition;
use strata::memory::MemoryPartition;
use strata::partition::Partition;
use strata::wal::FileWal;
use strata::{Point, Row, StrataError};

/// Builds a memory partition from `rows`, seals it, compacts it into
/// `<dir>/1.part`, and opens the result.
fn compacted(dir: &Path, rows: &[Row]) -> DiskPartition {
    let wal = FileWal::create(dir.join("1.wal")).unwrap();
    let partition = MemoryPartition::new(wal);
    partition.insert_rows(rows).unwrap();
    partition.set_read_only();

    let part_path = dir.join("1.part");
    let mut file = File::create(&part_path).unwrap();
    assert!(partition.compact_into(&mut file).unwrap());
    file.sync_all().unwrap();
    drop(file);
    partition.destroy().unwrap();

    DiskPartition::open(&part_path).unwrap()
}

#[test]
fn round_trip_preserves_points_and_metadata() {
    let dir = TempDir::new().unwrap();

    let rows = vec![
        Row::new("web01", "cpu", Point::new(10, 1.5)),
        Row::new("web01", "cpu", Point::new(20, 2.5)),
        Row::new("web01", "mem", Point::new(15, 512.0)),
        Row::new("db01", "connections", Point::new(12, 7.0)),
    ];
    let partition = compacted(dir.path(), &rows);

    assert_eq!(partition.min_timestamp(), 10);
    assert_eq!(partition.max_timestamp(), 20);
    assert_eq!(partition.sources(), vec!["db01", "web01"]);
    assert_eq!(partition.metrics("web01"), vec!["cpu", "mem"]);
    assert!(partition.has_metric("db01", "connections"));
    assert!(partition.read_only());

    let points = partition.fetch_points("web01", "cpu", 0, 100).unwrap();
    assert_eq!(points, vec![Point::new(10, 1.5), Point::new(20, 2.5)]);

    let points = partition.fetch_points("db01", "connections", 12, 12).unwrap();
    assert_eq!(points, vec![Point::new(12, 7.0)]);

    partition.destroy().unwrap();
}

#[test]
fn multi_extent_metric_reads_across_extent_boundaries() {
    let dir = TempDir::new().unwrap();

    // 3600 points per extent; three extents, the last partial.
    let total = 3600 * 2 + 100;
    let rows: Vec<Row> = (0..total)
        .map(|t| Row::new("web01", "cpu", Point::new(t as i64, t as f64)))
        .collect();
    let partition = compacted(dir.path(), &rows);

    // Full scan decodes every extent.
    let points = partition
        .fetch_points("web01", "cpu", 0, total as i64)
        .unwrap();
    assert_eq!(points.len(), total);
    assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    // A range straddling the first extent boundary.
    let points = partition.fetch_points("web01", "cpu", 3598, 3602).unwrap();
    let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
    assert_eq!(timestamps, vec![3598, 3599, 3600, 3601, 3602]);

    // A range entirely inside the last, partial extent.
    let points = partition.fetch_points("web01", "cpu", 7250, 7299).unwrap();
    assert_eq!(points.len(), 50);
    assert_eq!(points[0], Point::new(7250, 7250.0));

    partition.destroy().unwrap();
}

#[test]
fn fetch_points_filters_inclusive_range() {
    let dir = TempDir::new().unwrap();

    let rows: Vec<Row> = (0..10)
        .map(|t| Row::new("a", "b", Point::new(t, t as f64)))
        .collect();
    let partition = compacted(dir.path(), &rows);

    let points = partition.fetch_points("a", "b", 3, 6).unwrap();
    let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
    assert_eq!(timestamps, vec![3, 4, 5, 6]);

    assert!(partition.fetch_points("a", "b", 6, 3).unwrap().is_empty());

    assert!(matches!(
        partition.fetch_points("missing", "b", 0, 10),
        Err(StrataError::SourceNotFound { .. })
    ));
    assert!(matches!(
        partition.fetch_points("a", "missing", 0, 10),
        Err(StrataError::MetricNotFound { .. })
    ));

    partition.destroy().unwrap();
}

#[test]
fn mutations_fail_on_disk_partition() {
    let dir = TempDir::new().unwrap();
    let partition = compacted(dir.path(), &[Row::new("a", "b", Point::new(1, 1.0))]);

    let err = partition
        .insert_rows(&[Row::new("a", "b", Point::new(2, 2.0))])
        .unwrap_err();
    assert!(matches!(err, StrataError::ReadOnlyPartition { .. }));

    partition.destroy().unwrap();
}

#[test]
fn iterator_crosses_extents_and_seeks() {
    let dir = TempDir::new().unwrap();

    let total = 3600 + 50;
    let rows: Vec<Row> = (0..total)
        .map(|t| Row::new("web01", "cpu", Point::new(t as i64, t as f64)))
        .collect();
    let partition = Arc::new(compacted(dir.path(), &rows));

    let mut iter = Arc::clone(&partition)
        .new_iterator("web01", "cpu")
        .unwrap();

    // Walk over the extent boundary.
    iter.seek(3598).unwrap();
    for expected in 3598..3605 {
        assert_eq!(iter.point().timestamp, expected);
        if expected < 3604 {
            iter.next().unwrap();
        }
    }

    // Seek into the second extent directly.
    iter.seek(3649).unwrap();
    assert_eq!(iter.point().timestamp, 3649);

    // Past the end.
    assert!(matches!(
        iter.seek(total as i64),
        Err(StrataError::IteratorExhausted)
    ));

    iter.reset().unwrap();
    assert_eq!(iter.point().timestamp, 0);

    iter.close();
    partition.destroy().unwrap();
}

#[test]
fn close_then_destroy_removes_file() {
    let dir = TempDir::new().unwrap();
    let partition = compacted(dir.path(), &[Row::new("a", "b", Point::new(1, 1.0))]);

    let path: PathBuf = partition.filename();
    assert!(path.exists());

    partition.close().unwrap();
    assert!(matches!(
        partition.fetch_points("a", "b", 0, 10),
        Err(StrataError::PartitionClosed { .. })
    ));

    partition.destroy().unwrap();
    assert!(!path.exists());
}
