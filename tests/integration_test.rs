use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use strata::wal::{FileWal, WalEntry, WalOperation};
use strata::{Db, Point, QueryDesc, Row, StrataError};

fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn query_points(db: &Db, source: &str, metric: &str, start: i64, end: i64) -> Vec<Point> {
    let response = db.query(&[QueryDesc {
        source: source.to_string(),
        metric: metric.to_string(),
        start,
        end,
    }]);
    response
        .series
        .into_iter()
        .next()
        .map(|s| s.points)
        .unwrap_or_default()
}

fn insert_sequential(db: &Db, source: &str, metric: &str, timestamps: std::ops::Range<i64>) {
    for t in timestamps {
        db.insert_rows(&[Row::new(source, metric, Point::new(t, 0.0))])
            .unwrap();
    }
}

fn has_partition_file(dir: &Path, name: &str) -> bool {
    dir.join(name).exists()
}

#[test]
fn simple_insert_query_round_trip() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 4).unwrap();

    let rows: Vec<Row> = (0..20).map(|t| Row::new("a", "b", Point::new(t, 0.0))).collect();
    db.insert_rows(&rows).unwrap();

    let points = query_points(&db, "a", "b", -10, 100);
    assert_eq!(points.len(), 20);
    for (i, point) in points.iter().enumerate() {
        assert_eq!(point.timestamp, i as i64);
        assert_eq!(point.value, 0.0);
    }

    db.close().unwrap();
}

#[test]
fn duplicate_timestamp_returns_last_written_value() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 4).unwrap();

    db.insert_rows(&[Row::new("a", "b", Point::new(5, 1.0))])
        .unwrap();
    db.insert_rows(&[Row::new("a", "b", Point::new(5, 2.0))])
        .unwrap();

    let points = query_points(&db, "a", "b", 5, 5);
    assert_eq!(points, vec![Point::new(5, 2.0)]);

    db.close().unwrap();
}

#[test]
fn retention_drops_partitions_beyond_bound() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 4).unwrap();

    // Five windows; retention keeps four.
    insert_sequential(&db, "a", "b", 0..25);

    assert!(
        wait_for(|| db.min_timestamp() == 5, Duration::from_secs(5)),
        "retention sweep should advance min_timestamp past the dropped window"
    );

    assert!(query_points(&db, "a", "b", 0, 4).is_empty());

    let points = query_points(&db, "a", "b", 5, 9);
    let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
    assert_eq!(timestamps, vec![5, 6, 7, 8, 9]);

    db.close().unwrap();
}

#[test]
fn inserts_below_retention_boundary_are_rejected() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 4).unwrap();

    insert_sequential(&db, "a", "b", 0..25);
    assert!(wait_for(|| db.min_timestamp() == 5, Duration::from_secs(5)));

    // One window below the boundary.
    let err = db
        .insert_rows(&[Row::new("a", "b", Point::new(4, 1.0))])
        .unwrap_err();
    assert!(matches!(err, StrataError::TooOld { timestamp: 4 }));

    // At the boundary the window is retained, but its partition has been
    // sealed by the compactor by now.
    assert!(wait_for(
        || has_partition_file(dir.path(), "2.part"),
        Duration::from_secs(5)
    ));
    let err = db
        .insert_rows(&[Row::new("a", "b", Point::new(5, 1.0))])
        .unwrap_err();
    assert!(matches!(err, StrataError::ReadOnlyPartition { .. }));

    db.close().unwrap();
}

#[test]
fn insert_at_current_min_timestamp_is_accepted() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 4).unwrap();

    insert_sequential(&db, "a", "b", 0..10);
    assert_eq!(db.min_timestamp(), 0);

    db.insert_rows(&[Row::new("a", "b", Point::new(0, 9.0))])
        .unwrap();
    let points = query_points(&db, "a", "b", 0, 0);
    assert_eq!(points, vec![Point::new(0, 9.0)]);

    db.close().unwrap();
}

#[test]
fn iterator_seeks_across_partition_boundaries() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 10).unwrap();

    insert_sequential(&db, "a", "b", 0..25);

    let mut iter = db.new_iterator("a", "b").unwrap();
    iter.seek(12).unwrap();
    assert_eq!(iter.point().timestamp, 12);

    for expected in [13, 14, 15, 16, 17] {
        iter.next().unwrap();
        assert_eq!(iter.point().timestamp, expected);
    }
    iter.close();

    // The same walk once the older partitions have been compacted to disk.
    assert!(
        wait_for(
            || has_partition_file(dir.path(), "3.part"),
            Duration::from_secs(5)
        ),
        "third-newest partition should compact"
    );

    let mut iter = db.new_iterator("a", "b").unwrap();
    iter.seek(12).unwrap();
    assert_eq!(iter.point().timestamp, 12);
    for expected in [13, 14, 15, 16, 17] {
        iter.next().unwrap();
        assert_eq!(iter.point().timestamp, expected);
    }
    iter.close();

    db.close().unwrap();
}

#[test]
fn iterator_reset_returns_to_earliest_point() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 10).unwrap();

    insert_sequential(&db, "a", "b", 0..15);

    let mut iter = db.new_iterator("a", "b").unwrap();
    iter.seek(10).unwrap();
    iter.reset().unwrap();
    assert_eq!(iter.point().timestamp, 0);

    iter.next().unwrap();
    assert_eq!(iter.point().timestamp, 1);
    iter.close();

    db.close().unwrap();
}

#[test]
fn crash_between_compaction_and_wal_removal_recovers_from_wal() {
    let dir = TempDir::new().unwrap();

    // Simulate the crash state: a fully-written WAL and a stray snapshot for
    // the same partition id.
    let wal = FileWal::create(dir.path().join("7.wal")).unwrap();
    let rows: Vec<Row> = (0..5)
        .map(|t| Row::new("hostA", "m.1", Point::new(t, t as f64)))
        .collect();
    wal.append(&WalEntry {
        operation: WalOperation::Insert,
        rows,
    })
    .unwrap();
    wal.close().unwrap();

    std::fs::write(dir.path().join("7.part"), b"stale snapshot bytes").unwrap();

    let db = Db::open(dir.path(), 5, 10).unwrap();

    // The WAL is authoritative; the stray snapshot is gone.
    assert!(!has_partition_file(dir.path(), "7.part"));
    assert!(has_partition_file(dir.path(), "7.wal"));

    let points = query_points(&db, "hostA", "m.1", 0, 4);
    assert_eq!(points.len(), 5);

    // Newer partitions push the recovered one past the writable pair, so
    // compaction re-produces the snapshot and removes the WAL.
    insert_sequential(&db, "hostA", "m.1", 10..15);
    insert_sequential(&db, "hostA", "m.1", 15..20);

    assert!(
        wait_for(
            || {
                has_partition_file(dir.path(), "7.part")
                    && !has_partition_file(dir.path(), "7.wal")
            },
            Duration::from_secs(5)
        ),
        "compaction should re-produce 7.part and drop 7.wal"
    );

    let points = query_points(&db, "hostA", "m.1", 0, 4);
    assert_eq!(points.len(), 5);
    assert_eq!(points[2], Point::new(2, 2.0));

    db.close().unwrap();
}

#[test]
fn close_and_reopen_preserves_data_across_backends() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 10).unwrap();

    insert_sequential(&db, "a", "b", 0..25);

    // Let at least the oldest partition become a disk partition so reopening
    // exercises both recovery paths.
    assert!(wait_for(
        || has_partition_file(dir.path(), "1.part"),
        Duration::from_secs(5)
    ));

    db.close().unwrap();

    let db = Db::open(dir.path(), 5, 10).unwrap();
    let points = query_points(&db, "a", "b", -100, 100);
    assert_eq!(points.len(), 25);
    assert_eq!(db.min_timestamp(), 0);
    assert_eq!(db.max_timestamp(), 24);

    db.close().unwrap();
}

#[test]
fn compaction_is_transparent_to_queries() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 10).unwrap();

    insert_sequential(&db, "a", "b", 0..25);
    let before = query_points(&db, "a", "b", 0, 24);
    assert_eq!(before.len(), 25);

    assert!(wait_for(
        || has_partition_file(dir.path(), "1.part"),
        Duration::from_secs(5)
    ));

    let after = query_points(&db, "a", "b", 0, 24);
    assert_eq!(before, after);

    db.close().unwrap();
}

#[test]
fn query_with_inverted_range_returns_no_series() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 4).unwrap();

    insert_sequential(&db, "a", "b", 0..10);

    let response = db.query(&[QueryDesc {
        source: "a".to_string(),
        metric: "b".to_string(),
        start: 9,
        end: 3,
    }]);
    assert!(response.series.is_empty());

    db.close().unwrap();
}

#[test]
fn query_omits_empty_series_and_merges_partitions() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 10).unwrap();

    insert_sequential(&db, "web01", "cpu", 0..20);
    db.insert_rows(&[Row::new("web02", "cpu", Point::new(19, 1.0))])
        .unwrap();

    let response = db.query(&[
        QueryDesc {
            source: "web01".to_string(),
            metric: "cpu".to_string(),
            start: 0,
            end: 100,
        },
        QueryDesc {
            source: "nope".to_string(),
            metric: "cpu".to_string(),
            start: 0,
            end: 100,
        },
        QueryDesc {
            source: "web02".to_string(),
            metric: "cpu".to_string(),
            start: 0,
            end: 100,
        },
    ]);

    assert_eq!(response.series.len(), 2, "empty series must be omitted");

    let first = &response.series[0];
    assert_eq!(first.source, "web01");
    assert_eq!(first.points.len(), 20);
    assert_eq!(first.start, 0);
    assert_eq!(first.end, 19);

    let second = &response.series[1];
    assert_eq!(second.source, "web02");
    assert_eq!(second.points, vec![Point::new(19, 1.0)]);

    db.close().unwrap();
}

#[test]
fn sources_and_metrics_union_across_partitions() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 10).unwrap();

    db.insert_rows(&[
        Row::new("web01", "cpu", Point::new(1, 1.0)),
        Row::new("db01", "connections", Point::new(2, 1.0)),
    ])
    .unwrap();
    db.insert_rows(&[Row::new("web01", "mem", Point::new(7, 1.0))])
        .unwrap();

    assert_eq!(db.sources(0, 100), vec!["db01", "web01"]);
    assert_eq!(db.metrics("web01", 0, 100), vec!["cpu", "mem"]);
    // Range covering only the first window.
    assert_eq!(db.metrics("web01", 0, 4), vec!["cpu"]);
    assert!(db.sources(50, 100).is_empty());

    db.close().unwrap();
}

#[test]
fn new_requires_an_empty_directory() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("leftover"), b"x").unwrap();

    let err = Db::new(dir.path(), 5, 4).unwrap_err();
    assert!(matches!(err, StrataError::DirectoryInvalid { .. }));
}

#[test]
fn open_requires_an_existing_directory() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent");

    let err = Db::open(&missing, 5, 4).unwrap_err();
    assert!(matches!(err, StrataError::DirectoryInvalid { .. }));
}

#[test]
fn open_rejects_stray_files() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

    let err = Db::open(dir.path(), 5, 4).unwrap_err();
    assert!(matches!(err, StrataError::PartitionFileInvalid { .. }));
}

#[test]
fn constructors_validate_configuration() {
    let dir = TempDir::new().unwrap();

    assert!(matches!(
        Db::new(dir.path(), 0, 4),
        Err(StrataError::Config(_))
    ));
    assert!(matches!(
        Db::new(dir.path(), 5, 0),
        Err(StrataError::Config(_))
    ));
}

#[test]
fn query_response_round_trips_through_json() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 4).unwrap();

    insert_sequential(&db, "a", "b", 0..3);

    let response = db.query(&[QueryDesc {
        source: "a".to_string(),
        metric: "b".to_string(),
        start: 0,
        end: 10,
    }]);

    let encoded = serde_json::to_string(&response).unwrap();
    let decoded: strata::QueryResponse = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, response);

    db.close().unwrap();
}

#[test]
fn rows_spanning_multiple_windows_land_in_their_partitions() {
    let dir = TempDir::new().unwrap();
    let db = Db::new(dir.path(), 5, 10).unwrap();

    // One call spanning three windows, out of order.
    db.insert_rows(&[
        Row::new("a", "b", Point::new(11, 11.0)),
        Row::new("a", "b", Point::new(2, 2.0)),
        Row::new("a", "b", Point::new(7, 7.0)),
    ])
    .unwrap();

    let points = query_points(&db, "a", "b", 0, 20);
    let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
    assert_eq!(timestamps, vec![2, 7, 11]);

    db.close().unwrap();
}
