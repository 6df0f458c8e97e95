//! The database façade: ingest routing, query fan-out, partition lifecycle,
//! and the background compactor.

use crate::disk::DiskPartition;
use crate::iterator::SeriesIterator;
use crate::list::PartitionList;
use crate::memory::MemoryPartition;
use crate::partition::SharedPartition;
use crate::wal::FileWal;
use crate::{Point, QueryDesc, QueryResponse, Result, Row, Series, StrataError};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Cadence of the background compaction tick. The period is a latency knob,
/// not a correctness parameter.
const COMPACTION_INTERVAL: Duration = Duration::from_millis(50);

/// A handle to a strata database.
///
/// A `Db` shards incoming rows into time-windowed partitions, creates
/// partitions on demand, fans queries out across them, and runs a background
/// compactor that seals old in-memory partitions, persists them as disk
/// partitions, and drops partitions beyond the retention bound.
pub struct Db {
    base_dir: PathBuf,
    /// Timestamp units per partition window.
    partition_size: i64,
    /// Retention bound, in partitions.
    max_partitions: usize,

    list: Arc<PartitionList>,

    /// Monotonically increasing partition id; the next partition gets
    /// `last_partition_id + 1`.
    last_partition_id: AtomicU64,

    /// Observed timestamp bounds across all partitions. Relaxed by inserts,
    /// advanced by the retention sweep. `min` gates inserts: rows whose
    /// window falls below it are rejected as too old.
    min_timestamp: AtomicI64,
    max_timestamp: AtomicI64,

    /// Serializes partition creation so concurrent inserts cannot race to
    /// create duplicate partitions for the same window.
    partition_create_lock: Mutex<()>,

    compactor_stop: Mutex<Option<Sender<()>>>,
    compactor_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Creates a new database in `base_dir`, which is created if missing and
    /// must be empty.
    pub fn new(
        base_dir: impl AsRef<Path>,
        partition_size: i64,
        max_partitions: usize,
    ) -> Result<Arc<Self>> {
        validate_config(partition_size, max_partitions)?;

        let base_dir = base_dir.as_ref();
        fs::create_dir_all(base_dir)?;

        if fs::read_dir(base_dir)?.next().is_some() {
            return Err(StrataError::DirectoryInvalid {
                path: base_dir.to_path_buf(),
                reason: "directory is not empty".to_string(),
            });
        }

        check_fd_limit();

        let db = Arc::new(Self::empty(base_dir, partition_size, max_partitions));
        Self::start_compactor(&db)?;
        Ok(db)
    }

    /// Opens an existing database in `base_dir`, recovering every partition
    /// from its `<id>.wal` or `<id>.part` file in ascending id order.
    ///
    /// When both files exist for one id the process crashed between writing
    /// the snapshot and removing the WAL; the WAL is authoritative, the
    /// stale snapshot is deleted, and compaction re-runs later.
    pub fn open(
        base_dir: impl AsRef<Path>,
        partition_size: i64,
        max_partitions: usize,
    ) -> Result<Arc<Self>> {
        validate_config(partition_size, max_partitions)?;

        let base_dir = base_dir.as_ref();
        let metadata = fs::metadata(base_dir).map_err(|_| StrataError::DirectoryInvalid {
            path: base_dir.to_path_buf(),
            reason: "directory does not exist".to_string(),
        })?;
        if !metadata.is_dir() {
            return Err(StrataError::DirectoryInvalid {
                path: base_dir.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        check_fd_limit();

        let db = Arc::new(Self::empty(base_dir, partition_size, max_partitions));
        db.load_partitions()?;
        Self::start_compactor(&db)?;
        Ok(db)
    }

    fn empty(base_dir: &Path, partition_size: i64, max_partitions: usize) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            partition_size,
            max_partitions,
            list: Arc::new(PartitionList::new()),
            last_partition_id: AtomicU64::new(0),
            min_timestamp: AtomicI64::new(i64::MAX),
            max_timestamp: AtomicI64::new(i64::MIN),
            partition_create_lock: Mutex::new(()),
            compactor_stop: Mutex::new(None),
            compactor_thread: Mutex::new(None),
        }
    }

    /// Minimum retained timestamp. Inserts below its window are rejected.
    pub fn min_timestamp(&self) -> i64 {
        self.min_timestamp.load(Ordering::SeqCst)
    }

    /// Maximum observed timestamp.
    pub fn max_timestamp(&self) -> i64 {
        self.max_timestamp.load(Ordering::SeqCst)
    }

    fn window(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.partition_size)
    }

    /// Inserts the given rows, sharding them into partitions by window.
    ///
    /// The whole call is rejected with `TooOld` when any row's window falls
    /// below the minimum retained window. Rows spanning several partitions
    /// are appended to each partition's WAL independently, so the call is
    /// atomic per partition but not across partitions.
    pub fn insert_rows(&self, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        validate_rows(rows)?;

        let mut buckets: BTreeMap<i64, Vec<Row>> = BTreeMap::new();
        for row in rows {
            buckets
                .entry(self.window(row.point.timestamp))
                .or_default()
                .push(row.clone());
        }

        let min_ts = self.min_timestamp.load(Ordering::SeqCst);
        if self.list.size() > 0 && min_ts != i64::MAX {
            let min_window = self.window(min_ts);
            for (key, bucket) in &buckets {
                if *key < min_window {
                    let timestamp = bucket
                        .iter()
                        .map(|r| r.point.timestamp)
                        .min()
                        .unwrap_or(min_ts);
                    return Err(StrataError::TooOld { timestamp });
                }
            }
        }

        for (key, bucket) in buckets {
            let bucket_min = bucket.iter().map(|r| r.point.timestamp).min().unwrap_or(0);
            let bucket_max = bucket.iter().map(|r| r.point.timestamp).max().unwrap_or(0);

            self.insert_bucket(key, &bucket)?;

            relax_min(&self.min_timestamp, bucket_min);
            relax_max(&self.max_timestamp, bucket_max);
        }

        Ok(())
    }

    fn insert_bucket(&self, key: i64, rows: &[Row]) -> Result<()> {
        loop {
            if let Some(partition) = self.find_covering_partition(key) {
                partition.hold();
                // Sealing takes the exclusive hold, so the check cannot race
                // with the compactor once we hold the partition.
                if partition.read_only() {
                    partition.release();
                    return Err(StrataError::ReadOnlyPartition {
                        filename: partition.filename(),
                    });
                }
                let result = partition.insert_rows(rows);
                partition.release();
                return result;
            }

            let _create_guard = self.partition_create_lock.lock();

            // Another writer may have created the partition while we waited.
            if self.find_covering_partition(key).is_some() {
                continue;
            }

            if self.list.size() != 0
                && key <= self.window(self.max_timestamp.load(Ordering::SeqCst))
            {
                // The bucket falls into a gap between existing windows; only
                // buckets newer than the current maximum window may create
                // partitions.
                let timestamp = rows.iter().map(|r| r.point.timestamp).min().unwrap_or(0);
                return Err(StrataError::TooOld { timestamp });
            }

            let id = self.last_partition_id.fetch_add(1, Ordering::SeqCst) + 1;
            let wal_path = self.base_dir.join(format!("{id}.wal"));
            let wal = FileWal::create(&wal_path)?;
            let partition: SharedPartition = Arc::new(MemoryPartition::new(wal));

            // Fill the partition before registering it so the registry never
            // holds an empty head with sentinel bounds.
            if let Err(e) = partition.insert_rows(rows) {
                if let Err(destroy_err) = partition.destroy() {
                    warn!(
                        wal = %wal_path.display(),
                        error = %destroy_err,
                        "failed to clean up partition after insert failure"
                    );
                }
                return Err(e);
            }

            if let Err(e) = self.list.insert(Arc::clone(&partition)) {
                let _ = partition.destroy();
                return Err(e);
            }

            debug!(id, window = key, "created partition");
            return Ok(());
        }
    }

    /// Finds the partition whose window covers `key`: either its minimum
    /// timestamp lands in the window, or the window lies between its bounds.
    fn find_covering_partition(&self, key: i64) -> Option<SharedPartition> {
        for partition in self.list.iter() {
            let min = partition.min_timestamp();
            if min == i64::MAX {
                continue;
            }

            let min_window = self.window(min);
            if min_window == key
                || (min_window < key && self.window(partition.max_timestamp()) >= key)
            {
                return Some(partition);
            }
        }
        None
    }

    /// Fetches the series matching each description.
    ///
    /// Partitions overlapping the requested range are queried in parallel; a
    /// partition that fails is logged and skipped, so the response carries
    /// whatever series were collected. Empty series are omitted.
    pub fn query(&self, descs: &[QueryDesc]) -> QueryResponse {
        let mut response = QueryResponse::default();

        for desc in descs {
            let partitions: Vec<SharedPartition> = self
                .list
                .iter()
                .filter(|p| overlaps(p, desc.start, desc.end))
                .collect();

            let mut points = Vec::new();
            thread::scope(|scope| {
                let handles: Vec<_> = partitions
                    .iter()
                    .map(|partition| {
                        let partition = Arc::clone(partition);
                        scope.spawn(move || {
                            partition.hold();
                            let result = partition.fetch_points(
                                &desc.source,
                                &desc.metric,
                                desc.start,
                                desc.end,
                            );
                            partition.release();
                            result
                        })
                    })
                    .collect();

                for (handle, partition) in handles.into_iter().zip(&partitions) {
                    match handle.join() {
                        Ok(Ok(partition_points)) => points.extend(partition_points),
                        Ok(Err(
                            StrataError::SourceNotFound { .. } | StrataError::MetricNotFound { .. },
                        )) => {}
                        Ok(Err(e)) => warn!(
                            partition = %partition.filename().display(),
                            error = %e,
                            "query failed on partition; skipping"
                        ),
                        Err(_) => warn!("query worker panicked"),
                    }
                }
            });

            points.sort_by_key(|p: &Point| p.timestamp);

            if points.is_empty() {
                continue;
            }

            response.series.push(Series {
                start: points[0].timestamp,
                end: points[points.len() - 1].timestamp,
                source: desc.source.clone(),
                metric: desc.metric.clone(),
                points,
            });
        }

        response
    }

    /// Returns the sources with data inside `[start, end]`, sorted and
    /// de-duplicated across partitions.
    pub fn sources(&self, start: i64, end: i64) -> Vec<String> {
        let mut set = BTreeSet::new();

        for partition in self.list.iter() {
            partition.hold();
            if partition.max_timestamp() >= start && partition.min_timestamp() <= end {
                set.extend(partition.sources());
            }
            partition.release();
        }

        set.into_iter().collect()
    }

    /// Returns the metrics of `source` with data inside `[start, end]`,
    /// sorted and de-duplicated across partitions.
    pub fn metrics(&self, source: &str, start: i64, end: i64) -> Vec<String> {
        let mut set = BTreeSet::new();

        for partition in self.list.iter() {
            partition.hold();
            if partition.max_timestamp() >= start && partition.min_timestamp() <= end {
                set.extend(partition.metrics(source));
            }
            partition.release();
        }

        set.into_iter().collect()
    }

    /// Returns a cursor over (source, metric) across all partitions,
    /// positioned before the first point.
    pub fn new_iterator(&self, source: &str, metric: &str) -> Result<SeriesIterator> {
        SeriesIterator::new(Arc::clone(&self.list), source, metric)
    }

    /// Closes the database: stops the compactor, waits for any in-flight
    /// tick, then seals and closes every partition. WAL and partition files
    /// stay on disk for a later [`open`](Db::open).
    pub fn close(&self) -> Result<()> {
        self.stop_compactor();

        let partitions: Vec<SharedPartition> = self.list.iter().collect();
        for partition in partitions {
            self.list.remove(&partition)?;

            partition.exclusive_hold();
            partition.set_read_only();
            let result = partition.close();
            partition.exclusive_release();
            result?;
        }

        Ok(())
    }

    fn load_partitions(&self) -> Result<()> {
        // First pass: classify files and resolve WAL-vs-snapshot conflicts.
        let mut kinds: BTreeMap<u64, bool> = BTreeMap::new();

        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let (id, is_wal) = parse_partition_file_name(&name)?;

            match kinds.get_mut(&id) {
                Some(seen_wal) => {
                    // Both <id>.wal and <id>.part exist: the crash happened
                    // between compaction and WAL removal. The WAL wins; drop
                    // the stale snapshot and recompact.
                    warn!(id, "found both WAL and snapshot; removing stale snapshot");
                    fs::remove_file(self.base_dir.join(format!("{id}.part")))?;
                    *seen_wal = true;
                }
                None => {
                    kinds.insert(id, is_wal);
                }
            }
        }

        // Second pass: open partitions in ascending id order.
        for (&id, &is_wal) in &kinds {
            let partition: SharedPartition = if is_wal {
                let path = self.base_dir.join(format!("{id}.wal"));
                let wal = FileWal::open(&path)?;
                Arc::new(MemoryPartition::recover(wal)?)
            } else {
                let path = self.base_dir.join(format!("{id}.part"));
                Arc::new(DiskPartition::open(&path)?)
            };

            if self.last_partition_id.load(Ordering::SeqCst) < id {
                self.last_partition_id.store(id, Ordering::SeqCst);
            }

            let min = partition.min_timestamp();
            let max = partition.max_timestamp();
            if min <= max {
                relax_min(&self.min_timestamp, min);
                relax_max(&self.max_timestamp, max);
            }

            self.list.insert(partition)?;
        }

        if !kinds.is_empty() {
            info!(partitions = kinds.len(), dir = %self.base_dir.display(), "loaded partitions");
        }

        Ok(())
    }

    fn start_compactor(db: &Arc<Db>) -> Result<()> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        *db.compactor_stop.lock() = Some(stop_tx);

        let weak = Arc::downgrade(db);
        let handle = thread::Builder::new()
            .name("strata-compactor".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(COMPACTION_INTERVAL) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            let Some(db) = weak.upgrade() else { break };
                            db.compact();
                        }
                    }
                }
            })?;

        *db.compactor_thread.lock() = Some(handle);
        Ok(())
    }

    fn stop_compactor(&self) {
        if let Some(tx) = self.compactor_stop.lock().take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.compactor_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// One compaction tick: drop retention overflow, seal cold partitions,
    /// then materialize sealed memory partitions onto disk.
    fn compact(&self) {
        self.drop_expired_partitions();

        for partition in self.seal_compactable_partitions() {
            if let Err(e) = self.materialize(&partition) {
                error!(
                    partition = %partition.filename().display(),
                    error = %e,
                    "compaction failed; will retry"
                );
            }
        }
    }

    /// Removes every partition beyond the newest `max_partitions` and
    /// advances the minimum retained timestamp so future inserts refuse
    /// older rows.
    fn drop_expired_partitions(&self) {
        let mut seen = 0usize;
        let mut last_min = 0i64;

        for partition in self.list.iter() {
            seen += 1;
            if seen <= self.max_partitions {
                last_min = partition.min_timestamp();
                continue;
            }

            self.min_timestamp.store(last_min, Ordering::SeqCst);

            if let Err(e) = self.list.remove(&partition) {
                warn!(error = %e, "failed to remove expired partition");
                continue;
            }

            partition.exclusive_hold();
            if let Err(e) = partition.destroy() {
                error!(
                    partition = %partition.filename().display(),
                    error = %e,
                    "failed to destroy expired partition"
                );
            }
            partition.exclusive_release();

            info!(partition = %partition.filename().display(), "dropped expired partition");
        }
    }

    /// Seals every writable partition beyond the newest two and returns the
    /// memory partitions awaiting materialization, including sealed ones
    /// whose earlier materialization failed.
    fn seal_compactable_partitions(&self) -> Vec<SharedPartition> {
        let mut candidates = Vec::new();

        for (i, partition) in self.list.iter().enumerate() {
            // The newest partition takes writes and the next newest may
            // still receive late rows; both stay writable.
            if i < 2 {
                continue;
            }

            if !partition.read_only() {
                partition.exclusive_hold();
                partition.set_read_only();
                partition.exclusive_release();
            }

            // Memory partitions are backed by a WAL file; disk partitions
            // have nothing left to materialize.
            if partition
                .filename()
                .extension()
                .is_some_and(|ext| ext == "wal")
            {
                candidates.push(partition);
            }
        }

        candidates
    }

    /// Promotes a sealed memory partition to a disk partition: writes the
    /// snapshot beside the WAL, opens it, swaps it into the registry, and
    /// destroys the memory partition along with its WAL.
    fn materialize(&self, partition: &SharedPartition) -> Result<()> {
        let wal_path = partition.filename();
        let part_path = wal_path.with_extension("part");

        let open_result = (|| -> Result<Option<DiskPartition>> {
            let mut file = File::create(&part_path)?;
            if !partition.compact_into(&mut file)? {
                return Ok(None);
            }
            file.sync_all()?;
            drop(file);
            Ok(Some(DiskPartition::open(&part_path)?))
        })();

        let disk: SharedPartition = match open_result {
            Ok(Some(disk)) => Arc::new(disk),
            Ok(None) => {
                let _ = fs::remove_file(&part_path);
                return Ok(());
            }
            Err(e) => {
                let _ = fs::remove_file(&part_path);
                return Err(e);
            }
        };

        // The swap is the linearization point: readers already holding the
        // memory partition keep it alive; new readers see the disk backend.
        if let Err(e) = self.list.swap(partition, Arc::clone(&disk)) {
            let _ = disk.destroy();
            return Err(e);
        }

        partition.exclusive_hold();
        let destroyed = partition.destroy();
        partition.exclusive_release();
        destroyed?;

        info!(
            from = %wal_path.display(),
            to = %part_path.display(),
            "compacted partition"
        );
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.stop_compactor();
    }
}

fn validate_config(partition_size: i64, max_partitions: usize) -> Result<()> {
    if partition_size < 1 {
        return Err(StrataError::Config(
            "partition_size must be a positive number of timestamp units".to_string(),
        ));
    }
    if max_partitions < 1 {
        return Err(StrataError::Config(
            "max_partitions must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_rows(rows: &[Row]) -> Result<()> {
    for row in rows {
        if row.source.len() > u8::MAX as usize {
            return Err(StrataError::InvalidName {
                name: row.source.clone(),
                reason: "source name longer than 255 bytes".to_string(),
            });
        }
        if row.metric.len() > u8::MAX as usize {
            return Err(StrataError::InvalidName {
                name: row.metric.clone(),
                reason: "metric name longer than 255 bytes".to_string(),
            });
        }
    }
    Ok(())
}

/// Parses `<id>.wal` or `<id>.part`, returning the id and whether the file
/// is a WAL.
fn parse_partition_file_name(name: &str) -> Result<(u64, bool)> {
    let invalid = || StrataError::PartitionFileInvalid {
        name: name.to_string(),
    };

    let (stem, is_wal) = if let Some(stem) = name.strip_suffix(".wal") {
        (stem, true)
    } else if let Some(stem) = name.strip_suffix(".part") {
        (stem, false)
    } else {
        return Err(invalid());
    };

    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let id: u64 = stem.parse().map_err(|_| invalid())?;
    if id == 0 {
        return Err(invalid());
    }

    Ok((id, is_wal))
}

fn overlaps(partition: &SharedPartition, start: i64, end: i64) -> bool {
    let min = partition.min_timestamp();
    if min >= start {
        min <= end
    } else {
        partition.max_timestamp() >= start
    }
}

fn relax_min(slot: &AtomicI64, candidate: i64) {
    let mut current = slot.load(Ordering::Acquire);
    while candidate < current {
        match slot.compare_exchange_weak(current, candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

fn relax_max(slot: &AtomicI64, candidate: i64) {
    let mut current = slot.load(Ordering::Acquire);
    while candidate > current {
        match slot.compare_exchange_weak(current, candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(unix)]
fn check_fd_limit() {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe {
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) == 0 {
            // Every partition keeps a file or mapping open.
            if rlim.rlim_cur < 100 {
                warn!(
                    limit = rlim.rlim_cur,
                    "low file descriptor limit; consider raising it with 'ulimit -n'"
                );
            }
        }
    }
}

#[cfg(not(unix))]
fn check_fd_limit() {}
