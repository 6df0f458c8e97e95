//! Write-ahead log implementation.
//!
//! Each entry is a fixed-width header followed by a gzip-compressed payload:
//!
//! ```text
//! magic      : u32 le = 0x11141993
//! op         : u8
//! num_rows   : u32 le
//! entry_size : u32 le   (byte length of the compressed payload)
//! payload    : gzip stream of rows
//! ```
//!
//! The fixed-width header allows skipping entries without inflating them, and
//! the gzip framing makes a torn tail write fail cleanly on read. Recovery
//! reads entries until the first error and then truncates back to the last
//! fully-read offset.

use crate::{Point, Result, Row, StrataError};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic sequence marking the start of every WAL entry.
pub const WAL_MAGIC: u32 = 0x1114_1993;

/// WAL operation types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOperation {
    Insert = 0,
}

impl WalOperation {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(WalOperation::Insert),
            _ => None,
        }
    }
}

/// An entry in the write-ahead log: one operation applied to a batch of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub operation: WalOperation,
    pub rows: Vec<Row>,
}

/// A write-ahead log backed by a single file on disk.
///
/// Appends and reads are mutually exclusive; one lock serializes both.
pub struct FileWal {
    filename: PathBuf,
    inner: Mutex<WalFile>,
}

struct WalFile {
    file: Option<File>,
    /// End offset of the last fully-read entry. Truncating to this offset
    /// discards any trailing partial or corrupt record.
    last_read_offset: u64,
}

impl FileWal {
    /// Creates a new WAL file at `path`. Fails if the file already exists, so
    /// racing creators cannot share a log.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        Ok(Self {
            filename: path.to_path_buf(),
            inner: Mutex::new(WalFile {
                file: Some(file),
                last_read_offset: 0,
            }),
        })
    }

    /// Opens an existing WAL file for recovery and further appends.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            filename: path.to_path_buf(),
            inner: Mutex::new(WalFile {
                file: Some(file),
                last_read_offset: 0,
            }),
        })
    }

    /// Appends an entry and syncs it to durable storage.
    ///
    /// The file offset before the write is recorded as a rollback point; a
    /// failed write truncates back to it so the log never retains a torn
    /// entry. Returns the number of bytes written.
    pub fn append(&self, entry: &WalEntry) -> Result<usize> {
        let encoded = encode_entry(entry)?;

        let mut inner = self.inner.lock();
        let file = inner.file.as_mut().ok_or(StrataError::InvalidWalFile)?;

        let rollback = file.seek(SeekFrom::End(0))?;

        if let Err(e) = file.write_all(&encoded) {
            file.set_len(rollback)?;
            file.seek(SeekFrom::Start(rollback))?;
            return Err(e.into());
        }

        file.sync_all()?;
        Ok(encoded.len())
    }

    /// Reads the next entry from the current file position.
    ///
    /// On success the last-read offset advances to the post-entry position.
    /// On any failure (short read, bad magic, gzip error) the offset is left
    /// at the previous good boundary; the caller decides when to
    /// [`truncate`](FileWal::truncate).
    pub fn read_entry(&self) -> Result<WalEntry> {
        let mut inner = self.inner.lock();
        let file = inner.file.as_mut().ok_or(StrataError::InvalidWalFile)?;

        let magic = read_u32(file)?;
        if magic != WAL_MAGIC {
            return Err(StrataError::InvalidWalMagic);
        }

        let op = read_u8(file)?;
        let operation = WalOperation::from_u8(op).ok_or(StrataError::InvalidWalFile)?;

        let num_rows = read_u32(file)?;
        let entry_size = read_u32(file)?;

        // A torn header can carry an arbitrary size; never trust it past the
        // bytes actually present.
        let remaining = file
            .metadata()?
            .len()
            .saturating_sub(file.stream_position()?);
        if entry_size as u64 > remaining {
            return Err(StrataError::InvalidWalFile);
        }

        let mut payload = vec![0u8; entry_size as usize];
        file.read_exact(&mut payload)?;
        let post_entry = file.stream_position()?;

        let rows = decode_rows(&payload, num_rows)?;

        // Only a fully-decoded entry advances the good boundary.
        inner.last_read_offset = post_entry;

        Ok(WalEntry { operation, rows })
    }

    /// Truncates the file to the last fully-read offset so appends resume
    /// from a clean entry boundary.
    pub fn truncate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let offset = inner.last_read_offset;
        let file = inner.file.as_mut().ok_or(StrataError::InvalidWalFile)?;
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Flushes pending writes and closes the file. The file stays on disk for
    /// later recovery; any further operation fails with `InvalidWalFile`.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.take() {
            file.sync_all()?;
        }
        inner.last_read_offset = 0;
        Ok(())
    }

    /// Closes the WAL and removes the file on disk.
    pub fn destroy(&self) -> Result<()> {
        self.close()?;
        std::fs::remove_file(&self.filename)?;
        Ok(())
    }

    /// Path of the backing file.
    pub fn filename(&self) -> &Path {
        &self.filename
    }
}

fn encode_entry(entry: &WalEntry) -> Result<Vec<u8>> {
    // Uncompressed gzip framing: the stream exists for torn-tail detection,
    // and WAL appends sit on the insert path.
    let mut encoder = GzEncoder::new(Vec::new(), Compression::none());

    for row in &entry.rows {
        let source = row.source.as_bytes();
        let metric = row.metric.as_bytes();
        if source.len() > u8::MAX as usize || metric.len() > u8::MAX as usize {
            return Err(StrataError::InvalidName {
                name: format!("{}/{}", row.source, row.metric),
                reason: "name longer than 255 bytes".to_string(),
            });
        }

        encoder.write_all(&[source.len() as u8, metric.len() as u8])?;
        encoder.write_all(source)?;
        encoder.write_all(metric)?;
        encoder.write_all(&row.point.timestamp.to_le_bytes())?;
        encoder.write_all(&row.point.value.to_le_bytes())?;
    }

    let payload = encoder.finish()?;

    let mut buf = Vec::with_capacity(13 + payload.len());
    buf.extend_from_slice(&WAL_MAGIC.to_le_bytes());
    buf.push(entry.operation as u8);
    buf.extend_from_slice(&(entry.rows.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);

    Ok(buf)
}

fn decode_rows(payload: &[u8], num_rows: u32) -> Result<Vec<Row>> {
    let mut decoder = GzDecoder::new(payload);
    let mut uncompressed = Vec::new();
    decoder.read_to_end(&mut uncompressed)?;

    let mut reader = &uncompressed[..];
    // Every row takes at least 18 bytes; a larger claimed count cannot decode.
    if num_rows as usize > uncompressed.len() / 18 {
        return Err(StrataError::InvalidWalFile);
    }
    let mut rows = Vec::with_capacity(num_rows as usize);

    for _ in 0..num_rows {
        let source_len = read_u8(&mut reader)? as usize;
        let metric_len = read_u8(&mut reader)? as usize;

        let mut names = vec![0u8; source_len + metric_len];
        reader.read_exact(&mut names)?;

        let source = String::from_utf8(names[..source_len].to_vec())
            .map_err(|_| StrataError::InvalidWalFile)?;
        let metric = String::from_utf8(names[source_len..].to_vec())
            .map_err(|_| StrataError::InvalidWalFile)?;

        let timestamp = read_i64(&mut reader)?;
        let value = f64::from_bits(read_u64(&mut reader)?);

        rows.push(Row::new(source, metric, Point::new(timestamp, value)));
    }

    Ok(rows)
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}
