//! TANDEM - SSTable (Sorted String Table)
//! Immutable on-disk sorted run produced by flushing a sealed MemTable
//! or by compaction.
//!
//! ## Record Format
//! ```text
//! [marker: 1 byte][key_len: 4 bytes (LE)][key][value_len: 4 bytes (LE)][value]
//! ```
//! `marker` is `0` for a value and `1` for a tombstone; tombstones omit
//! both value fields. The sparse index and the Bloom filter are rebuilt
//! from the records on every open and are never persisted.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Result, TandemError};
use crate::types::{Entry, Key, Value};

use super::bloom::BloomFilter;

pub const VALUE_MARKER: u8 = 0;
pub const TOMBSTONE_MARKER: u8 = 1;

/// `[marker][key_len]`
const RECORD_HEADER: usize = 5;

/// Read-ahead for sequential scans.
const SCAN_BUFFER: usize = 64 * 1024;

/// Per-table structures built on open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableOptions {
    /// Every Nth record goes into the sparse index.
    pub index_interval: usize,
    /// Target false positive rate of the Bloom filter.
    pub bloom_false_positive_rate: f64,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            index_interval: 16,
            bloom_false_positive_rate: 0.01,
        }
    }
}

impl From<&Config> for TableOptions {
    fn from(config: &Config) -> Self {
        Self {
            index_interval: config.sparse_index_interval,
            bloom_false_positive_rate: config.bloom_false_positive_rate,
        }
    }
}

/// File name for the table with `id`. Zero-padded so names sort by id.
pub fn table_file_name(id: u64) -> String {
    format!("{:020}.sst", id)
}

/// Parse the table id out of a `{id}.sst` path.
pub fn parse_table_id(path: &Path) -> Option<u64> {
    if path.extension()? != "sst" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Streams sorted records into a new table file.
///
/// Records go to `{name}.tmp` and the file is renamed into place by
/// `finish`, so a crash never leaves a half-written `.sst` behind.
pub struct SSTableWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    buf: BytesMut,
    last_key: Option<Key>,
    entry_count: usize,
}

impl SSTableWriter {
    pub fn create(dir: &Path, id: u64) -> Result<Self> {
        let path = dir.join(table_file_name(id));
        let tmp_path = path.with_extension("sst.tmp");
        let file = File::create(&tmp_path)?;
        Ok(Self {
            path,
            tmp_path,
            writer: BufWriter::new(file),
            buf: BytesMut::with_capacity(256),
            last_key: None,
            entry_count: 0,
        })
    }

    /// Append a record. Keys must arrive in strictly ascending order.
    pub fn add(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if let Some(last) = &self.last_key {
            if last.as_slice() >= key {
                return Err(TandemError::Corruption(format!(
                    "SSTable keys out of order: {:?} after {:?}",
                    key, last
                )));
            }
        }

        self.buf.clear();
        match value {
            Some(value) => {
                self.buf.put_u8(VALUE_MARKER);
                self.buf.put_u32_le(key.len() as u32);
                self.buf.put_slice(key);
                self.buf.put_u32_le(value.len() as u32);
                self.buf.put_slice(value);
            }
            None => {
                self.buf.put_u8(TOMBSTONE_MARKER);
                self.buf.put_u32_le(key.len() as u32);
                self.buf.put_slice(key);
            }
        }
        self.writer.write_all(&self.buf)?;
        self.last_key = Some(key.to_vec());
        self.entry_count += 1;
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Flush, fsync and move the file into place. Returns its final path.
    pub fn finish(self) -> Result<PathBuf> {
        let file = self
            .writer
            .into_inner()
            .map_err(|err| TandemError::Io(err.into_error()))?;
        file.sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(self.path)
    }

    /// Drop the partial output.
    pub fn abandon(self) {
        let tmp_path = self.tmp_path.clone();
        drop(self.writer);
        if let Err(err) = fs::remove_file(&tmp_path) {
            log::warn!("Failed to remove partial SSTable {:?}: {}", tmp_path, err);
        }
    }
}

/// An open, immutable SSTable with its sparse index and Bloom filter.
///
/// All reads go through the handle opened here, so a table keeps serving
/// its own records even after a compaction output is renamed over its path.
pub struct SSTable {
    id: u64,
    path: PathBuf,
    file: Mutex<File>,
    /// Every Nth record's key and byte offset, ascending.
    index: Vec<(Key, u64)>,
    bloom: BloomFilter,
    /// Point lookups answered by the filter without touching the file.
    bloom_rejections: AtomicU64,
    min_key: Key,
    max_key: Key,
    entry_count: usize,
    file_size: u64,
    /// Set once a compaction has replaced this table; the file is removed
    /// when the last reader lets go.
    obsolete: AtomicBool,
}

impl std::fmt::Debug for SSTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTable")
            .field("id", &self.id)
            .field("entries", &self.entry_count)
            .field("bytes", &self.file_size)
            .finish()
    }
}

impl SSTable {
    /// Open a table file and rebuild its sparse index and Bloom filter.
    pub fn open(id: u64, path: PathBuf, options: &TableOptions) -> Result<Self> {
        let index_interval = options.index_interval.max(1);
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file.try_clone()?);

        let mut index = Vec::new();
        let mut hashes = Vec::new();
        let mut min_key = Vec::new();
        let mut max_key = Vec::new();
        let mut entry_count = 0usize;
        let mut offset = 0u64;

        while let Some((entry, len)) = read_record(&mut reader, offset, false)? {
            if entry_count > 0 && entry.key <= max_key {
                return Err(TandemError::Corruption(format!(
                    "SSTable {:?}: keys out of order at offset {}",
                    path, offset
                )));
            }
            if entry_count % index_interval == 0 {
                index.push((entry.key.clone(), offset));
            }
            hashes.push(BloomFilter::hash_pair(&entry.key));
            if entry_count == 0 {
                min_key = entry.key.clone();
            }
            max_key = entry.key;
            entry_count += 1;
            offset += len;
        }

        let mut bloom = BloomFilter::new(entry_count, options.bloom_false_positive_rate);
        for pair in hashes {
            bloom.insert_hashed(pair);
        }

        log::debug!(
            "Opened SSTable {} ({} entries, {} index points, {} filter bytes)",
            id,
            entry_count,
            index.len(),
            bloom.memory_usage()
        );

        Ok(Self {
            id,
            path,
            file: Mutex::new(file),
            index,
            bloom,
            bloom_rejections: AtomicU64::new(0),
            min_key,
            max_key,
            entry_count,
            file_size,
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    pub fn bloom_rejections(&self) -> u64 {
        self.bloom_rejections.load(Ordering::Relaxed)
    }

    /// Offset of the last index point at or before `key`.
    fn seek_offset(&self, key: &[u8]) -> u64 {
        let slot = self.index.partition_point(|(k, _)| k.as_slice() <= key);
        slot.checked_sub(1).map_or(0, |i| self.index[i].1)
    }

    /// Point lookup. `Some(None)` means the key is tombstoned here.
    pub fn get(&self, key: &[u8]) -> Result<Option<Option<Value>>> {
        if self.entry_count == 0 || key < self.min_key.as_slice() || key > self.max_key.as_slice() {
            return Ok(None);
        }
        if !self.bloom.may_contain(key) {
            self.bloom_rejections.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let slot = self.index.partition_point(|(k, _)| k.as_slice() <= key);
        let Some(start) = slot.checked_sub(1).map(|i| self.index[i].1) else {
            return Ok(None);
        };
        let end = self.index.get(slot).map_or(self.file_size, |(_, off)| *off);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(start))?;
        let mut reader = BufReader::new(&mut *file);
        let mut offset = start;

        while offset < end {
            let Some((entry, len)) = read_record(&mut reader, offset, true)? else {
                break;
            };
            match entry.key.as_slice().cmp(key) {
                std::cmp::Ordering::Less => offset += len,
                std::cmp::Ordering::Equal => return Ok(Some(entry.value)),
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Iterate records with keys `>= start` in order. The iterator keeps
    /// the table alive, so its file outlives any concurrent compaction.
    pub fn scan_from(self: &Arc<Self>, start: &[u8]) -> Result<SSTableIter> {
        let offset = self.seek_offset(start);
        let reader = TableReader {
            table: Arc::clone(self),
            pos: offset,
        };
        Ok(SSTableIter {
            reader: BufReader::with_capacity(SCAN_BUFFER, reader),
            offset,
            start: start.to_vec(),
            done: false,
        })
    }

    /// Iterate every record.
    pub fn scan(self: &Arc<Self>) -> Result<SSTableIter> {
        self.scan_from(&[])
    }

    pub(crate) fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for SSTable {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            match fs::remove_file(&self.path) {
                Ok(()) => log::debug!("Removed obsolete SSTable {}", self.id),
                Err(err) => log::warn!("Failed to remove SSTable {:?}: {}", self.path, err),
            }
        }
    }
}

/// Positional reads through the table's shared handle. Point lookups
/// move the same handle, so every read seeks first.
struct TableReader {
    table: Arc<SSTable>,
    pos: u64,
}

impl Read for TableReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.table.file.lock();
        file.seek(SeekFrom::Start(self.pos))?;
        let n = file.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Sequential reader over one table's records.
pub struct SSTableIter {
    reader: BufReader<TableReader>,
    offset: u64,
    start: Key,
    done: bool,
}

impl Iterator for SSTableIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match read_record(&mut self.reader, self.offset, true) {
                Ok(Some((entry, len))) => {
                    self.offset += len;
                    if entry.key < self.start {
                        continue;
                    }
                    return Some(Ok(entry));
                }
                Ok(None) => self.done = true,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

/// Read one record at `offset`. Returns `None` at a clean end of file and
/// `Corruption` for a truncated or malformed record. With `want_value`
/// false the value bytes are skipped and the entry carries an empty value.
fn read_record<R: Read>(
    reader: &mut R,
    offset: u64,
    want_value: bool,
) -> Result<Option<(Entry, u64)>> {
    let mut header = [0u8; RECORD_HEADER];
    let first = loop {
        match reader.read(&mut header[..1]) {
            Ok(n) => break n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    };
    if first == 0 {
        return Ok(None);
    }
    read_exact_or_corrupt(reader, &mut header[1..], offset)?;

    let mut hdr = &header[..];
    let marker = hdr.get_u8();
    let key_len = hdr.get_u32_le() as usize;

    let mut key = vec![0u8; key_len];
    read_exact_or_corrupt(reader, &mut key, offset)?;
    let mut len = (RECORD_HEADER + key_len) as u64;

    let value = match marker {
        TOMBSTONE_MARKER => None,
        VALUE_MARKER => {
            let mut len_buf = [0u8; 4];
            read_exact_or_corrupt(reader, &mut len_buf, offset)?;
            let value_len = (&len_buf[..]).get_u32_le() as u64;
            len += 4 + value_len;
            if want_value {
                let mut value = vec![0u8; value_len as usize];
                read_exact_or_corrupt(reader, &mut value, offset)?;
                Some(value)
            } else {
                let skipped = io::copy(&mut reader.take(value_len), &mut io::sink())?;
                if skipped != value_len {
                    return Err(truncated(offset));
                }
                Some(Vec::new())
            }
        }
        other => {
            return Err(TandemError::Corruption(format!(
                "invalid SSTable marker {} at offset {}",
                other, offset
            )))
        }
    };

    Ok(Some((Entry { key, value }, len)))
}

fn read_exact_or_corrupt<R: Read>(reader: &mut R, buf: &mut [u8], offset: u64) -> Result<()> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            truncated(offset)
        } else {
            err.into()
        }
    })
}

fn truncated(offset: u64) -> TandemError {
    TandemError::Corruption(format!("truncated SSTable record at offset {}", offset))
}
