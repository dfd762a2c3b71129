//! TANDEM - Write-Ahead Log (WAL)
//! Provides durability by logging all mutations to disk
//! before they are applied to either backend.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TandemError};
use crate::types::{now_millis, Key, Lsn, Operation, TxId, Value};

/// Frame kinds stored in the log.
const ENTRY_FRAME: u8 = 1;
const CHECKPOINT_FRAME: u8 = 2;

/// `[len: 4][crc: 4]` precede every frame body.
const FRAME_HEADER: usize = 8;

/// A logical mutation as recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub lsn: Lsn,
    pub transaction_id: TxId,
    pub operation: Operation,
    pub key: Key,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointMarker {
    lsn: Lsn,
}

/// What `WriteAheadLog::recover` found on disk.
#[derive(Debug, Default)]
pub struct WalRecovery {
    /// Records newer than the last checkpoint, in LSN order.
    pub entries: Vec<LogEntry>,
    /// LSN recorded by the last checkpoint marker (0 if none).
    pub checkpoint_lsn: Lsn,
    /// First LSN the reopened log should hand out.
    pub next_lsn: Lsn,
    /// Bytes dropped from the tail because the final frame was torn.
    pub truncated_bytes: u64,
}

/// A decoded frame.
enum Frame {
    Entry(LogEntry),
    Checkpoint(Lsn),
}

/// Write-Ahead Log for crash recovery and durability.
///
/// ## Binary Format (per frame)
/// ```text
/// [len: 4 bytes (LE)][crc: 4 bytes (LE)][kind: 1 byte][payload: len - 1 bytes]
/// ```
/// `crc` covers `kind` and `payload`. Entry payloads are bincode-encoded
/// `LogEntry` values; checkpoint payloads carry the last stable LSN.
pub struct WriteAheadLog {
    /// Path to the WAL file on disk.
    path: PathBuf,
    /// Append handle; the lock serializes appends so file order is LSN order.
    writer: Mutex<WalWriter>,
    next_lsn: AtomicU64,
    checkpoint_lsn: AtomicU64,
}

struct WalWriter {
    file: File,
    size: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
}

impl WriteAheadLog {
    /// Open or create a WAL file, handing out LSNs from `recovery.next_lsn`.
    pub fn open(path: PathBuf, recovery: &WalRecovery) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            writer: Mutex::new(WalWriter {
                file,
                size,
                poisoned: false,
            }),
            next_lsn: AtomicU64::new(recovery.next_lsn.max(1)),
            checkpoint_lsn: AtomicU64::new(recovery.checkpoint_lsn),
        })
    }

    /// Returns the path to the WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.writer.lock().size
    }

    /// The most recently assigned LSN (0 if none).
    pub fn last_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::Acquire).saturating_sub(1)
    }

    /// LSN of the latest checkpoint marker.
    pub fn checkpoint_lsn(&self) -> Lsn {
        self.checkpoint_lsn.load(Ordering::Acquire)
    }

    /// Append a mutation and fsync it. Returns the assigned LSN.
    /// The caller must not apply the mutation if this fails.
    pub fn append(
        &self,
        tx_id: TxId,
        operation: Operation,
        key: &[u8],
        old_value: Option<&[u8]>,
        new_value: Option<&[u8]>,
    ) -> Result<Lsn> {
        let mut writer = self.writer.lock();
        if writer.poisoned {
            return Err(TandemError::Corruption(
                "WAL is unusable after a failed append".into(),
            ));
        }

        let lsn = self.next_lsn.load(Ordering::Acquire);
        let entry = LogEntry {
            lsn,
            transaction_id: tx_id,
            operation,
            key: key.to_vec(),
            old_value: old_value.map(<[u8]>::to_vec),
            new_value: new_value.map(<[u8]>::to_vec),
            timestamp: now_millis(),
        };
        let frame = encode_frame(ENTRY_FRAME, &bincode::serialize(&entry)?);

        writer.write_durable(&frame)?;
        self.next_lsn.store(lsn + 1, Ordering::Release);
        Ok(lsn)
    }

    /// Record that every mutation up to `lsn` is durable elsewhere.
    pub fn checkpoint(&self, lsn: Lsn) -> Result<()> {
        let mut writer = self.writer.lock();
        let frame = encode_frame(
            CHECKPOINT_FRAME,
            &bincode::serialize(&CheckpointMarker { lsn })?,
        );
        writer.write_durable(&frame)?;
        self.checkpoint_lsn.fetch_max(lsn, Ordering::AcqRel);
        log::debug!("WAL checkpoint at LSN {}", lsn);
        Ok(())
    }

    /// Rewrite the log so it holds only a checkpoint marker and the
    /// records newer than it.
    pub fn truncate_to_checkpoint(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        let checkpoint = self.checkpoint_lsn.load(Ordering::Acquire);

        let data = fs::read(&self.path)?;
        let mut kept = encode_frame(
            CHECKPOINT_FRAME,
            &bincode::serialize(&CheckpointMarker { lsn: checkpoint })?,
        );
        let mut reader = FrameReader::new(&data);
        for frame in reader.by_ref() {
            if let Frame::Entry(entry) = frame {
                if entry.lsn > checkpoint {
                    kept.extend_from_slice(&encode_frame(
                        ENTRY_FRAME,
                        &bincode::serialize(&entry)?,
                    ));
                }
            }
        }

        let tmp_path = self.path.with_extension("log.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&kept)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        writer.file = OpenOptions::new().append(true).open(&self.path)?;
        let before = writer.size;
        writer.size = kept.len() as u64;
        log::info!(
            "WAL truncated at checkpoint LSN {} ({} -> {} bytes)",
            checkpoint,
            before,
            writer.size
        );
        Ok(())
    }

    /// Read the log, drop a torn tail, and return the records that still
    /// need replaying.
    pub fn recover(path: &Path) -> Result<WalRecovery> {
        if !path.exists() {
            return Ok(WalRecovery {
                next_lsn: 1,
                ..Default::default()
            });
        }

        let data = fs::read(path)?;
        let mut reader = FrameReader::new(&data);
        let mut entries = Vec::new();
        let mut checkpoint_lsn = 0;
        let mut max_lsn = 0;

        for frame in reader.by_ref() {
            match frame {
                Frame::Entry(entry) => {
                    max_lsn = max_lsn.max(entry.lsn);
                    entries.push(entry);
                }
                Frame::Checkpoint(lsn) => {
                    checkpoint_lsn = checkpoint_lsn.max(lsn);
                    max_lsn = max_lsn.max(lsn);
                }
            }
        }

        let valid_len = reader.offset as u64;
        let truncated_bytes = data.len() as u64 - valid_len;
        if truncated_bytes > 0 {
            log::warn!(
                "WAL {:?}: discarding {} bytes of torn tail at offset {}",
                path,
                truncated_bytes,
                valid_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        entries.retain(|entry| entry.lsn > checkpoint_lsn);
        entries.sort_by_key(|entry| entry.lsn);

        Ok(WalRecovery {
            entries,
            checkpoint_lsn,
            next_lsn: max_lsn + 1,
            truncated_bytes,
        })
    }
}

impl WalWriter {
    fn write_durable(&mut self, frame: &[u8]) -> Result<()> {
        let result = self
            .file
            .write_all(frame)
            .and_then(|_| self.file.sync_all());

        if let Err(err) = result {
            // Roll back a partial frame so later appends stay readable.
            if self.file.set_len(self.size).is_err() {
                self.poisoned = true;
            }
            return Err(err.into());
        }
        self.size += frame.len() as u64;
        Ok(())
    }
}

fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + payload.len());
    body.push(kind);
    body.extend_from_slice(payload);

    let mut buf = Vec::with_capacity(FRAME_HEADER + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    buf.extend_from_slice(&body);
    buf
}

/// Iterates valid frames; stops at the first short or corrupt one.
/// `offset` is left at the end of the last valid frame.
struct FrameReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn decode_at(&self, offset: usize) -> Option<(Frame, usize)> {
        let header = self.data.get(offset..offset + FRAME_HEADER)?;
        let len = u32::from_le_bytes(header[0..4].try_into().ok()?) as usize;
        let crc = u32::from_le_bytes(header[4..8].try_into().ok()?);
        if len == 0 {
            return None;
        }

        let body_start = offset + FRAME_HEADER;
        let body = self.data.get(body_start..body_start.checked_add(len)?)?;
        if crc32fast::hash(body) != crc {
            return None;
        }

        let frame = match body[0] {
            ENTRY_FRAME => Frame::Entry(bincode::deserialize(&body[1..]).ok()?),
            CHECKPOINT_FRAME => {
                let marker: CheckpointMarker = bincode::deserialize(&body[1..]).ok()?;
                Frame::Checkpoint(marker.lsn)
            }
            _ => return None,
        };
        Some((frame, FRAME_HEADER + len))
    }
}

impl Iterator for FrameReader<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let (frame, size) = self.decode_at(self.offset)?;
        self.offset += size;
        Some(frame)
    }
}
