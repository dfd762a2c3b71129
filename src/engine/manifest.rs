//! TANDEM - Manifest
//! Durable record of which SSTables are live and in what order.
//!
//! ## Format
//! ```text
//! [crc: 4 bytes (LE)][bincode(Manifest)]
//! ```
//! The whole file is rewritten on every change: written to `MANIFEST.tmp`,
//! fsynced, then renamed over `MANIFEST`, so a reader sees either the old
//! or the new list and never a mix.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TandemError};
use crate::types::Lsn;

pub const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TMP_FILE: &str = "MANIFEST.tmp";

/// The live SSTable list of the LSM backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Id the next flushed or compacted table will receive.
    pub next_table_id: u64,
    /// Every mutation up to this LSN is persisted in `tables`.
    pub flushed_lsn: Lsn,
    /// Live table ids, oldest first. Lookups search them in reverse.
    pub tables: Vec<u64>,
}

impl Manifest {
    /// Read the manifest in `dir`. `Ok(None)` if there is none yet.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(&path)?;
        if data.len() < 4 {
            return Err(TandemError::Corruption(format!(
                "manifest {:?} is only {} bytes",
                path,
                data.len()
            )));
        }
        let (crc_bytes, payload) = data.split_at(4);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(crc_bytes);
        if crc32fast::hash(payload) != u32::from_le_bytes(crc) {
            return Err(TandemError::Corruption(format!(
                "manifest {:?}: checksum mismatch",
                path
            )));
        }

        let manifest: Manifest = bincode::deserialize(payload)?;
        Ok(Some(manifest))
    }

    /// Atomically replace the manifest in `dir` with `self`.
    pub fn store(&self, dir: &Path) -> Result<()> {
        let payload = bincode::serialize(self)?;
        let tmp_path = dir.join(MANIFEST_TMP_FILE);
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, dir.join(MANIFEST_FILE))?;
        sync_dir(dir);

        log::debug!(
            "Manifest stored: {} tables, flushed LSN {}",
            self.tables.len(),
            self.flushed_lsn
        );
        Ok(())
    }
}

/// fsync a directory so renames inside it survive a crash.
pub(crate) fn sync_dir(dir: &Path) {
    // Directories cannot be opened for syncing on every platform.
    if let Ok(handle) = File::open(dir) {
        if let Err(err) = handle.sync_all() {
            log::debug!("Directory sync of {:?} skipped: {}", dir, err);
        }
    }
}
