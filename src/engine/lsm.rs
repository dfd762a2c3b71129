//! TANDEM - LSM-Tree Backend
//! MemTable + SSTables with background flushing and compaction.
//!
//! ## Write Path
//! WAL (fsync) -> active MemTable. A full MemTable is sealed and handed
//! to a flush thread, which writes it out as a new SSTable, publishes it
//! in the manifest and checkpoints the WAL.
//!
//! ## Read Path
//! active MemTable -> sealed MemTable -> SSTables newest to oldest.
//! The first structure that knows the key answers; a tombstone answers
//! "not found".
//!
//! ## Locking
//! - `writer` serializes mutations, including the wait for a prior flush
//! - `state` guards the table set; readers clone `Arc`s and release it
//! - `manifest_lock` orders manifest rewrites between flush and compaction
//! - `compaction_lock` allows one compaction at a time
//!
//! ## Table Ids
//! Flushes take fresh ids. A compaction output takes the id of the oldest
//! table it replaces, so ids ascend from oldest to newest data at all
//! times and a directory without a manifest can still be ordered by id.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{Result, TandemError};
use crate::types::{Entry, Key, Lsn, Operation, TxId, Value};

use super::compaction::{merge_tables, strategy_for, CompactionStrategy, TableInfo};
use super::manifest::Manifest;
use super::memtable::{MemTable, SealedMemTable};
use super::merge::{vec_source, MergeIterator, Source};
use super::sstable::{parse_table_id, table_file_name, SSTable, SSTableWriter, TableOptions};
use super::wal::{LogEntry, WriteAheadLog};

/// Outcome of a background task, reported to the foreground.
#[derive(Debug)]
pub enum BackgroundEvent {
    Flushed { table_id: u64, entries: usize },
    Compacted { output_id: u64, inputs: usize },
    Failed(String),
}

/// Structural sizes of the LSM backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LsmStats {
    pub active_entries: usize,
    pub sealed_entries: usize,
    pub sstables: usize,
    pub sstable_entries: usize,
    pub flushed_lsn: Lsn,
}

struct LsmState {
    active: MemTable,
    /// At most one sealed table waits for its flush.
    sealed: Option<Arc<SealedMemTable>>,
    /// Live tables, oldest first.
    tables: Arc<Vec<Arc<SSTable>>>,
    /// Highest LSN persisted in `tables`.
    flushed_lsn: Lsn,
}

struct LsmInner {
    dir: PathBuf,
    config: Config,
    table_options: TableOptions,
    strategy: Box<dyn CompactionStrategy>,
    wal: Arc<WriteAheadLog>,
    state: RwLock<LsmState>,
    writer: Mutex<()>,
    manifest_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    compaction_task: Mutex<Option<JoinHandle<()>>>,
    events_tx: Sender<BackgroundEvent>,
    events_rx: Receiver<BackgroundEvent>,
    next_table_id: AtomicU64,
    cancel: AtomicBool,
}

/// Log-structured merge tree over a shared write-ahead log.
pub struct LsmTree {
    inner: Arc<LsmInner>,
}

impl LsmTree {
    /// Create an empty tree in `config.data_dir`. Call `recover` before use.
    pub fn new(config: Config, wal: Arc<WriteAheadLog>) -> Result<Self> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let inner = LsmInner {
            dir: config.data_dir.clone(),
            strategy: strategy_for(&config),
            table_options: TableOptions::from(&config),
            state: RwLock::new(LsmState {
                active: MemTable::new(config.memtable_capacity),
                sealed: None,
                tables: Arc::new(Vec::new()),
                flushed_lsn: 0,
            }),
            config,
            wal,
            writer: Mutex::new(()),
            manifest_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            flush_task: Mutex::new(None),
            compaction_task: Mutex::new(None),
            events_tx,
            events_rx,
            next_table_id: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
        };
        log::debug!(
            "LSM backend using {} at {:?}",
            inner.strategy.name(),
            inner.dir
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Load the live table set and replay `entries` newer than it.
    /// Returns the number of replayed entries.
    pub fn recover(&self, entries: &[LogEntry]) -> Result<usize> {
        let inner = &self.inner;
        let manifest = Manifest::load(&inner.dir)?;
        let on_disk = list_table_files(&inner.dir)?;

        let manifest = match manifest {
            Some(manifest) => {
                if inner.wal.checkpoint_lsn() > manifest.flushed_lsn {
                    return Err(TandemError::RecoveryFailed(format!(
                        "WAL checkpoint {} is ahead of the manifest's flushed LSN {}",
                        inner.wal.checkpoint_lsn(),
                        manifest.flushed_lsn
                    )));
                }
                manifest
            }
            None => {
                // Without a manifest every table on disk is live. Ids ascend
                // with data age, compaction outputs included.
                let tables: Vec<u64> = on_disk.iter().map(|(id, _)| *id).collect();
                if !tables.is_empty() {
                    log::warn!(
                        "No manifest in {:?}; adopting {} SSTables found on disk",
                        inner.dir,
                        tables.len()
                    );
                }
                Manifest {
                    next_table_id: tables.last().map_or(0, |id| id + 1),
                    flushed_lsn: inner.wal.checkpoint_lsn(),
                    tables,
                }
            }
        };

        remove_orphans(&inner.dir, &on_disk, &manifest.tables)?;

        let mut tables = Vec::with_capacity(manifest.tables.len());
        for id in &manifest.tables {
            let path = inner.dir.join(table_file_name(*id));
            if !path.exists() {
                return Err(TandemError::RecoveryFailed(format!(
                    "manifest lists SSTable {} but {:?} is missing",
                    id, path
                )));
            }
            tables.push(Arc::new(SSTable::open(*id, path, &inner.table_options)?));
        }

        let max_id = manifest.tables.iter().max().map_or(0, |id| id + 1);
        inner
            .next_table_id
            .store(manifest.next_table_id.max(max_id), Ordering::SeqCst);

        {
            let mut state = inner.state.write();
            state.tables = Arc::new(tables);
            state.flushed_lsn = manifest.flushed_lsn;
        }

        // Replay under the writer lock, sealing like the write path does so
        // the MemTable never grows past its capacity.
        let _writer = inner.writer.lock();
        let mut replayed = 0;
        let mut sealed = 0;
        for entry in entries.iter().filter(|e| e.lsn > manifest.flushed_lsn) {
            let full = {
                let mut state = inner.state.write();
                apply_entry(&mut state.active, entry)?;
                state.active.is_full()
            };
            replayed += 1;
            if full {
                inner.seal_active()?;
                sealed += 1;
            }
        }

        log::info!(
            "LSM recovered {} SSTables, replayed {} WAL entries into {} sealed MemTables (flushed LSN {})",
            manifest.tables.len(),
            replayed,
            sealed,
            manifest.flushed_lsn
        );
        Ok(replayed)
    }

    /// Insert or overwrite a key.
    pub fn put(&self, tx_id: TxId, key: Key, value: Value) -> Result<()> {
        let inner = &self.inner;
        let _writer = inner.writer.lock();
        inner.take_background_error()?;

        let lsn = inner
            .wal
            .append(tx_id, Operation::Put, &key, None, Some(value.as_slice()))?;
        let full = {
            let mut state = inner.state.write();
            state.active.insert(key, value, lsn);
            state.active.is_full()
        };
        if full {
            inner.seal_active()?;
        }
        Ok(())
    }

    /// Record a tombstone for `key`. Deletes are blind: the key need not exist.
    pub fn delete(&self, tx_id: TxId, key: Key) -> Result<()> {
        let inner = &self.inner;
        let _writer = inner.writer.lock();
        inner.take_background_error()?;

        let lsn = inner
            .wal
            .append(tx_id, Operation::Delete, &key, None, None)?;
        let full = {
            let mut state = inner.state.write();
            state.active.delete(key, lsn);
            state.active.is_full()
        };
        if full {
            inner.seal_active()?;
        }
        Ok(())
    }

    /// Point lookup through the MemTables and SSTables, newest first.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let (sealed, tables) = {
            let state = self.inner.state.read();
            if let Some(value) = state.active.lookup(key) {
                return Ok(value.clone());
            }
            (state.sealed.clone(), Arc::clone(&state.tables))
        };

        if let Some(value) = sealed.as_ref().and_then(|s| s.lookup(key)) {
            return Ok(value.clone());
        }
        for table in tables.iter().rev() {
            if let Some(value) = table.get(key)? {
                return Ok(value);
            }
        }
        Ok(None)
    }

    /// Live pairs with keys in `[start, end]`, ascending.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Key, Value)>> {
        if start > end {
            return Ok(Vec::new());
        }

        let (active, sealed, tables) = {
            let state = self.inner.state.read();
            (
                state.active.range_entries(start, end),
                state.sealed.clone(),
                Arc::clone(&state.tables),
            )
        };

        // Newest source first.
        let mut sources: Vec<Source> = vec![vec_source(active)];
        if let Some(sealed) = sealed {
            sources.push(vec_source(sealed.range_entries(start, end)));
        }
        for table in tables.iter().rev() {
            if table.entry_count() == 0 || table.max_key() < start || table.min_key() > end {
                continue;
            }
            let end_key = end.to_vec();
            let bounded = table
                .scan_from(start)?
                .take_while(move |entry| match entry {
                    Ok(entry) => entry.key <= end_key,
                    Err(_) => true,
                });
            sources.push(Box::new(bounded));
        }

        let mut out = Vec::new();
        for entry in MergeIterator::new(sources)? {
            let Entry { key, value } = entry?;
            if let Some(value) = value {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    /// Seal the active MemTable and wait until it is on disk.
    pub fn flush(&self) -> Result<()> {
        {
            let _writer = self.inner.writer.lock();
            self.inner.seal_active()?;
        }
        self.inner.join_flush()
    }

    /// Run one compaction on the calling thread, after any in-flight flush.
    /// Returns whether the strategy found tables to merge.
    pub fn compact(&self) -> Result<bool> {
        self.inner.join_flush()?;
        let compacted = self.inner.compact_once()?;
        self.inner.take_background_error()?;
        Ok(compacted)
    }

    /// Block until no flush or compaction is running.
    pub fn wait_for_background(&self) -> Result<()> {
        self.inner.join_flush()?;
        self.inner.join_compaction()?;
        self.inner.take_background_error()
    }

    /// Cancel compaction, finish the in-flight flush and join every task.
    pub fn shutdown(self) -> Result<()> {
        self.inner.cancel.store(true, Ordering::Release);
        let flushed = self.inner.join_flush();
        let compacted = self.inner.join_compaction();
        log::info!("LSM backend at {:?} shut down", self.inner.dir);
        flushed.and(compacted)
    }

    /// Ids of the live SSTables, oldest first.
    pub fn table_ids(&self) -> Vec<u64> {
        self.inner.state.read().tables.iter().map(|t| t.id()).collect()
    }

    pub fn stats(&self) -> LsmStats {
        let state = self.inner.state.read();
        LsmStats {
            active_entries: state.active.len(),
            sealed_entries: state.sealed.as_ref().map_or(0, |s| s.len()),
            sstables: state.tables.len(),
            sstable_entries: state.tables.iter().map(|t| t.entry_count()).sum(),
            flushed_lsn: state.flushed_lsn,
        }
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        // Keep detached tasks from writing into the directory after the
        // owner is gone.
        self.inner.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.inner.flush_task.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.inner.compaction_task.lock().take() {
            let _ = handle.join();
        }
    }
}

impl LsmInner {
    /// Return the first failure reported by a background task, if any.
    fn take_background_error(&self) -> Result<()> {
        let mut failure = None;
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                BackgroundEvent::Flushed { table_id, entries } => {
                    log::debug!("Flush produced SSTable {} ({} entries)", table_id, entries)
                }
                BackgroundEvent::Compacted { output_id, inputs } => {
                    log::debug!("Compaction produced SSTable {} from {} inputs", output_id, inputs)
                }
                BackgroundEvent::Failed(message) => {
                    failure.get_or_insert(message);
                }
            }
        }
        match failure {
            Some(message) => Err(TandemError::Background(message)),
            None => Ok(()),
        }
    }

    /// Swap in a fresh MemTable and flush the old one in the background.
    /// The caller holds `writer`.
    fn seal_active(self: &Arc<Self>) -> Result<()> {
        self.join_flush()?;

        // A sealed table survives a failed flush; retry it here.
        let leftover = self.state.read().sealed.clone();
        if let Some(sealed) = leftover {
            self.flush_sealed(&sealed)?;
        }

        let sealed = {
            let mut state = self.state.write();
            if state.active.is_empty() {
                return Ok(());
            }
            let fresh = MemTable::new(self.config.memtable_capacity);
            let sealed = Arc::new(std::mem::replace(&mut state.active, fresh).seal());
            state.sealed = Some(Arc::clone(&sealed));
            sealed
        };
        log::debug!(
            "Sealed MemTable with {} entries (max LSN {})",
            sealed.len(),
            sealed.max_lsn()
        );

        let inner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("tandem-flush".into())
            .spawn(move || inner.run_flush(sealed))?;
        *self.flush_task.lock() = Some(handle);
        Ok(())
    }

    fn join_flush(&self) -> Result<()> {
        let handle = self.flush_task.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                return Err(TandemError::Background("flush thread panicked".into()));
            }
        }
        self.take_background_error()
    }

    fn join_compaction(&self) -> Result<()> {
        let handle = self.compaction_task.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                return Err(TandemError::Background("compaction thread panicked".into()));
            }
        }
        Ok(())
    }

    fn run_flush(self: &Arc<Self>, sealed: Arc<SealedMemTable>) {
        match self.flush_sealed(&sealed) {
            Ok(table_id) => {
                let _ = self.events_tx.send(BackgroundEvent::Flushed {
                    table_id,
                    entries: sealed.len(),
                });
                if self.wal.size_bytes() > self.config.wal_truncate_bytes {
                    if let Err(err) = self.wal.truncate_to_checkpoint() {
                        log::warn!("WAL truncation after flush failed: {}", err);
                    }
                }
                self.maybe_schedule_compaction();
            }
            Err(err) => {
                log::error!("Background flush failed: {}", err);
                let _ = self.events_tx.send(BackgroundEvent::Failed(err.to_string()));
            }
        }
    }

    /// Write `sealed` out as a new SSTable and publish it.
    fn flush_sealed(&self, sealed: &Arc<SealedMemTable>) -> Result<u64> {
        let id = self.next_table_id.fetch_add(1, Ordering::SeqCst);
        let mut writer = SSTableWriter::create(&self.dir, id)?;
        for (key, value) in sealed.iter() {
            if let Err(err) = writer.add(key, value.as_deref()) {
                writer.abandon();
                return Err(err);
            }
        }
        let path = writer.finish()?;
        let table = Arc::new(SSTable::open(id, path, &self.table_options)?);

        let flushed_lsn = {
            let _manifest = self.manifest_lock.lock();
            let (mut tables, flushed_lsn) = {
                let state = self.state.read();
                (
                    state.tables.as_ref().clone(),
                    state.flushed_lsn.max(sealed.max_lsn()),
                )
            };
            tables.push(Arc::clone(&table));

            if let Err(err) = self.store_manifest(&tables, flushed_lsn) {
                table.mark_obsolete();
                return Err(err);
            }

            let mut state = self.state.write();
            state.tables = Arc::new(tables);
            state.flushed_lsn = flushed_lsn;
            if state
                .sealed
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, sealed))
            {
                state.sealed = None;
            }
            flushed_lsn
        };

        self.wal.checkpoint(flushed_lsn)?;
        log::info!(
            "Flushed MemTable to SSTable {} ({} entries, flushed LSN {})",
            id,
            sealed.len(),
            flushed_lsn
        );
        Ok(id)
    }

    fn store_manifest(&self, tables: &[Arc<SSTable>], flushed_lsn: Lsn) -> Result<()> {
        Manifest {
            next_table_id: self.next_table_id.load(Ordering::SeqCst),
            flushed_lsn,
            tables: tables.iter().map(|t| t.id()).collect(),
        }
        .store(&self.dir)
    }

    fn maybe_schedule_compaction(self: &Arc<Self>) {
        if !self.config.auto_compaction || self.cancel.load(Ordering::Acquire) {
            return;
        }
        if self.state.read().tables.len() <= self.config.compaction_trigger {
            return;
        }

        let mut slot = self.compaction_task.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        if let Some(done) = slot.take() {
            if done.join().is_err() {
                log::error!("Previous compaction thread panicked");
            }
        }

        let inner = Arc::clone(self);
        match thread::Builder::new()
            .name("tandem-compaction".into())
            .spawn(move || inner.run_compaction())
        {
            Ok(handle) => *slot = Some(handle),
            Err(err) => log::error!("Failed to start compaction thread: {}", err),
        }
    }

    fn run_compaction(&self) {
        loop {
            match self.compact_once() {
                Ok(true) => {
                    if self.state.read().tables.len() <= self.config.compaction_trigger {
                        break;
                    }
                }
                Ok(false) => break,
                Err(TandemError::Cancelled) => {
                    log::info!("Background compaction cancelled");
                    break;
                }
                Err(err) => {
                    log::error!("Background compaction failed: {}", err);
                    let _ = self.events_tx.send(BackgroundEvent::Failed(err.to_string()));
                    break;
                }
            }
        }
    }

    /// Merge the slice chosen by the strategy and publish the result.
    fn compact_once(&self) -> Result<bool> {
        let _compacting = self.compaction_lock.lock();
        if self.cancel.load(Ordering::Acquire) {
            return Err(TandemError::Cancelled);
        }

        let tables = Arc::clone(&self.state.read().tables);
        let infos: Vec<TableInfo> = tables.iter().map(|t| TableInfo::from(t.as_ref())).collect();
        let Some(range) = self.strategy.select_compaction(&infos) else {
            return Ok(false);
        };
        if range.len() < 2 || range.end > tables.len() {
            return Ok(false);
        }

        let inputs = &tables[range.clone()];
        let drop_tombstones = range.start == 0;
        // The output replaces the oldest input's file in place. Until the
        // manifest changes, the old list still reads correctly: the merged
        // data sits at the oldest position with the newer inputs above it.
        let output_id = inputs[0].id();
        let output = Arc::new(merge_tables(
            &self.dir,
            output_id,
            inputs,
            drop_tombstones,
            &self.table_options,
            &self.cancel,
        )?);

        self.publish_compaction(range, inputs, output)?;
        let _ = self.events_tx.send(BackgroundEvent::Compacted {
            output_id,
            inputs: inputs.len(),
        });
        Ok(true)
    }

    /// Replace `inputs` at `range` with `output`: manifest first, then the
    /// in-memory list. Flushes only append, so the slice is still in place.
    ///
    /// `output` owns the oldest input's path. On failure it stays there,
    /// where the current list reads it in that input's place.
    fn publish_compaction(
        &self,
        range: Range<usize>,
        inputs: &[Arc<SSTable>],
        output: Arc<SSTable>,
    ) -> Result<()> {
        let _manifest = self.manifest_lock.lock();
        let (current, flushed_lsn) = {
            let state = self.state.read();
            (Arc::clone(&state.tables), state.flushed_lsn)
        };

        let in_place = current
            .get(range.clone())
            .is_some_and(|slice| slice.iter().zip(inputs).all(|(a, b)| Arc::ptr_eq(a, b)));
        if !in_place {
            return Err(TandemError::Corruption(
                "SSTable list changed under compaction".into(),
            ));
        }

        // An empty output means everything cancelled out.
        let keep_output = output.entry_count() > 0;
        let mut next = Vec::with_capacity(current.len() - range.len() + 1);
        next.extend(current[..range.start].iter().cloned());
        if keep_output {
            next.push(Arc::clone(&output));
        }
        next.extend(current[range.end..].iter().cloned());

        self.store_manifest(&next, flushed_lsn)?;
        self.state.write().tables = Arc::new(next);

        if !keep_output {
            output.mark_obsolete();
        }

        for table in inputs.iter().filter(|t| t.id() != output.id()) {
            table.mark_obsolete();
        }
        Ok(())
    }
}

fn apply_entry(table: &mut MemTable, entry: &LogEntry) -> Result<()> {
    match (entry.operation, &entry.new_value) {
        (Operation::Put, Some(value)) => table.insert(entry.key.clone(), value.clone(), entry.lsn),
        (Operation::Delete, _) => table.delete(entry.key.clone(), entry.lsn),
        (Operation::Put, None) => {
            return Err(TandemError::Corruption(format!(
                "WAL entry {} is a put without a value",
                entry.lsn
            )))
        }
    }
    Ok(())
}

/// `*.sst` files in `dir`, sorted by id.
fn list_table_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(id) = parse_table_id(&path) {
            found.push((id, path));
        }
    }
    found.sort_by_key(|(id, _)| *id);
    Ok(found)
}

/// Delete table files not listed as live and leftover temp files.
fn remove_orphans(dir: &Path, on_disk: &[(u64, PathBuf)], live: &[u64]) -> Result<()> {
    for (id, path) in on_disk {
        if !live.contains(id) {
            log::warn!("Removing orphan SSTable {:?}", path);
            fs::remove_file(path)?;
        }
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tmp") && path.is_file() {
            log::warn!("Removing leftover temp file {:?}", path);
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompactionPolicy;
    use crate::engine::manifest::MANIFEST_FILE;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn config(dir: &Path, capacity: usize) -> Config {
        Config::new(dir)
            .with_memtable_capacity(capacity)
            .with_auto_compaction(false)
    }

    fn open(config: Config) -> LsmTree {
        let wal_path = config.data_dir.join("wal.log");
        let recovery = WriteAheadLog::recover(&wal_path).unwrap();
        let wal = Arc::new(WriteAheadLog::open(wal_path, &recovery).unwrap());
        let lsm = LsmTree::new(config, wal).unwrap();
        lsm.recover(&recovery.entries).unwrap();
        lsm
    }

    fn key(i: usize) -> Key {
        format!("key_{:04}", i).into_bytes()
    }

    #[test]
    fn test_put_get_delete_across_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = open(config(dir.path(), 4));

        for i in 0..10 {
            lsm.put(0, key(i), format!("v{}", i).into_bytes()).unwrap();
        }
        lsm.delete(0, key(3)).unwrap();
        lsm.wait_for_background().unwrap();

        assert_eq!(lsm.get(&key(0)).unwrap(), Some(b"v0".to_vec()));
        assert_eq!(lsm.get(&key(9)).unwrap(), Some(b"v9".to_vec()));
        assert_eq!(lsm.get(&key(3)).unwrap(), None);
        assert_eq!(lsm.get(b"absent").unwrap(), None);
        assert!(lsm.stats().sstables >= 2);
    }

    #[test]
    fn test_capacity_scenario_then_leveled_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = open(config(dir.path(), 100));

        for i in 0..250 {
            lsm.put(0, key(i), b"value".to_vec()).unwrap();
        }
        lsm.wait_for_background().unwrap();

        let stats = lsm.stats();
        assert_eq!(stats.sstables, 2);
        assert_eq!(stats.active_entries, 50);
        assert_eq!(stats.sealed_entries, 0);

        assert!(lsm.compact().unwrap());
        let stats = lsm.stats();
        assert_eq!(stats.sstables, 1);
        assert_eq!(stats.sstable_entries, 200);
        assert!(!lsm.compact().unwrap());
    }

    #[test]
    fn test_tombstone_survives_until_oldest_compacted() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = open(config(dir.path(), 100));

        lsm.put(0, b"k".to_vec(), b"v".to_vec()).unwrap();
        lsm.put(0, b"other".to_vec(), b"o".to_vec()).unwrap();
        lsm.flush().unwrap();
        lsm.delete(0, b"k".to_vec()).unwrap();
        lsm.flush().unwrap();
        assert_eq!(lsm.get(b"k").unwrap(), None);

        assert!(lsm.compact().unwrap());
        assert_eq!(lsm.get(b"k").unwrap(), None);
        assert_eq!(lsm.get(b"other").unwrap(), Some(b"o".to_vec()));
        let stats = lsm.stats();
        assert_eq!(stats.sstables, 1);
        // The tombstone was dropped along with the value it shadowed.
        assert_eq!(stats.sstable_entries, 1);
    }

    #[test]
    fn test_range_merges_all_levels() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = open(config(dir.path(), 3));

        lsm.put(0, b"a".to_vec(), b"1".to_vec()).unwrap();
        lsm.put(0, b"b".to_vec(), b"1".to_vec()).unwrap();
        lsm.put(0, b"c".to_vec(), b"1".to_vec()).unwrap(); // sealed
        lsm.put(0, b"b".to_vec(), b"2".to_vec()).unwrap();
        lsm.delete(0, b"c".to_vec()).unwrap();
        lsm.put(0, b"d".to_vec(), b"2".to_vec()).unwrap(); // sealed
        lsm.put(0, b"e".to_vec(), b"3".to_vec()).unwrap();
        lsm.wait_for_background().unwrap();

        let got = lsm.range(b"a", b"d").unwrap();
        assert_eq!(
            got,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"d".to_vec(), b"2".to_vec()),
            ]
        );
        assert!(lsm.range(b"z", b"a").unwrap().is_empty());
    }

    #[test]
    fn test_reopen_restores_tables_and_memtable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let lsm = open(config(dir.path(), 10));
            for i in 0..35 {
                lsm.put(0, key(i), format!("v{}", i).into_bytes()).unwrap();
            }
            lsm.delete(0, key(7)).unwrap();
            lsm.wait_for_background().unwrap();
            assert!(lsm.compact().unwrap());
            lsm.shutdown().unwrap();
        }

        let lsm = open(config(dir.path(), 10));
        for i in 0..35 {
            let expected = (i != 7).then(|| format!("v{}", i).into_bytes());
            assert_eq!(lsm.get(&key(i)).unwrap(), expected, "key {}", i);
        }
        assert_eq!(lsm.range(&key(0), &key(99)).unwrap().len(), 34);
    }

    #[test]
    fn test_recovery_removes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        {
            let lsm = open(config(dir.path(), 2));
            lsm.put(0, b"a".to_vec(), b"1".to_vec()).unwrap();
            lsm.put(0, b"b".to_vec(), b"2".to_vec()).unwrap();
            lsm.wait_for_background().unwrap();
        }
        let stray = dir.path().join(table_file_name(99));
        fs::write(&stray, b"").unwrap();
        let tmp = dir.path().join("00000000000000000100.sst.tmp");
        fs::write(&tmp, b"partial").unwrap();

        let lsm = open(config(dir.path(), 2));
        assert!(!stray.exists());
        assert!(!tmp.exists());
        assert_eq!(lsm.table_ids().len(), 1);
        assert_eq!(lsm.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_background_universal_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path())
            .with_memtable_capacity(5)
            .with_compaction_policy(CompactionPolicy::Universal)
            .with_compaction_trigger(2);
        let lsm = open(config);

        for i in 0..60 {
            lsm.put(0, key(i % 20), format!("v{}", i).into_bytes()).unwrap();
        }
        lsm.wait_for_background().unwrap();

        lsm.compact().unwrap();
        assert_eq!(lsm.stats().sstables, 1);
        for i in 40..60 {
            assert_eq!(
                lsm.get(&key(i % 20)).unwrap(),
                Some(format!("v{}", i).into_bytes())
            );
        }
    }

    #[test]
    fn test_compaction_output_keeps_oldest_id() {
        let dir = tempfile::tempdir().unwrap();
        {
            let lsm = open(config(dir.path(), 1));
            lsm.put(0, b"k".to_vec(), b"v1".to_vec()).unwrap();
            lsm.put(0, b"x".to_vec(), b"x".to_vec()).unwrap();
            lsm.put(0, b"k".to_vec(), b"v2".to_vec()).unwrap();
            lsm.wait_for_background().unwrap();
            assert_eq!(lsm.table_ids(), vec![0, 1, 2]);

            assert!(lsm.compact().unwrap());
            assert_eq!(lsm.table_ids(), vec![0, 2]);
            assert_eq!(lsm.get(b"k").unwrap(), Some(b"v2".to_vec()));
            lsm.shutdown().unwrap();
        }
        assert!(!dir.path().join(table_file_name(1)).exists());

        // Without a manifest the tables are ordered by id alone.
        fs::remove_file(dir.path().join(MANIFEST_FILE)).unwrap();
        let lsm = open(config(dir.path(), 1));
        assert_eq!(lsm.table_ids(), vec![0, 2]);
        assert_eq!(lsm.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(lsm.get(b"x").unwrap(), Some(b"x".to_vec()));

        // New flushes still land above the compacted table.
        lsm.put(0, b"k".to_vec(), b"v3".to_vec()).unwrap();
        lsm.wait_for_background().unwrap();
        assert_eq!(lsm.table_ids(), vec![0, 2, 3]);
        assert_eq!(lsm.get(b"k").unwrap(), Some(b"v3".to_vec()));
    }

    #[test]
    fn test_compaction_interrupted_before_manifest_update() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join(MANIFEST_FILE);
        let middle_path = dir.path().join(table_file_name(1));
        let (old_manifest, old_middle) = {
            let lsm = open(config(dir.path(), 2));
            lsm.put(0, b"k".to_vec(), b"v1".to_vec()).unwrap();
            lsm.put(0, b"a".to_vec(), b"1".to_vec()).unwrap();
            lsm.delete(0, b"k".to_vec()).unwrap();
            lsm.put(0, b"b".to_vec(), b"2".to_vec()).unwrap();
            lsm.put(0, b"z".to_vec(), b"3".to_vec()).unwrap();
            lsm.put(0, b"zz".to_vec(), b"4".to_vec()).unwrap();
            lsm.wait_for_background().unwrap();
            assert_eq!(lsm.table_ids(), vec![0, 1, 2]);
            let saved = (fs::read(&manifest_path).unwrap(), fs::read(&middle_path).unwrap());

            // Merges tables 0 and 1 and drops the tombstone for "k".
            assert!(lsm.compact().unwrap());
            assert_eq!(lsm.table_ids(), vec![0, 2]);
            lsm.shutdown().unwrap();
            saved
        };

        // Disk as a crash between the output rename and the manifest write
        // leaves it: merged data under id 0, old manifest, table 1 intact.
        fs::write(&manifest_path, old_manifest).unwrap();
        fs::write(&middle_path, old_middle).unwrap();

        let lsm = open(config(dir.path(), 2));
        assert_eq!(lsm.table_ids(), vec![0, 1, 2]);
        assert_eq!(lsm.get(b"k").unwrap(), None);
        assert_eq!(lsm.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(lsm.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(
            lsm.range(b"a", b"zz").unwrap().len(),
            4,
            "a, b, z and zz are live"
        );
    }

    #[test]
    fn test_replay_seals_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        {
            let lsm = open(config(dir.path(), 1000));
            for i in 0..35 {
                lsm.put(0, key(i), format!("v{}", i).into_bytes()).unwrap();
            }
            // Dropped without a flush: everything lives in the WAL only.
        }

        let lsm = open(config(dir.path(), 10));
        lsm.wait_for_background().unwrap();
        let stats = lsm.stats();
        assert_eq!(stats.sstables, 3);
        assert_eq!(stats.sstable_entries, 30);
        assert_eq!(stats.active_entries, 5);
        assert_eq!(stats.flushed_lsn, 30);
        for i in 0..35 {
            assert_eq!(lsm.get(&key(i)).unwrap(), Some(format!("v{}", i).into_bytes()));
        }
    }

    #[test]
    fn test_random_ops_match_btreemap() {
        let _ = env_logger::builder().is_test(true).try_init();
        let policies = [
            CompactionPolicy::Leveled,
            CompactionPolicy::SizeTiered,
            CompactionPolicy::Universal,
        ];

        for (seed, policy) in policies.into_iter().enumerate() {
            let dir = tempfile::tempdir().unwrap();
            let config = Config::new(dir.path())
                .with_memtable_capacity(8)
                .with_compaction_policy(policy)
                .with_compaction_trigger(2);
            let mut rng = StdRng::seed_from_u64(seed as u64 + 7);
            let mut model: BTreeMap<Key, Value> = BTreeMap::new();
            let mut lsm = open(config.clone());

            for step in 0..1500 {
                let k = key(rng.gen_range(0..120));
                match rng.gen_range(0..100) {
                    0..=54 => {
                        let v = format!("v{}", step).into_bytes();
                        lsm.put(0, k.clone(), v.clone()).unwrap();
                        model.insert(k.clone(), v);
                    }
                    55..=84 => {
                        lsm.delete(0, k.clone()).unwrap();
                        model.remove(&k);
                    }
                    85..=89 => lsm.flush().unwrap(),
                    90..=94 => {
                        lsm.compact().unwrap();
                    }
                    95..=97 => {
                        let (lo, hi) = (key(rng.gen_range(0..60)), key(rng.gen_range(60..130)));
                        let got = lsm.range(&lo, &hi).unwrap();
                        assert!(got.windows(2).all(|w| w[0].0 < w[1].0));
                        let expected: Vec<(Key, Value)> = model
                            .range(lo..=hi)
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        assert_eq!(got, expected, "{:?} range at step {}", policy, step);
                    }
                    _ => {
                        lsm.shutdown().unwrap();
                        lsm = open(config.clone());
                    }
                }
                assert_eq!(
                    lsm.get(&k).unwrap(),
                    model.get(&k).cloned(),
                    "{:?} get at step {}",
                    policy,
                    step
                );
            }

            lsm.wait_for_background().unwrap();
            let all = lsm.range(&key(0), &key(9999)).unwrap();
            let expected: Vec<(Key, Value)> =
                model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            assert_eq!(all, expected, "{:?} final contents", policy);
        }
    }
}
