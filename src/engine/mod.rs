//! TANDEM - Storage Engine Module
//! Top-level facade binding one backend (B-Tree or LSM-Tree) to the
//! shared write-ahead log.

pub mod bloom;
pub mod btree;
pub mod buffer_pool;
pub mod compaction;
pub mod lsm;
pub mod manifest;
pub mod memtable;
pub mod merge;
pub mod page;
pub mod snapshot;
pub mod sstable;
pub mod wal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::{BackendKind, Config};
use crate::error::{Result, TandemError};
use crate::types::{Key, Lsn, Operation, TxId, Value, AUTOCOMMIT_TX};

use self::btree::BTree;
use self::lsm::{LsmStats, LsmTree};
use self::snapshot::SnapshotStore;
use self::wal::{WalRecovery, WriteAheadLog};

/// File names inside `Config::data_dir`.
pub const WAL_FILE: &str = "wal.log";
pub const PAGES_FILE: &str = "btree.pages";

/// Structural sizes of the B-Tree backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BTreeStats {
    pub entries: usize,
    pub depth: usize,
    pub nodes: usize,
    pub cached_pages: usize,
}

/// Point-in-time view of the engine's structures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub backend: BackendKind,
    pub last_lsn: Lsn,
    pub wal_bytes: u64,
    pub btree: Option<BTreeStats>,
    pub lsm: Option<LsmStats>,
}

struct BTreeBackend {
    tree: RwLock<BTree>,
    store: Mutex<SnapshotStore>,
}

enum Backend {
    BTree(BTreeBackend),
    Lsm(LsmTree),
}

/// The Tandem storage engine.
///
/// Every mutation is appended to the WAL (fsync) before it is applied.
/// The engine must be recovered once before it serves traffic:
///
/// ```no_run
/// use tandem::config::{BackendKind, Config};
/// use tandem::engine::StorageEngine;
///
/// let config = Config::new("./data").with_backend(BackendKind::BTree);
/// let engine = StorageEngine::open(config).unwrap();
///
/// engine.put(b"key".to_vec(), b"value".to_vec()).unwrap();
/// assert_eq!(engine.get(b"key").unwrap(), Some(b"value".to_vec()));
/// ```
pub struct StorageEngine {
    config: Config,
    wal: Arc<WriteAheadLog>,
    backend: Backend,
    /// What the WAL held at open time, consumed by `recover`.
    pending: Mutex<Option<WalRecovery>>,
    recovered: AtomicBool,
}

impl StorageEngine {
    /// Validate `config`, open the WAL and bind the configured backend.
    /// The engine rejects traffic until `recover` has run.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let wal_path = config.data_dir.join(WAL_FILE);
        let recovery = WriteAheadLog::recover(&wal_path)?;
        let wal = Arc::new(WriteAheadLog::open(wal_path, &recovery)?);

        let backend = match config.backend {
            BackendKind::BTree => Backend::BTree(BTreeBackend {
                tree: RwLock::new(BTree::new(config.btree_order)?),
                store: Mutex::new(SnapshotStore::open(
                    &config.data_dir.join(PAGES_FILE),
                    config.buffer_pool_pages,
                )?),
            }),
            BackendKind::Lsm => Backend::Lsm(LsmTree::new(config.clone(), Arc::clone(&wal))?),
        };

        log::info!(
            "Tandem engine opened at {:?} ({:?} backend, {} WAL entries pending)",
            config.data_dir,
            config.backend,
            recovery.entries.len()
        );

        Ok(Self {
            config,
            wal,
            backend,
            pending: Mutex::new(Some(recovery)),
            recovered: AtomicBool::new(false),
        })
    }

    /// `new` followed by `recover`.
    pub fn open(config: Config) -> Result<Self> {
        let engine = Self::new(config)?;
        engine.recover()?;
        Ok(engine)
    }

    /// Rebuild backend state from disk and replay the WAL. Replayed
    /// records are not logged again. Calling it twice is a no-op.
    pub fn recover(&self) -> Result<()> {
        let Some(recovery) = self.pending.lock().take() else {
            return Ok(());
        };

        match &self.backend {
            Backend::BTree(backend) => {
                // Lock order is tree then store; release the store before
                // the tree is published.
                let (mut tree, snapshot_lsn) = {
                    let mut store = backend.store.lock();
                    let tree = store.load(self.config.btree_order)?;
                    (tree, store.meta().map_or(0, |meta| meta.checkpoint_lsn))
                };
                if recovery.checkpoint_lsn > snapshot_lsn {
                    return Err(TandemError::RecoveryFailed(format!(
                        "WAL checkpoint {} is ahead of the B-Tree snapshot at LSN {}",
                        recovery.checkpoint_lsn, snapshot_lsn
                    )));
                }

                let mut replayed = 0;
                for entry in recovery.entries.iter().filter(|e| e.lsn > snapshot_lsn) {
                    match (entry.operation, &entry.new_value) {
                        (Operation::Put, Some(value)) => {
                            tree.insert(entry.key.clone(), value.clone())?;
                        }
                        (Operation::Delete, _) => {
                            tree.delete(&entry.key);
                        }
                        (Operation::Put, None) => {
                            return Err(TandemError::Corruption(format!(
                                "WAL entry {} is a put without a value",
                                entry.lsn
                            )))
                        }
                    }
                    replayed += 1;
                }

                log::info!(
                    "B-Tree recovered: {} entries, replayed {} WAL entries after LSN {}",
                    tree.len(),
                    replayed,
                    snapshot_lsn
                );
                *backend.tree.write() = tree;
            }
            Backend::Lsm(lsm) => {
                lsm.recover(&recovery.entries)?;
            }
        }

        self.recovered.store(true, Ordering::Release);
        Ok(())
    }

    fn ensure_recovered(&self) -> Result<()> {
        if self.recovered.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TandemError::NotRecovered)
        }
    }

    fn check_sizes(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if key.len() > self.config.max_key_size {
            return Err(TandemError::KeyTooLarge {
                size: key.len(),
                max: self.config.max_key_size,
            });
        }
        if let Some(value) = value {
            if value.len() > self.config.max_value_size {
                return Err(TandemError::ValueTooLarge {
                    size: value.len(),
                    max: self.config.max_value_size,
                });
            }
        }
        Ok(())
    }

    /// Insert or overwrite a key as an auto-commit write.
    pub fn put(&self, key: Key, value: Value) -> Result<()> {
        self.put_in_tx(AUTOCOMMIT_TX, key, value)
    }

    /// Insert or overwrite a key on behalf of transaction `tx_id`.
    /// The write path: WAL (disk, fsync) -> backend (memory).
    pub fn put_in_tx(&self, tx_id: TxId, key: Key, value: Value) -> Result<()> {
        self.ensure_recovered()?;
        self.check_sizes(&key, Some(&value))?;

        match &self.backend {
            Backend::BTree(backend) => {
                let mut tree = backend.tree.write();
                tree.check_entry(&key, &value)?;
                let old = tree.search(&key).cloned();
                self.wal.append(
                    tx_id,
                    Operation::Put,
                    &key,
                    old.as_deref(),
                    Some(value.as_slice()),
                )?;
                tree.insert(key, value)?;
                Ok(())
            }
            Backend::Lsm(lsm) => lsm.put(tx_id, key, value),
        }
    }

    /// Delete a key as an auto-commit write.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.delete_in_tx(AUTOCOMMIT_TX, key)
    }

    /// Delete a key on behalf of transaction `tx_id`.
    pub fn delete_in_tx(&self, tx_id: TxId, key: &[u8]) -> Result<()> {
        self.ensure_recovered()?;
        self.check_sizes(key, None)?;

        match &self.backend {
            Backend::BTree(backend) => {
                let mut tree = backend.tree.write();
                // Nothing to log for a key that is not there.
                let Some(old) = tree.search(key).cloned() else {
                    return Ok(());
                };
                self.wal
                    .append(tx_id, Operation::Delete, key, Some(old.as_slice()), None)?;
                tree.delete(key);
                Ok(())
            }
            Backend::Lsm(lsm) => lsm.delete(tx_id, key.to_vec()),
        }
    }

    /// Get a value by key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.ensure_recovered()?;
        match &self.backend {
            Backend::BTree(backend) => Ok(backend.tree.read().search(key).cloned()),
            Backend::Lsm(lsm) => lsm.get(key),
        }
    }

    /// All pairs with `start <= key <= end`, ascending. Empty when `start > end`.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Key, Value)>> {
        self.ensure_recovered()?;
        match &self.backend {
            Backend::BTree(backend) => Ok(backend.tree.read().range(start, end)),
            Backend::Lsm(lsm) => lsm.range(start, end),
        }
    }

    /// Make everything logged so far durable outside the WAL, then shrink
    /// the WAL if it has outgrown `wal_truncate_bytes`.
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_recovered()?;
        match &self.backend {
            Backend::BTree(backend) => {
                let mut tree = backend.tree.write();
                let lsn = self.wal.last_lsn();
                backend.store.lock().checkpoint(&mut tree, lsn)?;
                self.wal.checkpoint(lsn)?;
            }
            Backend::Lsm(lsm) => lsm.flush()?,
        }

        if self.wal.size_bytes() > self.config.wal_truncate_bytes {
            self.wal.truncate_to_checkpoint()?;
        }
        Ok(())
    }

    /// Force one compaction. Always `Ok(false)` for the B-Tree backend.
    pub fn compact(&self) -> Result<bool> {
        self.ensure_recovered()?;
        match &self.backend {
            Backend::BTree(_) => Ok(false),
            Backend::Lsm(lsm) => lsm.compact(),
        }
    }

    /// Block until background flushes and compactions are done.
    pub fn wait_for_background(&self) -> Result<()> {
        match &self.backend {
            Backend::BTree(_) => Ok(()),
            Backend::Lsm(lsm) => lsm.wait_for_background(),
        }
    }

    /// Stop background work. The B-Tree is checkpointed first so the next
    /// recovery has little to replay.
    pub fn shutdown(self) -> Result<()> {
        if self.recovered.load(Ordering::Acquire) {
            if let Backend::BTree(_) = self.backend {
                self.checkpoint()?;
            }
        }
        let result = match self.backend {
            Backend::BTree(_) => Ok(()),
            Backend::Lsm(lsm) => lsm.shutdown(),
        };
        log::info!("Tandem engine at {:?} shut down", self.config.data_dir);
        result
    }

    pub fn stats(&self) -> EngineStats {
        let (btree, lsm) = match &self.backend {
            Backend::BTree(backend) => {
                let tree = backend.tree.read();
                let stats = BTreeStats {
                    entries: tree.len(),
                    depth: tree.depth(),
                    nodes: tree.node_count(),
                    cached_pages: backend.store.lock().pool().len(),
                };
                (Some(stats), None)
            }
            Backend::Lsm(lsm) => (None, Some(lsm.stats())),
        };
        EngineStats {
            backend: self.config.backend,
            last_lsn: self.wal.last_lsn(),
            wal_bytes: self.wal.size_bytes(),
            btree,
            lsm,
        }
    }

    /// Read-only access to the log.
    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
