//! TANDEM - Engine Configuration
//! Defines tunable parameters for both storage backends.

use std::path::PathBuf;

use crate::engine::btree::entry_limit;
use crate::error::{Result, TandemError};

/// Which backend a `StorageEngine` binds at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-place B-Tree over the buffer pool.
    BTree,
    /// Log-structured merge tree (MemTable + SSTables).
    Lsm,
}

/// SSTable compaction policy for the LSM backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionPolicy {
    /// Merge the two oldest SSTables.
    Leveled,
    /// Merge a run of similarly sized SSTables once enough accumulate.
    SizeTiered,
    /// Merge every SSTable into one.
    Universal,
}

/// Configuration for the Tandem storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all data files (WAL, pages, SSTables).
    pub data_dir: PathBuf,

    /// Backend bound at construction.
    pub backend: BackendKind,

    /// B-Tree fan-out. Must be even, at least 4, and small enough that a
    /// full node of minimal entries fits one page (at most 126).
    pub btree_order: usize,

    /// Number of page frames in the buffer pool.
    pub buffer_pool_pages: usize,

    /// Number of entries (tombstones included) before a MemTable is sealed.
    pub memtable_capacity: usize,

    /// Compaction policy for the LSM backend.
    pub compaction_policy: CompactionPolicy,

    /// Background compaction starts once SSTable count exceeds this.
    pub compaction_trigger: usize,

    /// Whether flushes may schedule background compaction.
    pub auto_compaction: bool,

    /// Minimum run length for size-tiered compaction.
    pub size_tiered_min_tables: usize,

    /// Upper size bound of the smallest size tier, in bytes.
    pub size_tiered_base_bytes: u64,

    /// Size multiplier between consecutive tiers.
    pub size_tiered_ratio: u64,

    /// Every Nth SSTable record is placed in the sparse index.
    pub sparse_index_interval: usize,

    /// Target false positive rate of each SSTable's Bloom filter.
    pub bloom_false_positive_rate: f64,

    /// Largest accepted key, in bytes.
    pub max_key_size: usize,

    /// Largest accepted value, in bytes.
    pub max_value_size: usize,

    /// The WAL is rewritten after a checkpoint once it grows past this.
    pub wal_truncate_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            backend: BackendKind::Lsm,
            btree_order: 16,
            buffer_pool_pages: 256,
            memtable_capacity: 4096,
            compaction_policy: CompactionPolicy::Leveled,
            compaction_trigger: 3,
            auto_compaction: true,
            size_tiered_min_tables: 4,
            size_tiered_base_bytes: 4 * 1024 * 1024, // 4 MB
            size_tiered_ratio: 10,
            sparse_index_interval: 16,
            bloom_false_positive_rate: 0.01,
            max_key_size: 4 * 1024,
            max_value_size: 1024 * 1024,
            wal_truncate_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Create a new Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Select the backend.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set the B-Tree order.
    pub fn with_btree_order(mut self, order: usize) -> Self {
        self.btree_order = order;
        self
    }

    /// Set the buffer pool capacity in pages.
    pub fn with_buffer_pool_pages(mut self, pages: usize) -> Self {
        self.buffer_pool_pages = pages;
        self
    }

    /// Set the MemTable capacity in entries.
    pub fn with_memtable_capacity(mut self, entries: usize) -> Self {
        self.memtable_capacity = entries;
        self
    }

    /// Set the compaction policy.
    pub fn with_compaction_policy(mut self, policy: CompactionPolicy) -> Self {
        self.compaction_policy = policy;
        self
    }

    /// Set the SSTable count above which compaction is scheduled.
    pub fn with_compaction_trigger(mut self, tables: usize) -> Self {
        self.compaction_trigger = tables;
        self
    }

    /// Enable or disable background compaction after flushes.
    pub fn with_auto_compaction(mut self, enabled: bool) -> Self {
        self.auto_compaction = enabled;
        self
    }

    /// Set the size-tiered base tier bound.
    pub fn with_size_tiered_base_bytes(mut self, bytes: u64) -> Self {
        self.size_tiered_base_bytes = bytes;
        self
    }

    /// Set the Bloom filter false positive target.
    pub fn with_bloom_false_positive_rate(mut self, rate: f64) -> Self {
        self.bloom_false_positive_rate = rate;
        self
    }

    /// Set the WAL truncation threshold.
    pub fn with_wal_truncate_bytes(mut self, bytes: u64) -> Self {
        self.wal_truncate_bytes = bytes;
        self
    }

    /// Reject parameter combinations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        entry_limit(self.btree_order)?;
        if self.buffer_pool_pages == 0 {
            return Err(TandemError::Config(
                "buffer_pool_pages must be at least 1".into(),
            ));
        }
        if self.memtable_capacity == 0 {
            return Err(TandemError::Config(
                "memtable_capacity must be at least 1".into(),
            ));
        }
        if self.sparse_index_interval == 0 {
            return Err(TandemError::Config(
                "sparse_index_interval must be at least 1".into(),
            ));
        }
        if self.size_tiered_min_tables < 2 || self.size_tiered_ratio < 2 {
            return Err(TandemError::Config(
                "size-tiered compaction needs min_tables >= 2 and ratio >= 2".into(),
            ));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(TandemError::Config(format!(
                "bloom_false_positive_rate must be in (0, 1), got {}",
                self.bloom_false_positive_rate
            )));
        }
        if self.max_key_size == 0 {
            return Err(TandemError::Config("max_key_size must be positive".into()));
        }
        Ok(())
    }

    /// Ensure the data directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_odd_order_rejected() {
        let config = Config::default().with_btree_order(5);
        assert!(matches!(config.validate(), Err(TandemError::Config(_))));
    }

    #[test]
    fn test_order_wider_than_a_page_rejected() {
        assert!(Config::default().with_btree_order(126).validate().is_ok());
        for order in [128, 254, 1024] {
            let config = Config::default().with_btree_order(order);
            assert!(matches!(config.validate(), Err(TandemError::Config(_))));
        }
    }

    #[test]
    fn test_bloom_rate_bounds() {
        assert!(Config::default().with_bloom_false_positive_rate(0.0).validate().is_err());
        assert!(Config::default().with_bloom_false_positive_rate(1.0).validate().is_err());
        assert!(Config::default().with_bloom_false_positive_rate(0.001).validate().is_ok());
    }

    #[test]
    fn test_zero_pool_rejected() {
        let config = Config::default().with_buffer_pool_pages(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_chain() {
        let config = Config::new("/tmp/x")
            .with_backend(BackendKind::BTree)
            .with_btree_order(4)
            .with_memtable_capacity(100);
        assert_eq!(config.backend, BackendKind::BTree);
        assert_eq!(config.btree_order, 4);
        assert_eq!(config.memtable_capacity, 100);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/x"));
    }
}
