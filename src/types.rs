//! TANDEM - Core Type Definitions
//! Defines fundamental types used across the storage engine.

use serde::{Deserialize, Serialize};

/// Key type for the storage engine.
/// Using Vec<u8> allows arbitrary binary keys, ordered byte-wise.
pub type Key = Vec<u8>;

/// Value type for the storage engine.
pub type Value = Vec<u8>;

/// Log sequence number. Starts at 1; 0 means "nothing logged yet".
pub type Lsn = u64;

/// Transaction identifier supplied by the concurrency-control layer.
/// `AUTOCOMMIT_TX` marks writes issued directly through the facade.
pub type TxId = u64;

pub const AUTOCOMMIT_TX: TxId = 0;

/// Mutation kinds recorded in the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put,
    Delete,
}

/// A single versioned record flowing through the LSM read and merge paths.
/// A `None` value indicates a tombstone (deletion marker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub value: Option<Value>,
}

impl Entry {
    /// Create a new entry with a value (PUT operation).
    pub fn put(key: Key, value: Value) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    /// Create a tombstone entry (DELETE operation).
    pub fn tombstone(key: Key) -> Self {
        Self { key, value: None }
    }

    /// Returns true if this entry is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Milliseconds since the Unix epoch, used to stamp log entries.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
