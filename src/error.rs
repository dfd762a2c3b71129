//! TANDEM - Custom Error Types
//! Defines the error hierarchy shared by both storage backends.

use thiserror::Error;

/// Custom Result type for the Tandem engine.
pub type Result<T> = std::result::Result<T, TandemError>;

/// Error types for the Tandem storage engine.
#[derive(Error, Debug)]
pub enum TandemError {
    /// I/O errors from file operations (WAL, pages, SSTables).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (CRC mismatch, unparsable record).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// WAL or snapshot recovery failure.
    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Every buffer pool frame is pinned. Retry once holders unpin.
    #[error("Buffer pool exhausted: all {capacity} frames are pinned")]
    PoolExhausted { capacity: usize },

    /// Read or write past the end of a page buffer.
    #[error("Page access out of bounds: offset {offset} + len {len} exceeds page size")]
    PageOverflow { offset: usize, len: usize },

    /// Key exceeds the configured limit.
    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    /// Value exceeds the configured limit.
    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    /// Key and value together do not fit a B-Tree page slot.
    #[error("Entry too large for a B-Tree page: {size} bytes (max {max})")]
    EntryTooLarge { size: usize, max: usize },

    /// The engine was used before `recover()` completed.
    #[error("Engine has not been recovered yet")]
    NotRecovered,

    /// A background flush or compaction failed.
    #[error("Background task failed: {0}")]
    Background(String),

    /// A background task was cancelled during shutdown.
    #[error("Operation cancelled")]
    Cancelled,
}

impl TandemError {
    /// Returns true if the failed operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TandemError::PoolExhausted { .. })
    }
}

impl From<bincode::Error> for TandemError {
    fn from(err: bincode::Error) -> Self {
        TandemError::Serialization(err.to_string())
    }
}
