//! TANDEM - Ordered Key-Value Storage Engine
//!
//! A crash-recoverable storage engine with two interchangeable backends
//! behind one facade, both protected by the same write-ahead log.
//!
//! ## Features
//! - **Write-Ahead Log (WAL)**: Every mutation is fsynced before it is applied, with CRC32 framing and checkpoint markers
//! - **B-Tree backend**: In-memory B+-tree snapshotted copy-on-write to a paged file through an LRU buffer pool
//! - **LSM-Tree backend**: MemTable, immutable SSTables with sparse indexes, background flush and compaction
//! - **Compaction strategies**: Size-tiered, leveled and universal, pluggable behind one trait
//! - **Manifest**: Atomic record of the live SSTables so restarts never resurrect compacted data
//!
//! ## Example
//! ```no_run
//! use tandem::config::{BackendKind, Config};
//! use tandem::engine::StorageEngine;
//!
//! let config = Config::new("./data").with_backend(BackendKind::Lsm);
//! let engine = StorageEngine::open(config).unwrap();
//!
//! engine.put(b"key".to_vec(), b"value".to_vec()).unwrap();
//! assert_eq!(engine.get(b"key").unwrap(), Some(b"value".to_vec()));
//! engine.shutdown().unwrap();
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod types;
