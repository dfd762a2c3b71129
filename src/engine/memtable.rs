//! TANDEM - MemTable (In-Memory Sorted Map)
//! The MemTable is the write-buffer of the LSM-Tree.
//! All LSM writes land here before being flushed to SSTables on disk.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::types::{Entry, Key, Lsn, Value};

/// In-memory sorted key-value store backed by a BTreeMap.
/// Serves as the mutable write buffer in the LSM-Tree architecture.
#[derive(Debug)]
pub struct MemTable {
    /// Sorted map storing key-value pairs.
    /// A `None` value represents a tombstone (deletion marker).
    entries: BTreeMap<Key, Option<Value>>,
    /// Current approximate size in bytes.
    size_bytes: usize,
    /// Entry count at which the table must be sealed.
    capacity: usize,
    /// Highest LSN applied to this table.
    max_lsn: Lsn,
}

impl MemTable {
    /// Create a new, empty MemTable holding up to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            size_bytes: 0,
            capacity,
            max_lsn: 0,
        }
    }

    /// Returns the approximate size of the MemTable in bytes.
    pub fn size(&self) -> usize {
        self.size_bytes
    }

    /// Returns the number of entries (tombstones included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the MemTable is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once the table has reached its capacity and must be sealed.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Highest LSN applied to this table (0 if none).
    pub fn max_lsn(&self) -> Lsn {
        self.max_lsn
    }

    /// Insert a key-value pair into the MemTable.
    /// If the key already exists, the old value is replaced.
    pub fn insert(&mut self, key: Key, value: Value, lsn: Lsn) {
        self.upsert(key, Some(value), lsn);
    }

    /// Delete a key by inserting a tombstone marker.
    pub fn delete(&mut self, key: Key, lsn: Lsn) {
        self.upsert(key, None, lsn);
    }

    fn upsert(&mut self, key: Key, value: Option<Value>, lsn: Lsn) {
        let new_size = key.len() + value.as_ref().map_or(0, |v| v.len());
        if let Some(old_val) = self.entries.get(&key) {
            let old_size = key.len() + old_val.as_ref().map_or(0, |v| v.len());
            self.size_bytes = self.size_bytes.saturating_sub(old_size);
        }
        self.size_bytes += new_size;
        self.max_lsn = self.max_lsn.max(lsn);
        self.entries.insert(key, value);
    }

    /// Get a value by key from the MemTable.
    /// Returns `None` if the key does not exist or has been deleted (tombstone).
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.entries.get(key).and_then(Option::as_ref)
    }

    /// Look a key up, distinguishing a tombstone (`Some(None)`) from a miss.
    pub fn lookup(&self, key: &[u8]) -> Option<&Option<Value>> {
        self.entries.get(key)
    }

    /// Check if a key exists in the MemTable (including tombstones).
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    /// Entries with keys in `[start, end]`, tombstones included.
    pub fn range_entries(&self, start: &[u8], end: &[u8]) -> Vec<Entry> {
        range_of(&self.entries, start, end)
    }

    /// Freeze the table. A sealed table has no mutating API.
    pub fn seal(self) -> SealedMemTable {
        SealedMemTable { inner: self }
    }
}

/// A MemTable that has been sealed and is waiting to be flushed.
#[derive(Debug)]
pub struct SealedMemTable {
    inner: MemTable,
}

impl SealedMemTable {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn max_lsn(&self) -> Lsn {
        self.inner.max_lsn
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&Option<Value>> {
        self.inner.lookup(key)
    }

    pub fn range_entries(&self, start: &[u8], end: &[u8]) -> Vec<Entry> {
        self.inner.range_entries(start, end)
    }

    /// All entries in key order, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Option<Value>)> {
        self.inner.entries.iter()
    }
}

fn range_of(entries: &BTreeMap<Key, Option<Value>>, start: &[u8], end: &[u8]) -> Vec<Entry> {
    if start > end {
        return Vec::new();
    }
    entries
        .range::<[u8], _>((Bound::Included(start), Bound::Included(end)))
        .map(|(key, value)| Entry {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut table = MemTable::new(16);
        table.insert(b"key1".to_vec(), b"value1".to_vec(), 1);
        assert_eq!(table.get(b"key1"), Some(&b"value1".to_vec()));
    }

    #[test]
    fn test_get_nonexistent() {
        let table = MemTable::new(16);
        assert_eq!(table.get(b"missing"), None);
        assert_eq!(table.lookup(b"missing"), None);
    }

    #[test]
    fn test_overwrite() {
        let mut table = MemTable::new(16);
        table.insert(b"key".to_vec(), b"old".to_vec(), 1);
        table.insert(b"key".to_vec(), b"new".to_vec(), 2);
        assert_eq!(table.get(b"key"), Some(&b"new".to_vec()));
        assert_eq!(table.len(), 1);
        assert_eq!(table.max_lsn(), 2);
    }

    #[test]
    fn test_delete_tombstone() {
        let mut table = MemTable::new(16);
        table.insert(b"key".to_vec(), b"value".to_vec(), 1);
        table.delete(b"key".to_vec(), 2);
        assert_eq!(table.get(b"key"), None);
        assert_eq!(table.lookup(b"key"), Some(&None));
        assert!(table.contains_key(b"key")); // tombstone still exists
    }

    #[test]
    fn test_size_tracking() {
        let mut table = MemTable::new(16);
        assert_eq!(table.size(), 0);
        table.insert(b"abc".to_vec(), b"12345".to_vec(), 1); // 3 + 5 = 8
        assert_eq!(table.size(), 8);
        table.delete(b"abc".to_vec(), 2); // tombstone keeps only the key
        assert_eq!(table.size(), 3);
    }

    #[test]
    fn test_full_at_capacity() {
        let mut table = MemTable::new(3);
        for i in 0..2u8 {
            table.insert(vec![i], vec![i], i as Lsn + 1);
        }
        assert!(!table.is_full());
        table.delete(vec![9], 3);
        assert!(table.is_full());
    }

    #[test]
    fn test_range_includes_tombstones() {
        let mut table = MemTable::new(16);
        table.insert(b"a".to_vec(), b"1".to_vec(), 1);
        table.insert(b"b".to_vec(), b"2".to_vec(), 2);
        table.delete(b"c".to_vec(), 3);
        table.insert(b"d".to_vec(), b"4".to_vec(), 4);

        let entries = table.range_entries(b"b", b"c");
        assert_eq!(
            entries,
            vec![
                Entry::put(b"b".to_vec(), b"2".to_vec()),
                Entry::tombstone(b"c".to_vec())
            ]
        );
        assert!(table.range_entries(b"z", b"a").is_empty());
    }

    #[test]
    fn test_seal_preserves_contents() {
        let mut table = MemTable::new(4);
        table.insert(b"x".to_vec(), b"1".to_vec(), 5);
        table.delete(b"y".to_vec(), 6);
        let sealed = table.seal();
        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed.max_lsn(), 6);
        assert_eq!(sealed.lookup(b"y"), Some(&None));
        let keys: Vec<&Key> = sealed.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&b"x".to_vec(), &b"y".to_vec()]);
    }
}
