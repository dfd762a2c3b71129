//! TANDEM - K-Way Merge Iterator
//! Merges sorted sources into one sorted stream, keeping only the newest
//! version of each key. Used by range scans and by compaction.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::types::Entry;

/// A sorted, duplicate-free stream of entries.
pub type Source = Box<dyn Iterator<Item = Result<Entry>> + Send>;

/// Heap slot. Ordered so the `BinaryHeap` (a max-heap) pops the smallest
/// key first and, among equal keys, the newest source first.
struct HeapEntry {
    entry: Entry,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .key
            .cmp(&self.entry.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges multiple sorted sources into a single sorted stream.
///
/// Sources are ordered by priority: index 0 is the newest. For a key
/// present in several sources only the newest version is yielded.
/// Tombstones are yielded too; callers decide whether to mask or keep them.
pub struct MergeIterator {
    sources: Vec<Source>,
    heap: BinaryHeap<HeapEntry>,
    failed: bool,
}

impl MergeIterator {
    pub fn new(sources: Vec<Source>) -> Result<Self> {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            failed: false,
        };
        for source in 0..merge.sources.len() {
            merge.advance(source)?;
        }
        Ok(merge)
    }

    /// Pull the next entry of `source` into the heap.
    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.sources[source].next() {
            self.heap.push(HeapEntry {
                entry: next?,
                source,
            });
        }
        Ok(())
    }

    fn next_entry(&mut self) -> Result<Option<Entry>> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        self.advance(top.source)?;

        // Older versions of the same key are shadowed.
        while let Some(peek) = self.heap.peek() {
            if peek.entry.key != top.entry.key {
                break;
            }
            let shadowed = self.heap.pop().map(|slot| slot.source);
            if let Some(source) = shadowed {
                self.advance(source)?;
            }
        }
        Ok(Some(top.entry))
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_entry() {
            Ok(entry) => entry.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Wrap an in-memory run as a merge source.
pub fn vec_source(entries: Vec<Entry>) -> Source {
    Box::new(entries.into_iter().map(Ok))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TandemError;

    fn put(k: &str, v: &str) -> Entry {
        Entry::put(k.as_bytes().to_vec(), v.as_bytes().to_vec())
    }

    fn del(k: &str) -> Entry {
        Entry::tombstone(k.as_bytes().to_vec())
    }

    fn collect(sources: Vec<Vec<Entry>>) -> Vec<Entry> {
        let sources = sources.into_iter().map(vec_source).collect();
        MergeIterator::new(sources)
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
    }

    #[test]
    fn test_interleaves_in_key_order() {
        let merged = collect(vec![
            vec![put("b", "1"), put("d", "1")],
            vec![put("a", "2"), put("c", "2"), put("e", "2")],
        ]);
        let keys: Vec<&[u8]> = merged.iter().map(|e| e.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"a"[..], b"b", b"c", b"d", b"e"]);
    }

    #[test]
    fn test_newest_source_wins() {
        let merged = collect(vec![
            vec![put("k", "newest")],
            vec![put("k", "middle")],
            vec![put("k", "oldest"), put("z", "old")],
        ]);
        assert_eq!(merged, vec![put("k", "newest"), put("z", "old")]);
    }

    #[test]
    fn test_tombstone_shadows_older_value() {
        let merged = collect(vec![vec![del("k")], vec![put("k", "v")]]);
        assert_eq!(merged, vec![del("k")]);
    }

    #[test]
    fn test_empty_sources() {
        assert!(collect(vec![vec![], vec![]]).is_empty());
        assert!(collect(vec![]).is_empty());
    }

    #[test]
    fn test_source_error_is_surfaced_once() {
        let failing: Source = Box::new(
            vec![
                Ok(put("a", "1")),
                Err(TandemError::Corruption("bad record".into())),
            ]
            .into_iter(),
        );
        let mut merge = MergeIterator::new(vec![failing]).unwrap();
        // Advancing past "a" pulls the broken record.
        assert!(matches!(merge.next(), Some(Err(TandemError::Corruption(_)))));
        assert!(merge.next().is_none());
    }
}
