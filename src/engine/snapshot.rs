//! TANDEM - B-Tree Snapshots
//! Persists the B-Tree through the buffer pool as copy-on-write pages.
//!
//! ## Layout
//! ```text
//! page 0, 1   meta slots, written alternately
//! page 2..    one node image per page
//! ```
//! Every page carries `[len: 4 bytes (LE)][crc: 4 bytes (LE)][bincode payload]`.
//!
//! ## Checkpoint
//! 1. Nodes changed since the last snapshot go to pages the committed
//!    snapshot does not use, children before parents
//! 2. Dirty pages are flushed and the file is synced
//! 3. The next meta slot is written and synced; this is the commit point
//! 4. Pages of the previous snapshot that are no longer referenced
//!    become free
//!
//! A crash before step 3 leaves the previous snapshot intact.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TandemError};
use crate::types::{Key, Lsn, Value};

use super::btree::{Arena, BTree, Node, NodeId};
use super::buffer_pool::BufferPool;
use super::page::{PageFile, PageId, PAGE_SIZE};

const META_SLOTS: PageId = 2;
const PAGE_HEADER: usize = 8;

/// Commit record of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub seq: u64,
    pub root_page: PageId,
    /// Every WAL record up to this LSN is reflected in the snapshot.
    pub checkpoint_lsn: Lsn,
    pub entries: u64,
    pub order: u64,
}

#[derive(Serialize)]
struct NodeImageRef<'a> {
    leaf: bool,
    keys: &'a [Key],
    values: &'a [Value],
    children: &'a [PageId],
}

#[derive(Deserialize)]
struct NodeImage {
    leaf: bool,
    keys: Vec<Key>,
    values: Vec<Value>,
    children: Vec<PageId>,
}

/// Page store for B-Tree snapshots.
pub struct SnapshotStore {
    pool: BufferPool,
    meta: Option<SnapshotMeta>,
    /// Pages not referenced by the committed snapshot.
    free_pages: BTreeSet<PageId>,
    /// First page never handed out.
    next_page: PageId,
}

impl SnapshotStore {
    /// Open the page file at `path` behind a pool of `pool_pages` frames.
    pub fn open(path: &Path, pool_pages: usize) -> Result<Self> {
        let pool = BufferPool::new(PageFile::open(path)?, pool_pages)?;
        Ok(Self {
            pool,
            meta: None,
            free_pages: BTreeSet::new(),
            next_page: META_SLOTS,
        })
    }

    /// The committed snapshot's meta record, if any.
    pub fn meta(&self) -> Option<&SnapshotMeta> {
        self.meta.as_ref()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Number of pages available for reuse.
    pub fn free_page_count(&self) -> usize {
        self.free_pages.len()
    }

    /// Load the newest committed snapshot, or an empty tree if there is none.
    pub fn load(&mut self, order: usize) -> Result<BTree> {
        let page_count = self.pool.file_page_count()?;
        self.next_page = page_count.max(META_SLOTS);
        self.meta = self.read_best_meta(page_count)?;

        let Some(meta) = self.meta.clone() else {
            self.free_pages = (META_SLOTS..self.next_page).collect();
            return BTree::new(order);
        };
        if meta.order != order as u64 {
            return Err(TandemError::Config(format!(
                "snapshot was written with B-Tree order {}, configured order is {}",
                meta.order, order
            )));
        }

        let mut arena = Arena::default();
        let mut reachable = HashSet::new();
        let root = self.load_node(meta.root_page, &mut arena, &mut reachable)?;
        self.free_pages = (META_SLOTS..self.next_page)
            .filter(|page| !reachable.contains(page))
            .collect();

        log::info!(
            "Loaded B-Tree snapshot #{} ({} entries, {} pages, checkpoint LSN {})",
            meta.seq,
            meta.entries,
            reachable.len(),
            meta.checkpoint_lsn
        );
        BTree::from_parts(order, arena, root, meta.entries as usize)
    }

    fn read_best_meta(&self, page_count: u64) -> Result<Option<SnapshotMeta>> {
        let mut best: Option<SnapshotMeta> = None;
        for slot in 0..META_SLOTS.min(page_count) {
            let meta = match self.read_frame(slot) {
                Ok(Some(payload)) => bincode::deserialize::<SnapshotMeta>(&payload).ok(),
                Ok(None) => None,
                Err(TandemError::Corruption(reason)) => {
                    log::warn!("Ignoring torn snapshot meta slot {}: {}", slot, reason);
                    None
                }
                Err(err) => return Err(err),
            };
            if let Some(meta) = meta {
                if best.as_ref().map_or(true, |b| meta.seq > b.seq) {
                    best = Some(meta);
                }
            }
        }
        Ok(best)
    }

    fn load_node(
        &self,
        page: PageId,
        arena: &mut Arena,
        reachable: &mut HashSet<PageId>,
    ) -> Result<NodeId> {
        if page < META_SLOTS || !reachable.insert(page) {
            return Err(TandemError::Corruption(format!(
                "snapshot references page {} twice or as a meta slot",
                page
            )));
        }
        let payload = self.read_frame(page)?.ok_or_else(|| {
            TandemError::Corruption(format!("snapshot node page {} is empty", page))
        })?;
        let image: NodeImage = bincode::deserialize(&payload)?;

        let mut children = Vec::with_capacity(image.children.len());
        for child in image.children {
            children.push(self.load_node(child, arena, reachable)?);
        }
        Ok(arena.alloc(Node {
            leaf: image.leaf,
            keys: image.keys,
            values: image.values,
            children,
            page: Some(page),
            dirty: false,
        }))
    }

    /// Write every changed node and commit a new meta record.
    pub fn checkpoint(&mut self, tree: &mut BTree, lsn: Lsn) -> Result<SnapshotMeta> {
        let mut superseded = std::mem::take(&mut tree.released_pages);
        let root = tree.root;
        let (root_page, written) = self.write_subtree(tree, root, &mut superseded)?;

        self.pool.flush_all()?;
        self.pool.sync()?;

        let meta = SnapshotMeta {
            seq: self.meta.as_ref().map_or(1, |m| m.seq + 1),
            root_page,
            checkpoint_lsn: lsn,
            entries: tree.len() as u64,
            order: tree.order() as u64,
        };
        let slot = meta.seq % META_SLOTS;
        self.write_frame(slot, &bincode::serialize(&meta)?)?;
        self.pool.flush(slot)?;
        self.pool.sync()?;

        self.free_pages.extend(superseded);
        log::info!(
            "B-Tree snapshot #{} committed ({} nodes written, checkpoint LSN {})",
            meta.seq,
            written,
            lsn
        );
        self.meta = Some(meta.clone());
        Ok(meta)
    }

    /// Post-order write of changed nodes. Returns the subtree's page and
    /// the number of nodes written.
    fn write_subtree(
        &mut self,
        tree: &mut BTree,
        id: NodeId,
        superseded: &mut Vec<PageId>,
    ) -> Result<(PageId, usize)> {
        let children = tree.arena[id].children.clone();
        let mut child_pages = Vec::with_capacity(children.len());
        let mut written = 0;
        for child in children {
            let (page, count) = self.write_subtree(tree, child, superseded)?;
            child_pages.push(page);
            written += count;
        }

        let node = &tree.arena[id];
        // A rewritten child moved to a new page, so its parent changes too.
        if !node.dirty && written == 0 {
            if let Some(page) = node.page {
                return Ok((page, 0));
            }
        }

        let payload = bincode::serialize(&NodeImageRef {
            leaf: node.leaf,
            keys: &node.keys,
            values: &node.values,
            children: &child_pages,
        })?;
        let page = self.allocate_page();
        self.write_frame(page, &payload)?;

        let node = &mut tree.arena[id];
        if let Some(old) = node.page.replace(page) {
            superseded.push(old);
        }
        node.dirty = false;
        Ok((page, written + 1))
    }

    fn allocate_page(&mut self) -> PageId {
        match self.free_pages.pop_first() {
            Some(page) => page,
            None => {
                self.next_page += 1;
                self.next_page - 1
            }
        }
    }

    fn write_frame(&self, page_id: PageId, payload: &[u8]) -> Result<()> {
        if PAGE_HEADER + payload.len() > PAGE_SIZE {
            return Err(TandemError::PageOverflow {
                offset: PAGE_HEADER,
                len: payload.len(),
            });
        }
        let mut buf = Vec::with_capacity(PAGE_HEADER + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        buf.extend_from_slice(payload);

        let page = self.pool.get_page(page_id)?;
        page.write(0, &buf)
    }

    /// `Ok(None)` for a page that was never written.
    fn read_frame(&self, page_id: PageId) -> Result<Option<Vec<u8>>> {
        let page = self.pool.get_page(page_id)?;
        let mut header = [0u8; PAGE_HEADER];
        page.read(0, &mut header)?;

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len == 0 && crc == 0 {
            return Ok(None);
        }
        if PAGE_HEADER + len > PAGE_SIZE {
            return Err(TandemError::Corruption(format!(
                "page {} frame length {} exceeds the page",
                page_id, len
            )));
        }

        let mut payload = vec![0u8; len];
        page.read(PAGE_HEADER, &mut payload)?;
        if crc32fast::hash(&payload) != crc {
            return Err(TandemError::Corruption(format!(
                "page {} checksum mismatch",
                page_id
            )));
        }
        Ok(Some(payload))
    }
}
