//! TANDEM - B-Tree Index
//! In-place balanced tree with values stored in the leaves.
//!
//! ## Shape
//! - Every node holds at most `order - 1` keys
//! - Every node except the root holds at least `order / 2 - 1` keys
//! - An internal node with `k` keys has `k + 1` children; child `i` holds
//!   keys in `[keys[i - 1], keys[i])`
//! - All leaves sit at the same depth
//!
//! ## Rebalancing
//! Inserts split full nodes on the way down, so a split never has to
//! travel back up. Deletes top up minimal nodes on the way down by
//! borrowing from a sibling or merging with one, so removal from the leaf
//! never underflows.
//!
//! Nodes live in an arena and refer to their children by index.

use std::ops::{Index, IndexMut};

use crate::error::{Result, TandemError};
use crate::types::{Key, Value};

use super::page::{PageId, PAGE_SIZE};

/// Index of a node in the arena.
pub type NodeId = usize;

/// Bytes of a node page taken by framing and the node header.
const NODE_PAGE_OVERHEAD: usize = 64;

/// Length prefixes written for each key and value.
const ENTRY_OVERHEAD: usize = 16;

/// Smallest `key.len() + value.len()` every accepted order must allow.
pub const MIN_ENTRY_SIZE: usize = 16;

/// Largest entry a tree of `order` accepts, or a `Config` error when the
/// order is odd, below 4, or too wide for a node to fit one page.
pub fn entry_limit(order: usize) -> Result<usize> {
    if order < 4 || order % 2 != 0 {
        return Err(TandemError::Config(format!(
            "B-Tree order must be even and >= 4, got {}",
            order
        )));
    }
    ((PAGE_SIZE - NODE_PAGE_OVERHEAD) / (order - 1))
        .checked_sub(ENTRY_OVERHEAD)
        .filter(|limit| *limit >= MIN_ENTRY_SIZE)
        .ok_or_else(|| {
            TandemError::Config(format!(
                "B-Tree order {} leaves no room for a {}-byte entry in a {}-byte page",
                order, MIN_ENTRY_SIZE, PAGE_SIZE
            ))
        })
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Node {
    pub(crate) leaf: bool,
    pub(crate) keys: Vec<Key>,
    /// Leaf only, parallel to `keys`.
    pub(crate) values: Vec<Value>,
    /// Internal only.
    pub(crate) children: Vec<NodeId>,
    /// Page holding this node in the last committed snapshot.
    pub(crate) page: Option<PageId>,
    /// Changed since `page` was written.
    pub(crate) dirty: bool,
}

impl Node {
    fn leaf(keys: Vec<Key>, values: Vec<Value>) -> Self {
        Self {
            leaf: true,
            keys,
            values,
            dirty: true,
            ..Default::default()
        }
    }

    fn internal(keys: Vec<Key>, children: Vec<NodeId>) -> Self {
        Self {
            leaf: false,
            keys,
            children,
            dirty: true,
            ..Default::default()
        }
    }

    /// Position of the child whose interval contains `key`.
    fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|k| k.as_slice() <= key)
    }

    fn find(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.keys.binary_search_by(|k| k.as_slice().cmp(key))
    }
}

/// Slot storage for nodes, with reuse of freed slots.
#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Option<Node>>,
    free: Vec<NodeId>,
}

impl Arena {
    pub(crate) fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(node);
                id
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) -> Node {
        let node = self.take(id);
        self.free.push(id);
        node
    }

    /// Move a node out for editing alongside another one.
    fn take(&mut self, id: NodeId) -> Node {
        self.slots[id].take().unwrap_or_else(|| freed(id))
    }

    fn restore(&mut self, id: NodeId, node: Node) {
        self.slots[id] = Some(node);
    }

    fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// # Panics
/// Indexing a freed slot panics; a live node never refers to one.
impl Index<NodeId> for Arena {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        self.slots[id].as_ref().unwrap_or_else(|| freed(id))
    }
}

impl IndexMut<NodeId> for Arena {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        self.slots[id].as_mut().unwrap_or_else(|| freed(id))
    }
}

fn freed(id: NodeId) -> ! {
    panic!("B-Tree node {} used after it was freed", id)
}

/// Ordered map from byte keys to byte values.
#[derive(Debug)]
pub struct BTree {
    order: usize,
    pub(crate) arena: Arena,
    pub(crate) root: NodeId,
    len: usize,
    max_entry_size: usize,
    /// Snapshot pages of merged-away nodes, reusable after the next checkpoint.
    pub(crate) released_pages: Vec<PageId>,
}

impl BTree {
    /// Create an empty tree. `order` must pass `entry_limit`.
    pub fn new(order: usize) -> Result<Self> {
        let mut arena = Arena::default();
        let root = arena.alloc(Node::leaf(Vec::new(), Vec::new()));
        Self::from_parts(order, arena, root, 0)
    }

    pub(crate) fn from_parts(order: usize, arena: Arena, root: NodeId, len: usize) -> Result<Self> {
        let max_entry_size = entry_limit(order)?;
        Ok(Self {
            order,
            arena,
            root,
            len,
            max_entry_size,
            released_pages: Vec::new(),
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Number of key-value pairs.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Largest `key.len() + value.len()` that still lets a full node fit a page.
    pub fn max_entry_size(&self) -> usize {
        self.max_entry_size
    }

    /// Reject an entry that could not share a page with its siblings.
    pub fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let size = key.len() + value.len();
        if size > self.max_entry_size {
            return Err(TandemError::EntryTooLarge {
                size,
                max: self.max_entry_size,
            });
        }
        Ok(())
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.arena.live()
    }

    /// Number of levels; a lone leaf root has depth 1.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut id = self.root;
        while !self.arena[id].leaf {
            id = self.arena[id].children[0];
            depth += 1;
        }
        depth
    }

    fn max_keys(&self) -> usize {
        self.order - 1
    }

    fn min_keys(&self) -> usize {
        self.order / 2 - 1
    }

    fn is_full(&self, id: NodeId) -> bool {
        self.arena[id].keys.len() >= self.max_keys()
    }

    /// Look up `key`.
    pub fn search(&self, key: &[u8]) -> Option<&Value> {
        let mut id = self.root;
        loop {
            let node = &self.arena[id];
            if node.leaf {
                return node.find(key).ok().map(|i| &node.values[i]);
            }
            id = node.children[node.child_index(key)];
        }
    }

    /// Insert or overwrite `key`. Returns the previous value.
    pub fn insert(&mut self, key: Key, value: Value) -> Result<Option<Value>> {
        self.check_entry(&key, &value)?;

        if self.is_full(self.root) {
            let old_root = self.root;
            self.root = self.arena.alloc(Node::internal(Vec::new(), vec![old_root]));
            self.split_child(self.root, 0);
        }

        let mut id = self.root;
        loop {
            if self.arena[id].leaf {
                let node = &mut self.arena[id];
                node.dirty = true;
                return Ok(match node.find(&key) {
                    Ok(i) => Some(std::mem::replace(&mut node.values[i], value)),
                    Err(i) => {
                        node.keys.insert(i, key);
                        node.values.insert(i, value);
                        self.len += 1;
                        None
                    }
                });
            }

            let mut idx = self.arena[id].child_index(&key);
            if self.is_full(self.arena[id].children[idx]) {
                self.split_child(id, idx);
                if key >= self.arena[id].keys[idx] {
                    idx += 1;
                }
            }
            id = self.arena[id].children[idx];
        }
    }

    /// Split the full child at `idx` of `parent` into two siblings.
    fn split_child(&mut self, parent: NodeId, idx: usize) {
        let half = self.order / 2;
        let child = self.arena[parent].children[idx];

        let (separator, right) = {
            let node = &mut self.arena[child];
            node.dirty = true;
            if node.leaf {
                // The right leaf's first key is copied up.
                let keys = node.keys.split_off(half);
                let values = node.values.split_off(half);
                (keys[0].clone(), Node::leaf(keys, values))
            } else {
                // The middle key moves up.
                let mut keys = node.keys.split_off(half - 1);
                let separator = keys.remove(0);
                let children = node.children.split_off(half);
                (separator, Node::internal(keys, children))
            }
        };

        let right = self.arena.alloc(right);
        let parent = &mut self.arena[parent];
        parent.keys.insert(idx, separator);
        parent.children.insert(idx + 1, right);
        parent.dirty = true;
    }

    /// Remove `key`. Returns the removed value.
    pub fn delete(&mut self, key: &[u8]) -> Option<Value> {
        let mut id = self.root;
        let removed = loop {
            if self.arena[id].leaf {
                let node = &mut self.arena[id];
                break match node.find(key) {
                    Ok(i) => {
                        node.keys.remove(i);
                        node.dirty = true;
                        self.len -= 1;
                        Some(node.values.remove(i))
                    }
                    Err(_) => None,
                };
            }

            let mut idx = self.arena[id].child_index(key);
            let child = self.arena[id].children[idx];
            if self.arena[child].keys.len() <= self.min_keys() {
                idx = self.fill_child(id, idx);
            }
            id = self.arena[id].children[idx];
        };

        let root = &self.arena[self.root];
        if !root.leaf && root.keys.is_empty() {
            let old_root = self.root;
            self.root = root.children[0];
            self.free_node(old_root);
        }
        removed
    }

    /// Give the minimal child at `idx` a spare key. Returns the index of
    /// the child now covering the same keys.
    fn fill_child(&mut self, parent: NodeId, idx: usize) -> usize {
        let children = &self.arena[parent].children;
        let has_spare = |id: NodeId| self.arena[id].keys.len() > self.min_keys();

        if idx > 0 && has_spare(children[idx - 1]) {
            self.borrow_from_left(parent, idx);
            idx
        } else if idx + 1 < children.len() && has_spare(children[idx + 1]) {
            self.borrow_from_right(parent, idx);
            idx
        } else if idx > 0 {
            self.merge_children(parent, idx - 1);
            idx - 1
        } else {
            self.merge_children(parent, idx);
            idx
        }
    }

    fn borrow_from_left(&mut self, parent: NodeId, idx: usize) {
        let left_id = self.arena[parent].children[idx - 1];
        let child_id = self.arena[parent].children[idx];
        let mut left = self.arena.take(left_id);
        let mut child = self.arena.take(child_id);
        let parent = &mut self.arena[parent];

        if child.leaf {
            if let (Some(key), Some(value)) = (left.keys.pop(), left.values.pop()) {
                child.keys.insert(0, key);
                child.values.insert(0, value);
                parent.keys[idx - 1] = child.keys[0].clone();
            }
        } else if let (Some(key), Some(grandchild)) = (left.keys.pop(), left.children.pop()) {
            let separator = std::mem::replace(&mut parent.keys[idx - 1], key);
            child.keys.insert(0, separator);
            child.children.insert(0, grandchild);
        }

        parent.dirty = true;
        left.dirty = true;
        child.dirty = true;
        self.arena.restore(left_id, left);
        self.arena.restore(child_id, child);
    }

    fn borrow_from_right(&mut self, parent: NodeId, idx: usize) {
        let child_id = self.arena[parent].children[idx];
        let right_id = self.arena[parent].children[idx + 1];
        let mut child = self.arena.take(child_id);
        let mut right = self.arena.take(right_id);
        let parent = &mut self.arena[parent];

        if child.leaf {
            child.keys.push(right.keys.remove(0));
            child.values.push(right.values.remove(0));
            parent.keys[idx] = right.keys[0].clone();
        } else {
            let key = right.keys.remove(0);
            let separator = std::mem::replace(&mut parent.keys[idx], key);
            child.keys.push(separator);
            child.children.push(right.children.remove(0));
        }

        parent.dirty = true;
        child.dirty = true;
        right.dirty = true;
        self.arena.restore(child_id, child);
        self.arena.restore(right_id, right);
    }

    /// Fold child `idx + 1` of `parent` into child `idx`.
    fn merge_children(&mut self, parent: NodeId, idx: usize) {
        let (separator, right_id) = {
            let parent = &mut self.arena[parent];
            parent.dirty = true;
            (parent.keys.remove(idx), parent.children.remove(idx + 1))
        };
        let left_id = self.arena[parent].children[idx];

        let right = self.arena.release(right_id);
        if let Some(page) = right.page {
            self.released_pages.push(page);
        }
        let left = &mut self.arena[left_id];
        if !left.leaf {
            left.keys.push(separator);
        }
        left.keys.extend(right.keys);
        left.values.extend(right.values);
        left.children.extend(right.children);
        left.dirty = true;
    }

    fn free_node(&mut self, id: NodeId) {
        let node = self.arena.release(id);
        if let Some(page) = node.page {
            self.released_pages.push(page);
        }
    }

    /// Pairs with keys in `[start, end]`, ascending.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Vec<(Key, Value)> {
        let mut out = Vec::new();
        if start <= end {
            self.collect_range(self.root, start, end, &mut out);
        }
        out
    }

    fn collect_range(&self, id: NodeId, start: &[u8], end: &[u8], out: &mut Vec<(Key, Value)>) {
        let node = &self.arena[id];
        if node.leaf {
            let from = node.keys.partition_point(|k| k.as_slice() < start);
            for (key, value) in node.keys[from..].iter().zip(&node.values[from..]) {
                if key.as_slice() > end {
                    break;
                }
                out.push((key.clone(), value.clone()));
            }
            return;
        }

        let last = node.keys.len();
        for (i, &child) in node.children.iter().enumerate() {
            // Child i spans [keys[i - 1], keys[i]).
            let below_end = i == 0 || node.keys[i - 1].as_slice() <= end;
            let above_start = i == last || node.keys[i].as_slice() > start;
            if below_end && above_start {
                self.collect_range(child, start, end, out);
            }
        }
    }

    /// Verify ordering, occupancy and balance. Returns a description of the
    /// first violation found.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut leaf_depth = None;
        let count = self.check_node(self.root, None, None, 1, &mut leaf_depth)?;
        if count != self.len {
            return Err(format!("len is {} but leaves hold {}", self.len, count));
        }
        Ok(())
    }

    fn check_node(
        &self,
        id: NodeId,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> std::result::Result<usize, String> {
        let node = &self.arena[id];
        let n = node.keys.len();

        if n > self.max_keys() {
            return Err(format!("node {} holds {} keys (max {})", id, n, self.max_keys()));
        }
        if id != self.root && n < self.min_keys() {
            return Err(format!("node {} holds {} keys (min {})", id, n, self.min_keys()));
        }
        if node.keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(format!("node {} keys are not strictly increasing", id));
        }
        if let (Some(lower), Some(first)) = (lower, node.keys.first()) {
            if first.as_slice() < lower {
                return Err(format!("node {} has a key below its lower bound", id));
            }
        }
        if let (Some(upper), Some(last)) = (upper, node.keys.last()) {
            if last.as_slice() >= upper {
                return Err(format!("node {} has a key at or above its upper bound", id));
            }
        }

        if node.leaf {
            if node.values.len() != n || !node.children.is_empty() {
                return Err(format!("leaf {} has mismatched values or children", id));
            }
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Err(format!(
                        "leaf {} at depth {} but others at {}",
                        id, depth, expected
                    ))
                }
                Some(_) => {}
            }
            return Ok(n);
        }

        if node.children.len() != n + 1 || !node.values.is_empty() {
            return Err(format!(
                "internal node {} has {} keys and {} children",
                id,
                n,
                node.children.len()
            ));
        }
        let mut count = 0;
        for (i, &child) in node.children.iter().enumerate() {
            let lo = if i == 0 { lower } else { Some(node.keys[i - 1].as_slice()) };
            let hi = if i == n { upper } else { Some(node.keys[i].as_slice()) };
            count += self.check_node(child, lo, hi, depth + 1, leaf_depth)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn k(i: u32) -> Key {
        format!("{:06}", i).into_bytes()
    }

    fn v(i: u32) -> Value {
        format!("value_{}", i).into_bytes()
    }

    #[test]
    fn test_insert_and_search() {
        let mut tree = BTree::new(4).unwrap();
        for i in [5, 1, 9, 3, 7, 2, 8] {
            assert_eq!(tree.insert(k(i), v(i)).unwrap(), None);
        }
        assert_eq!(tree.len(), 7);
        assert_eq!(tree.search(&k(3)), Some(&v(3)));
        assert_eq!(tree.search(&k(4)), None);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_overwrite_returns_previous() {
        let mut tree = BTree::new(4).unwrap();
        tree.insert(k(1), b"old".to_vec()).unwrap();
        assert_eq!(tree.insert(k(1), b"new".to_vec()).unwrap(), Some(b"old".to_vec()));
        assert_eq!(tree.search(&k(1)), Some(&b"new".to_vec()));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_order_four_sequential_range() {
        let mut tree = BTree::new(4).unwrap();
        for i in 1..=1000 {
            tree.insert(k(i), v(i)).unwrap();
        }
        tree.check_invariants().unwrap();

        let got = tree.range(&k(500), &k(510));
        let expected: Vec<(Key, Value)> = (500..=510).map(|i| (k(i), v(i))).collect();
        assert_eq!(got, expected);

        // At least two children per internal node bounds the height.
        let depth = tree.depth();
        assert!((5..=10).contains(&depth), "depth {}", depth);
    }

    #[test]
    fn test_range_edges() {
        let mut tree = BTree::new(6).unwrap();
        for i in (0..200).step_by(2) {
            tree.insert(k(i), v(i)).unwrap();
        }
        assert_eq!(tree.range(&k(11), &k(15)).len(), 2); // 12, 14
        assert_eq!(tree.range(&k(0), &k(0)), vec![(k(0), v(0))]);
        assert!(tree.range(&k(199), &k(500)).is_empty());
        assert!(tree.range(&k(50), &k(10)).is_empty());
        assert_eq!(tree.range(b"", b"\xff").len(), 100);
    }

    #[test]
    fn test_delete_everything_collapses_root() {
        let mut tree = BTree::new(4).unwrap();
        for i in 0..300 {
            tree.insert(k(i), v(i)).unwrap();
        }
        for i in (0..300).rev().step_by(3) {
            assert_eq!(tree.delete(&k(i)), Some(v(i)));
            tree.check_invariants().unwrap();
        }
        for i in 0..300 {
            tree.delete(&k(i));
        }
        tree.check_invariants().unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.delete(&k(1)), None);
    }

    #[test]
    fn test_delete_missing_key() {
        let mut tree = BTree::new(4).unwrap();
        for i in 0..20 {
            tree.insert(k(i), v(i)).unwrap();
        }
        assert_eq!(tree.delete(&k(99)), None);
        assert_eq!(tree.len(), 20);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_entry_too_large() {
        let mut tree = BTree::new(16).unwrap();
        let max = tree.max_entry_size();
        assert!(tree.insert(b"k".to_vec(), vec![0; max - 1]).is_ok());
        let err = tree.insert(b"k2".to_vec(), vec![0; max]).unwrap_err();
        assert!(matches!(err, TandemError::EntryTooLarge { .. }));
    }

    #[test]
    fn test_odd_order_rejected() {
        assert!(BTree::new(5).is_err());
        assert!(BTree::new(2).is_err());
    }

    #[test]
    fn test_order_too_wide_for_page_rejected() {
        assert_eq!(entry_limit(126).unwrap(), MIN_ENTRY_SIZE);
        for order in [128, 254, 256, 4096, 10_000] {
            assert!(
                matches!(BTree::new(order), Err(TandemError::Config(_))),
                "order {} accepted",
                order
            );
        }
        let tree = BTree::new(126).unwrap();
        assert!(tree.check_entry(b"k", &[0; MIN_ENTRY_SIZE - 1]).is_ok());
    }

    #[test]
    fn test_randomized_against_model() {
        for order in [4, 6, 8] {
            let mut rng = StdRng::seed_from_u64(order as u64);
            let mut tree = BTree::new(order).unwrap();
            let mut model = BTreeMap::new();

            for step in 0..4000 {
                let key = k(rng.gen_range(0..400));
                if rng.gen_bool(0.6) {
                    let value = format!("{}", step).into_bytes();
                    assert_eq!(
                        tree.insert(key.clone(), value.clone()).unwrap(),
                        model.insert(key, value)
                    );
                } else {
                    assert_eq!(tree.delete(&key), model.remove(&key));
                }
                if step % 250 == 0 {
                    tree.check_invariants().unwrap();
                }
            }

            tree.check_invariants().unwrap();
            assert_eq!(tree.len(), model.len());
            let all: Vec<(Key, Value)> = model.into_iter().collect();
            assert_eq!(tree.range(b"", b"\xff"), all);
        }
    }
}
