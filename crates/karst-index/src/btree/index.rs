//! B+Tree index over the buffer pool.
//!
//! The tree owns only its root page id; all node storage is loaned from
//! the buffer pool for the duration of a pin. A tree-wide latch serializes
//! structure changes (insert/remove exclusive, lookup and iteration
//! shared); finer-grained latch crabbing is future work.

use super::header::HeaderPage;
use super::iterator::IndexIterator;
use super::page::{self, internal_capacity, leaf_capacity, InternalNode, LeafNode};
use super::types::{IndexKey, NodeType};
use karst_buffer::{BufferPoolManager, PageGuard};
use karst_common::page::PageId;
use karst_common::{KarstError, Result, Rid, Transaction};
use parking_lot::RwLock;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Unique-key B+Tree index.
///
/// Supports point lookup, insertion with node split, deletion with
/// redistribute/coalesce, and forward leaf iteration. The current root
/// page id is persisted in the header page so a fresh instance opened
/// against the same pool observes the existing tree.
pub struct BPlusTree<K: IndexKey> {
    index_name: String,
    pool: Arc<BufferPoolManager>,
    root_page_id: AtomicU32,
    latch: RwLock<()>,
    leaf_max_size: u16,
    internal_max_size: u16,
    _key: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Opens or creates the index named `name`, deriving node fan-out from
    /// the page size.
    pub fn new(name: impl Into<String>, pool: Arc<BufferPoolManager>) -> Result<Self> {
        // One slot of physical capacity is held back so a full node can
        // absorb the overflowing entry before it splits.
        let leaf_max = (leaf_capacity::<K>() - 1) as u16;
        let internal_max = (internal_capacity::<K>() - 1) as u16;
        Self::with_max_sizes(name, pool, leaf_max, internal_max)
    }

    /// Opens or creates the index with explicit node fan-outs. Small
    /// values make split and merge behavior observable in tests.
    pub fn with_max_sizes(
        name: impl Into<String>,
        pool: Arc<BufferPoolManager>,
        leaf_max_size: u16,
        internal_max_size: u16,
    ) -> Result<Self> {
        assert!(
            leaf_max_size >= 2 && (leaf_max_size as usize) < leaf_capacity::<K>(),
            "leaf max size out of range"
        );
        assert!(
            internal_max_size >= 3 && (internal_max_size as usize) < internal_capacity::<K>(),
            "internal max size out of range"
        );

        let index_name = name.into();
        let root_page_id = {
            let guard = Self::header_guard(&pool)?;
            let mut data = guard.data_mut();
            let header = HeaderPage::attach(&mut data[..]);
            header.get_root_id(&index_name).unwrap_or(PageId::INVALID)
        };

        Ok(Self {
            index_name,
            pool,
            root_page_id: AtomicU32::new(root_page_id.0),
            latch: RwLock::new(()),
            leaf_max_size,
            internal_max_size,
            _key: PhantomData,
        })
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.index_name
    }

    /// Returns the current root page id.
    pub fn root_page_id(&self) -> PageId {
        PageId(self.root_page_id.load(Ordering::Acquire))
    }

    /// Returns true when the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    /// Point lookup for `key`.
    pub fn get(&self, key: &K, _txn: &Transaction) -> Result<Option<Rid>> {
        let _latch = self.latch.read();

        if self.is_empty() {
            return Ok(None);
        }
        let leaf_guard = self.find_leaf(Some(key))?;
        let mut data = leaf_guard.data_mut();
        let leaf = LeafNode::<K>::attach(&mut data[..])?;
        Ok(leaf.lookup(key))
    }

    /// Inserts (key, rid), returning false when the key already exists.
    pub fn insert(&self, key: K, rid: Rid, _txn: &Transaction) -> Result<bool> {
        let _latch = self.latch.write();

        if self.is_empty() {
            self.start_new_tree(key, rid)?;
            return Ok(true);
        }

        let leaf_guard = self.find_leaf(Some(&key))?;
        let full = {
            let mut data = leaf_guard.data_mut();
            let mut leaf = LeafNode::<K>::attach(&mut data[..])?;
            if leaf.lookup(&key).is_some() {
                return Ok(false);
            }
            if leaf.size() < leaf.max_size() {
                leaf.insert(key, rid);
                false
            } else {
                true
            }
        };

        if full {
            self.split_leaf_and_insert(&leaf_guard, key, rid)?;
        }
        leaf_guard.mark_dirty();
        Ok(true)
    }

    /// Removes `key`, returning whether it existed.
    pub fn remove(&self, key: &K, _txn: &Transaction) -> Result<bool> {
        let _latch = self.latch.write();

        if self.is_empty() {
            return Ok(false);
        }

        let leaf_guard = self.find_leaf(Some(key))?;
        let (existed, underflow) = {
            let mut data = leaf_guard.data_mut();
            let mut leaf = LeafNode::<K>::attach(&mut data[..])?;
            let before = leaf.size();
            let after = leaf.remove(key);
            (after != before, after < leaf.min_size())
        };

        if !existed {
            return Ok(false);
        }
        leaf_guard.mark_dirty();
        if underflow {
            self.coalesce_or_redistribute(leaf_guard)?;
        }
        Ok(true)
    }

    /// Iterates all entries in ascending key order.
    pub fn iter(&self) -> Result<IndexIterator<'_, K>> {
        let latch = self.latch.read();

        if self.is_empty() {
            return Ok(IndexIterator::new(&self.pool, latch, None, 0));
        }
        let leaf_guard = self.find_leaf(None)?;
        Ok(IndexIterator::new(&self.pool, latch, Some(leaf_guard), 0))
    }

    /// Iterates entries with keys >= `key` in ascending order.
    pub fn iter_from(&self, key: &K) -> Result<IndexIterator<'_, K>> {
        let latch = self.latch.read();

        if self.is_empty() {
            return Ok(IndexIterator::new(&self.pool, latch, None, 0));
        }
        let leaf_guard = self.find_leaf(Some(key))?;
        let index = {
            let mut data = leaf_guard.data_mut();
            let leaf = LeafNode::<K>::attach(&mut data[..])?;
            leaf.key_index(key)
        };
        Ok(IndexIterator::new(&self.pool, latch, Some(leaf_guard), index))
    }

    /// Fetches the header page, creating it on first use of a fresh pool.
    fn header_guard(pool: &BufferPoolManager) -> Result<PageGuard<'_>> {
        match pool.fetch_page(PageId::HEADER) {
            Ok(guard) => Ok(guard),
            Err(KarstError::PageNotFound { .. }) => {
                let guard = pool.new_page()?;
                debug_assert_eq!(guard.page_id(), PageId::HEADER);
                Ok(guard)
            }
            Err(e) => Err(e),
        }
    }

    /// Persists a root change through the header page.
    fn set_root_page_id(&self, new_root: PageId) -> Result<()> {
        self.root_page_id.store(new_root.0, Ordering::Release);

        let guard = Self::header_guard(&self.pool)?;
        {
            let mut data = guard.data_mut();
            let mut header = HeaderPage::attach(&mut data[..]);
            if !header.update_record(&self.index_name, new_root) {
                header.insert_record(&self.index_name, new_root)?;
            }
        }
        guard.mark_dirty();
        debug!(
            index = %self.index_name,
            root = new_root.as_u32(),
            "root page id changed"
        );
        Ok(())
    }

    /// Descends to the leaf covering `key`, or to the leftmost leaf when
    /// `key` is None. Interior nodes are unpinned as soon as the next
    /// child is known.
    fn find_leaf(&self, key: Option<&K>) -> Result<PageGuard<'_>> {
        let mut page_id = self.root_page_id();
        loop {
            let guard = self.pool.fetch_page(page_id)?;
            let next = {
                let mut data = guard.data_mut();
                match page::node_type(&data[..])? {
                    NodeType::Leaf => None,
                    NodeType::Internal => {
                        let node = InternalNode::<K>::attach(&mut data[..])?;
                        Some(match key {
                            Some(key) => node.lookup(key),
                            None => node.value_at(0),
                        })
                    }
                }
            };
            match next {
                None => return Ok(guard),
                Some(child) => page_id = child,
            }
        }
    }

    /// Builds the first leaf and persists it as the root.
    fn start_new_tree(&self, key: K, rid: Rid) -> Result<()> {
        let guard = self.pool.new_page()?;
        let page_id = guard.page_id();
        {
            let mut data = guard.data_mut();
            let mut leaf =
                LeafNode::<K>::init(&mut data[..], page_id, PageId::INVALID, self.leaf_max_size);
            leaf.insert(key, rid);
        }
        guard.mark_dirty();
        self.set_root_page_id(page_id)
    }

    /// Splits a full leaf around the pending entry and threads the new
    /// sibling into the leaf chain and the parent.
    fn split_leaf_and_insert(&self, leaf_guard: &PageGuard<'_>, key: K, rid: Rid) -> Result<()> {
        let sibling_guard = self.pool.new_page()?;
        let sibling_id = sibling_guard.page_id();

        let separator;
        {
            let mut ldata = leaf_guard.data_mut();
            let mut leaf = LeafNode::<K>::attach(&mut ldata[..])?;
            // The reserved capacity slot absorbs the overflow until the
            // upper half moves out.
            leaf.insert(key, rid);

            let mut sdata = sibling_guard.data_mut();
            let mut sibling = LeafNode::<K>::init(
                &mut sdata[..],
                sibling_id,
                leaf.parent_page_id(),
                leaf.max_size(),
            );
            leaf.move_half_to(&mut sibling);
            sibling.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(sibling_id);
            separator = sibling.key_at(0);
        }
        sibling_guard.mark_dirty();
        debug!(
            left = leaf_guard.page_id().as_u32(),
            right = sibling_id.as_u32(),
            "leaf split"
        );

        self.insert_into_parent(leaf_guard.page_id(), separator, sibling_id)
    }

    /// Installs (key, right) above a freshly split node, splitting parents
    /// recursively and growing a new root when the split reached it.
    fn insert_into_parent(&self, left: PageId, key: K, right: PageId) -> Result<()> {
        if left == self.root_page_id() {
            let root_guard = self.pool.new_page()?;
            let root_id = root_guard.page_id();
            {
                let mut data = root_guard.data_mut();
                let mut root = InternalNode::<K>::init(
                    &mut data[..],
                    root_id,
                    PageId::INVALID,
                    self.internal_max_size,
                );
                root.populate_new_root(left, key, right);
            }
            root_guard.mark_dirty();

            for child in [left, right] {
                let guard = self.pool.fetch_page(child)?;
                page::set_parent_page_id(&mut guard.data_mut()[..], root_id);
                guard.mark_dirty();
            }
            return self.set_root_page_id(root_id);
        }

        let parent_id = {
            let guard = self.pool.fetch_page(left)?;
            let data = guard.data();
            page::parent_page_id(&data[..])
        };

        let parent_guard = self.pool.fetch_page(parent_id)?;
        let split_needed = {
            let mut data = parent_guard.data_mut();
            let mut parent = InternalNode::<K>::attach(&mut data[..])?;
            if parent.size() < parent.max_size() {
                parent.insert_node_after(left, key, right)?;
                false
            } else {
                true
            }
        };
        if !split_needed {
            parent_guard.mark_dirty();
            return Ok(());
        }

        // Full parent: absorb the entry, then promote the middle key
        let new_parent_guard = self.pool.new_page()?;
        let new_parent_id = new_parent_guard.page_id();
        let promoted;
        {
            let mut pdata = parent_guard.data_mut();
            let mut parent = InternalNode::<K>::attach(&mut pdata[..])?;
            parent.insert_node_after(left, key, right)?;

            let mut ndata = new_parent_guard.data_mut();
            let mut new_parent = InternalNode::<K>::init(
                &mut ndata[..],
                new_parent_id,
                parent.parent_page_id(),
                parent.max_size(),
            );
            parent.move_half_to(&mut new_parent, &self.pool)?;
            promoted = new_parent.key_at(0);
        }
        parent_guard.mark_dirty();
        new_parent_guard.mark_dirty();
        debug!(
            left = parent_id.as_u32(),
            right = new_parent_id.as_u32(),
            "internal split"
        );

        self.insert_into_parent(parent_id, promoted, new_parent_id)
    }

    /// Repairs an underfull node by borrowing from or merging with a
    /// sibling, recursing up when the parent underflows in turn.
    fn coalesce_or_redistribute(&self, node_guard: PageGuard<'_>) -> Result<()> {
        let node_id = node_guard.page_id();
        if node_id == self.root_page_id() {
            return self.adjust_root(node_guard);
        }

        let (parent_id, node_size, node_max, node_is_leaf) = {
            let data = node_guard.data();
            (
                page::parent_page_id(&data[..]),
                page::node_size(&data[..]),
                page::node_max_size(&data[..]),
                page::node_type(&data[..])? == NodeType::Leaf,
            )
        };

        let parent_guard = self.pool.fetch_page(parent_id)?;
        let (sibling_id, sibling_is_left, separator_index) = {
            let mut pdata = parent_guard.data_mut();
            let parent = InternalNode::<K>::attach(&mut pdata[..])?;
            let node_index = parent.value_index(node_id).ok_or_else(|| {
                KarstError::TreeCorrupted(format!("page {node_id} missing from its parent"))
            })?;
            if node_index == 0 {
                // Leftmost child: only a right sibling exists
                (parent.value_at(1), false, 1)
            } else {
                (parent.value_at(node_index - 1), true, node_index)
            }
        };

        let sibling_guard = self.pool.fetch_page(sibling_id)?;
        let sibling_size = {
            let data = sibling_guard.data();
            page::node_size(&data[..])
        };

        if sibling_size + node_size > node_max {
            self.redistribute(
                &node_guard,
                &sibling_guard,
                &parent_guard,
                sibling_is_left,
                separator_index,
                node_is_leaf,
            )
        } else {
            self.coalesce(
                node_guard,
                sibling_guard,
                parent_guard,
                sibling_is_left,
                separator_index,
                node_is_leaf,
            )
        }
    }

    /// Moves one entry across the shared parent separator to repair an
    /// underflow without merging.
    fn redistribute(
        &self,
        node_guard: &PageGuard<'_>,
        sibling_guard: &PageGuard<'_>,
        parent_guard: &PageGuard<'_>,
        sibling_is_left: bool,
        separator_index: usize,
        node_is_leaf: bool,
    ) -> Result<()> {
        {
            let mut ndata = node_guard.data_mut();
            let mut sdata = sibling_guard.data_mut();
            let mut pdata = parent_guard.data_mut();
            let mut parent = InternalNode::<K>::attach(&mut pdata[..])?;

            let new_separator = if node_is_leaf {
                let mut node = LeafNode::<K>::attach(&mut ndata[..])?;
                let mut sibling = LeafNode::<K>::attach(&mut sdata[..])?;
                if sibling_is_left {
                    sibling.move_last_to_front_of(&mut node)
                } else {
                    sibling.move_first_to_end_of(&mut node)
                }
            } else {
                let mut node = InternalNode::<K>::attach(&mut ndata[..])?;
                let mut sibling = InternalNode::<K>::attach(&mut sdata[..])?;
                let separator = parent.key_at(separator_index);
                if sibling_is_left {
                    sibling.move_last_to_front_of(&mut node, separator, &self.pool)?
                } else {
                    sibling.move_first_to_end_of(&mut node, separator, &self.pool)?
                }
            };
            parent.set_key_at(separator_index, &new_separator);
        }
        node_guard.mark_dirty();
        sibling_guard.mark_dirty();
        parent_guard.mark_dirty();
        Ok(())
    }

    /// Merges an underfull node into its left neighbor, removes the
    /// separator from the parent, and recurses when the parent underflows.
    fn coalesce(
        &self,
        node_guard: PageGuard<'_>,
        sibling_guard: PageGuard<'_>,
        parent_guard: PageGuard<'_>,
        sibling_is_left: bool,
        separator_index: usize,
        node_is_leaf: bool,
    ) -> Result<()> {
        // The right node always drains into the left survivor
        let (survivor_guard, drained_guard) = if sibling_is_left {
            (sibling_guard, node_guard)
        } else {
            (node_guard, sibling_guard)
        };

        {
            let mut sdata = survivor_guard.data_mut();
            let mut ddata = drained_guard.data_mut();
            let mut pdata = parent_guard.data_mut();
            let mut parent = InternalNode::<K>::attach(&mut pdata[..])?;

            if node_is_leaf {
                let mut survivor = LeafNode::<K>::attach(&mut sdata[..])?;
                let mut drained = LeafNode::<K>::attach(&mut ddata[..])?;
                drained.move_all_to(&mut survivor);
            } else {
                let mut survivor = InternalNode::<K>::attach(&mut sdata[..])?;
                let mut drained = InternalNode::<K>::attach(&mut ddata[..])?;
                let middle_key = parent.key_at(separator_index);
                drained.move_all_to(&mut survivor, middle_key, &self.pool)?;
            }
            parent.remove_at(separator_index);
        }
        survivor_guard.mark_dirty();
        parent_guard.mark_dirty();
        debug!(
            survivor = survivor_guard.page_id().as_u32(),
            drained = drained_guard.page_id().as_u32(),
            "nodes coalesced"
        );

        let drained_id = drained_guard.page_id();
        drop(drained_guard);
        self.pool.delete_page(drained_id)?;

        let parent_underflow = {
            let mut pdata = parent_guard.data_mut();
            let parent = InternalNode::<K>::attach(&mut pdata[..])?;
            parent.size() < parent.min_size()
        };
        if parent_underflow {
            self.coalesce_or_redistribute(parent_guard)?;
        }
        Ok(())
    }

    /// Handles underflow at the root: an internal root with a single child
    /// promotes that child; an empty leaf root empties the tree.
    fn adjust_root(&self, root_guard: PageGuard<'_>) -> Result<()> {
        enum RootChange {
            Promote(PageId),
            Clear,
            Keep,
        }

        let root_id = root_guard.page_id();
        let change = {
            let mut data = root_guard.data_mut();
            match page::node_type(&data[..])? {
                NodeType::Internal => {
                    let node = InternalNode::<K>::attach(&mut data[..])?;
                    if node.size() == 1 {
                        RootChange::Promote(node.value_at(0))
                    } else {
                        RootChange::Keep
                    }
                }
                NodeType::Leaf => {
                    let leaf = LeafNode::<K>::attach(&mut data[..])?;
                    if leaf.size() == 0 {
                        RootChange::Clear
                    } else {
                        RootChange::Keep
                    }
                }
            }
        };

        match change {
            RootChange::Promote(child) => {
                {
                    let guard = self.pool.fetch_page(child)?;
                    page::set_parent_page_id(&mut guard.data_mut()[..], PageId::INVALID);
                    guard.mark_dirty();
                }
                self.set_root_page_id(child)?;
                drop(root_guard);
                self.pool.delete_page(root_id)
            }
            RootChange::Clear => {
                self.set_root_page_id(PageId::INVALID)?;
                drop(root_guard);
                self.pool.delete_page(root_id)
            }
            RootChange::Keep => Ok(()),
        }
    }
}
