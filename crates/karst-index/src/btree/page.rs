//! B+Tree node layouts: typed views over the bytes of a pinned frame.
//!
//! A view borrows the frame bytes for the duration of a pin and is
//! recomputed after any unpin/fetch; nothing here outlives its guard.

use super::types::{
    IndexKey, LeafHeader, NodeHeader, NodeType, OFF_MAX_SIZE, OFF_NEXT_PAGE_ID, OFF_NODE_TYPE,
    OFF_PAGE_ID, OFF_PARENT_PAGE_ID, OFF_SIZE,
};
use bytes::{Buf, BufMut};
use karst_buffer::BufferPoolManager;
use karst_common::page::{PageId, PAGE_SIZE};
use karst_common::{KarstError, Result, Rid};
use std::marker::PhantomData;

/// Child pointer width in internal entries.
const CHILD_LEN: usize = 4;

/// Number of leaf entries a page can physically hold.
pub fn leaf_capacity<K: IndexKey>() -> usize {
    (PAGE_SIZE - LeafHeader::SIZE) / (K::ENCODED_LEN + Rid::ENCODED_LEN)
}

/// Number of internal entries a page can physically hold.
pub fn internal_capacity<K: IndexKey>() -> usize {
    (PAGE_SIZE - NodeHeader::SIZE) / (K::ENCODED_LEN + CHILD_LEN)
}

/// Reads the node type tag of a page.
pub fn node_type(data: &[u8]) -> Result<NodeType> {
    NodeType::try_from(data[OFF_NODE_TYPE])
}

/// Reads a node's parent page id without a typed view.
pub fn parent_page_id(data: &[u8]) -> PageId {
    PageId((&data[OFF_PARENT_PAGE_ID..]).get_u32_le())
}

/// Reads a node's entry count without a typed view.
pub fn node_size(data: &[u8]) -> u16 {
    read_u16(data, OFF_SIZE)
}

/// Reads a node's maximum size without a typed view.
pub fn node_max_size(data: &[u8]) -> u16 {
    read_u16(data, OFF_MAX_SIZE)
}

/// Rewrites a node's parent page id without a typed view.
///
/// The parent field sits at the same offset in both node kinds, so child
/// re-parenting does not need to know what kind of node it touches.
pub fn set_parent_page_id(data: &mut [u8], parent: PageId) {
    (&mut data[OFF_PARENT_PAGE_ID..]).put_u32_le(parent.0);
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    (&data[offset..]).get_u16_le()
}

fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    (&mut data[offset..]).put_u16_le(value);
}

fn read_page_id(data: &[u8], offset: usize) -> PageId {
    PageId((&data[offset..]).get_u32_le())
}

fn write_page_id(data: &mut [u8], offset: usize, value: PageId) {
    (&mut data[offset..]).put_u32_le(value.0);
}

/// Typed view of a leaf node: a dense ordered array of (key, rid) pairs
/// plus a pointer to the next leaf.
pub struct LeafNode<'a, K> {
    data: &'a mut [u8],
    _key: PhantomData<K>,
}

impl<'a, K: IndexKey> LeafNode<'a, K> {
    const ENTRY_LEN: usize = K::ENCODED_LEN + Rid::ENCODED_LEN;

    /// Initializes a fresh leaf in `data` and returns its view.
    pub fn init(data: &'a mut [u8], page_id: PageId, parent_id: PageId, max_size: u16) -> Self {
        debug_assert!((max_size as usize) < leaf_capacity::<K>());
        let header = LeafHeader {
            node: NodeHeader {
                node_type: NodeType::Leaf,
                size: 0,
                max_size,
                page_id,
                parent_page_id: parent_id,
            },
            next_page_id: PageId::INVALID,
        };
        data[..LeafHeader::SIZE].copy_from_slice(&header.to_bytes());
        Self {
            data,
            _key: PhantomData,
        }
    }

    /// Attaches a view to an existing leaf, validating the type tag.
    pub fn attach(data: &'a mut [u8]) -> Result<Self> {
        match node_type(data)? {
            NodeType::Leaf => Ok(Self {
                data,
                _key: PhantomData,
            }),
            other => Err(KarstError::InvalidNodeType { tag: other as u8 }),
        }
    }

    pub fn size(&self) -> u16 {
        read_u16(self.data, OFF_SIZE)
    }

    fn set_size(&mut self, size: u16) {
        write_u16(self.data, OFF_SIZE, size);
    }

    pub fn max_size(&self) -> u16 {
        read_u16(self.data, OFF_MAX_SIZE)
    }

    /// Minimum entry count for a non-root leaf: ⌈max/2⌉.
    pub fn min_size(&self) -> u16 {
        (self.max_size() + 1) / 2
    }

    pub fn page_id(&self) -> PageId {
        read_page_id(self.data, OFF_PAGE_ID)
    }

    pub fn parent_page_id(&self) -> PageId {
        read_page_id(self.data, OFF_PARENT_PAGE_ID)
    }

    pub fn set_parent_page_id(&mut self, parent: PageId) {
        write_page_id(self.data, OFF_PARENT_PAGE_ID, parent);
    }

    pub fn is_root(&self) -> bool {
        !self.parent_page_id().is_valid()
    }

    pub fn next_page_id(&self) -> PageId {
        read_page_id(self.data, OFF_NEXT_PAGE_ID)
    }

    pub fn set_next_page_id(&mut self, next: PageId) {
        write_page_id(self.data, OFF_NEXT_PAGE_ID, next);
    }

    fn entry_offset(index: usize) -> usize {
        LeafHeader::SIZE + index * Self::ENTRY_LEN
    }

    pub fn key_at(&self, index: usize) -> K {
        debug_assert!(index < self.size() as usize);
        K::decode(&self.data[Self::entry_offset(index)..])
    }

    pub fn set_key_at(&mut self, index: usize, key: &K) {
        debug_assert!(index < self.size() as usize);
        key.encode(&mut self.data[Self::entry_offset(index)..]);
    }

    pub fn value_at(&self, index: usize) -> Rid {
        debug_assert!(index < self.size() as usize);
        let offset = Self::entry_offset(index) + K::ENCODED_LEN;
        let mut cursor = &self.data[offset..];
        Rid::new(PageId(cursor.get_u32_le()), cursor.get_u32_le())
    }

    fn write_entry(&mut self, index: usize, key: &K, rid: Rid) {
        let offset = Self::entry_offset(index);
        key.encode(&mut self.data[offset..]);
        let mut cursor = &mut self.data[offset + K::ENCODED_LEN..];
        cursor.put_u32_le(rid.page_id.0);
        cursor.put_u32_le(rid.slot);
    }

    /// Binary search for an exact key match.
    pub fn lookup(&self, key: &K) -> Option<Rid> {
        self.position_of(key).map(|index| self.value_at(index))
    }

    fn position_of(&self, key: &K) -> Option<usize> {
        let (mut lo, mut hi) = (0usize, self.size() as usize);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key_at(mid).cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    /// Returns the first index whose key is >= `key` (the size when none).
    pub fn key_index(&self, key: &K) -> usize {
        let (mut lo, mut hi) = (0usize, self.size() as usize);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid) < *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Ordered insert; callers ensure uniqueness and physical room.
    ///
    /// Returns the size after insertion.
    pub fn insert(&mut self, key: K, rid: Rid) -> u16 {
        let size = self.size() as usize;
        debug_assert!(size < leaf_capacity::<K>());

        let index = self.key_index(&key);
        self.data.copy_within(
            Self::entry_offset(index)..Self::entry_offset(size),
            Self::entry_offset(index + 1),
        );
        self.write_entry(index, &key, rid);
        let new_size = (size + 1) as u16;
        self.set_size(new_size);
        new_size
    }

    /// Ordered delete; a no-op when the key is absent.
    ///
    /// Returns the size after the operation.
    pub fn remove(&mut self, key: &K) -> u16 {
        let size = self.size() as usize;
        match self.position_of(key) {
            Some(index) => {
                self.data.copy_within(
                    Self::entry_offset(index + 1)..Self::entry_offset(size),
                    Self::entry_offset(index),
                );
                let new_size = (size - 1) as u16;
                self.set_size(new_size);
                new_size
            }
            None => size as u16,
        }
    }

    /// Moves the upper ⌈size/2⌉ entries to an initially empty recipient.
    pub fn move_half_to(&mut self, recipient: &mut LeafNode<'_, K>) {
        debug_assert_eq!(recipient.size(), 0);
        let size = self.size() as usize;
        let half = (size + 1) / 2;
        let split = size - half;

        recipient.data[Self::entry_offset(0)..Self::entry_offset(half)]
            .copy_from_slice(&self.data[Self::entry_offset(split)..Self::entry_offset(size)]);
        recipient.set_size(half as u16);
        self.set_size(split as u16);
    }

    /// Appends every entry to `recipient`, which inherits this node's
    /// next-leaf pointer.
    pub fn move_all_to(&mut self, recipient: &mut LeafNode<'_, K>) {
        let size = self.size() as usize;
        let dest = recipient.size() as usize;
        debug_assert!(dest + size <= leaf_capacity::<K>());

        recipient.data[Self::entry_offset(dest)..Self::entry_offset(dest + size)]
            .copy_from_slice(&self.data[Self::entry_offset(0)..Self::entry_offset(size)]);
        recipient.set_size((dest + size) as u16);
        recipient.set_next_page_id(self.next_page_id());
        self.set_size(0);
    }

    /// Moves the first entry to the end of `recipient` (the left sibling).
    ///
    /// Returns this node's new first key, the replacement separator for
    /// this node's slot in the parent.
    pub fn move_first_to_end_of(&mut self, recipient: &mut LeafNode<'_, K>) -> K {
        let size = self.size() as usize;
        let key = self.key_at(0);
        let rid = self.value_at(0);

        let dest = recipient.size();
        recipient.write_entry(dest as usize, &key, rid);
        recipient.set_size(dest + 1);

        self.data.copy_within(
            Self::entry_offset(1)..Self::entry_offset(size),
            Self::entry_offset(0),
        );
        self.set_size((size - 1) as u16);
        self.key_at(0)
    }

    /// Moves the last entry to the front of `recipient` (the right
    /// sibling).
    ///
    /// Returns the moved key, the replacement separator for the
    /// recipient's slot in the parent.
    pub fn move_last_to_front_of(&mut self, recipient: &mut LeafNode<'_, K>) -> K {
        let size = self.size() as usize;
        let key = self.key_at(size - 1);
        let rid = self.value_at(size - 1);

        let recipient_size = recipient.size() as usize;
        recipient.data.copy_within(
            Self::entry_offset(0)..Self::entry_offset(recipient_size),
            Self::entry_offset(1),
        );
        recipient.write_entry(0, &key, rid);
        recipient.set_size((recipient_size + 1) as u16);

        self.set_size((size - 1) as u16);
        key
    }
}

/// Typed view of an internal node: a dense array of (key, child) pairs
/// where slot 0's key is a sentinel that is never consulted.
pub struct InternalNode<'a, K> {
    data: &'a mut [u8],
    _key: PhantomData<K>,
}

impl<'a, K: IndexKey> InternalNode<'a, K> {
    const ENTRY_LEN: usize = K::ENCODED_LEN + CHILD_LEN;

    /// Initializes a fresh internal node in `data` and returns its view.
    pub fn init(data: &'a mut [u8], page_id: PageId, parent_id: PageId, max_size: u16) -> Self {
        debug_assert!((max_size as usize) < internal_capacity::<K>());
        let header = NodeHeader {
            node_type: NodeType::Internal,
            size: 0,
            max_size,
            page_id,
            parent_page_id: parent_id,
        };
        data[..NodeHeader::SIZE].copy_from_slice(&header.to_bytes());
        Self {
            data,
            _key: PhantomData,
        }
    }

    /// Attaches a view to an existing internal node, validating the tag.
    pub fn attach(data: &'a mut [u8]) -> Result<Self> {
        match node_type(data)? {
            NodeType::Internal => Ok(Self {
                data,
                _key: PhantomData,
            }),
            other => Err(KarstError::InvalidNodeType { tag: other as u8 }),
        }
    }

    pub fn size(&self) -> u16 {
        read_u16(self.data, OFF_SIZE)
    }

    fn set_size(&mut self, size: u16) {
        write_u16(self.data, OFF_SIZE, size);
    }

    pub fn max_size(&self) -> u16 {
        read_u16(self.data, OFF_MAX_SIZE)
    }

    /// Minimum child count for a non-root internal node: ⌈max/2⌉.
    pub fn min_size(&self) -> u16 {
        (self.max_size() + 1) / 2
    }

    pub fn page_id(&self) -> PageId {
        read_page_id(self.data, OFF_PAGE_ID)
    }

    pub fn parent_page_id(&self) -> PageId {
        read_page_id(self.data, OFF_PARENT_PAGE_ID)
    }

    pub fn set_parent_page_id(&mut self, parent: PageId) {
        write_page_id(self.data, OFF_PARENT_PAGE_ID, parent);
    }

    pub fn is_root(&self) -> bool {
        !self.parent_page_id().is_valid()
    }

    fn entry_offset(index: usize) -> usize {
        NodeHeader::SIZE + index * Self::ENTRY_LEN
    }

    /// Returns the key at `index`. Slot 0's key is a sentinel; reading it
    /// is allowed but its value carries no meaning.
    pub fn key_at(&self, index: usize) -> K {
        debug_assert!(index < self.size() as usize);
        K::decode(&self.data[Self::entry_offset(index)..])
    }

    pub fn set_key_at(&mut self, index: usize, key: &K) {
        debug_assert!(index < self.size() as usize);
        key.encode(&mut self.data[Self::entry_offset(index)..]);
    }

    pub fn value_at(&self, index: usize) -> PageId {
        debug_assert!(index < self.size() as usize);
        read_page_id(self.data, Self::entry_offset(index) + K::ENCODED_LEN)
    }

    fn set_value_at(&mut self, index: usize, value: PageId) {
        write_page_id(self.data, Self::entry_offset(index) + K::ENCODED_LEN, value);
    }

    fn write_entry(&mut self, index: usize, key: &K, value: PageId) {
        let offset = Self::entry_offset(index);
        key.encode(&mut self.data[offset..]);
        write_page_id(self.data, offset + K::ENCODED_LEN, value);
    }

    /// Routes `key` to the child subtree C_i with K_i ≤ key < K_{i+1}.
    pub fn lookup(&self, key: &K) -> PageId {
        // First index in [1, size) whose key exceeds the probe; the child
        // just before it covers the probe's range.
        let (mut lo, mut hi) = (1usize, self.size() as usize);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid) <= *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.value_at(lo - 1)
    }

    /// Locates a child by page id.
    pub fn value_index(&self, child: PageId) -> Option<usize> {
        (0..self.size() as usize).find(|&i| self.value_at(i) == child)
    }

    /// Writes the two-entry layout of a brand-new root:
    /// slot 0 = (⊥, left), slot 1 = (key, right).
    pub fn populate_new_root(&mut self, left: PageId, key: K, right: PageId) {
        debug_assert_eq!(self.size(), 0);
        self.data[Self::entry_offset(0)..Self::entry_offset(0) + K::ENCODED_LEN].fill(0);
        self.set_size(2);
        self.set_value_at(0, left);
        self.write_entry(1, &key, right);
    }

    /// Inserts (key, new_child) immediately after the entry whose child is
    /// `old_child`. Returns the size after insertion.
    pub fn insert_node_after(&mut self, old_child: PageId, key: K, new_child: PageId) -> Result<u16> {
        let size = self.size() as usize;
        debug_assert!(size < internal_capacity::<K>());

        let old_index = self.value_index(old_child).ok_or_else(|| {
            KarstError::TreeCorrupted(format!("child {old_child} missing from node {}", self.page_id()))
        })?;
        let index = old_index + 1;
        self.data.copy_within(
            Self::entry_offset(index)..Self::entry_offset(size),
            Self::entry_offset(index + 1),
        );
        self.set_size((size + 1) as u16);
        self.write_entry(index, &key, new_child);
        Ok((size + 1) as u16)
    }

    /// Removes the entry at `index`, closing the gap.
    pub fn remove_at(&mut self, index: usize) {
        let size = self.size() as usize;
        debug_assert!(index < size);
        self.data.copy_within(
            Self::entry_offset(index + 1)..Self::entry_offset(size),
            Self::entry_offset(index),
        );
        self.set_size((size - 1) as u16);
    }

    /// Moves the upper ⌈size/2⌉ entries to an initially empty recipient,
    /// rewriting the moved children's parent pointers through the pool.
    ///
    /// The recipient's slot-0 key keeps the first moved key; the caller
    /// promotes it as the separator.
    pub fn move_half_to(
        &mut self,
        recipient: &mut InternalNode<'_, K>,
        pool: &BufferPoolManager,
    ) -> Result<()> {
        debug_assert_eq!(recipient.size(), 0);
        let size = self.size() as usize;
        let half = (size + 1) / 2;
        let split = size - half;

        recipient.data[Self::entry_offset(0)..Self::entry_offset(half)]
            .copy_from_slice(&self.data[Self::entry_offset(split)..Self::entry_offset(size)]);
        recipient.set_size(half as u16);
        self.set_size(split as u16);

        let new_parent = recipient.page_id();
        for i in 0..half {
            reparent(pool, recipient.value_at(i), new_parent)?;
        }
        Ok(())
    }

    /// Appends every entry to `recipient`, binding this node's first child
    /// under `middle_key` (the separator pulled down from the parent).
    pub fn move_all_to(
        &mut self,
        recipient: &mut InternalNode<'_, K>,
        middle_key: K,
        pool: &BufferPoolManager,
    ) -> Result<()> {
        let size = self.size() as usize;
        let dest = recipient.size() as usize;
        debug_assert!(dest + size <= internal_capacity::<K>());

        self.set_key_at(0, &middle_key);
        recipient.data[Self::entry_offset(dest)..Self::entry_offset(dest + size)]
            .copy_from_slice(&self.data[Self::entry_offset(0)..Self::entry_offset(size)]);
        recipient.set_size((dest + size) as u16);
        self.set_size(0);

        let new_parent = recipient.page_id();
        for i in dest..dest + size {
            reparent(pool, recipient.value_at(i), new_parent)?;
        }
        Ok(())
    }

    /// Moves the first child to the end of `recipient` (the left sibling),
    /// binding it under `separator`. Returns the replacement separator.
    pub fn move_first_to_end_of(
        &mut self,
        recipient: &mut InternalNode<'_, K>,
        separator: K,
        pool: &BufferPoolManager,
    ) -> Result<K> {
        let moved_child = self.value_at(0);
        let new_separator = self.key_at(1);

        let dest = recipient.size() as usize;
        debug_assert!(dest < internal_capacity::<K>());
        recipient.set_size((dest + 1) as u16);
        recipient.write_entry(dest, &separator, moved_child);

        self.remove_at(0);
        reparent(pool, moved_child, recipient.page_id())?;
        Ok(new_separator)
    }

    /// Moves the last child to the front of `recipient` (the right
    /// sibling), pushing `separator` down as the key over the recipient's
    /// old first child. Returns the moved key as the replacement
    /// separator.
    pub fn move_last_to_front_of(
        &mut self,
        recipient: &mut InternalNode<'_, K>,
        separator: K,
        pool: &BufferPoolManager,
    ) -> Result<K> {
        let size = self.size() as usize;
        let moved_key = self.key_at(size - 1);
        let moved_child = self.value_at(size - 1);

        let recipient_size = recipient.size() as usize;
        debug_assert!(recipient_size < internal_capacity::<K>());
        recipient.data.copy_within(
            Self::entry_offset(0)..Self::entry_offset(recipient_size),
            Self::entry_offset(1),
        );
        recipient.set_size((recipient_size + 1) as u16);
        recipient.write_entry(0, &moved_key, moved_child);
        recipient.set_key_at(1, &separator);

        self.set_size((size - 1) as u16);
        reparent(pool, moved_child, recipient.page_id())?;
        Ok(moved_key)
    }
}

/// Rewrites a child's parent pointer through the buffer pool.
fn reparent(pool: &BufferPoolManager, child: PageId, parent: PageId) -> Result<()> {
    let guard = pool.fetch_page(child)?;
    set_parent_page_id(&mut guard.data_mut()[..], parent);
    guard.mark_dirty();
    Ok(())
}
