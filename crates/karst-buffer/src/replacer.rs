//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Marks a frame as the most recently used eviction candidate.
    ///
    /// Re-inserting a frame that is already present refreshes its recency.
    fn insert(&self, frame_id: FrameId);

    /// Removes and returns the least recently used candidate.
    ///
    /// Returns None when no frame is evictable.
    fn victim(&self) -> Option<FrameId>;

    /// Removes a frame from the candidate set, returning whether it was
    /// present.
    fn erase(&self, frame_id: FrameId) -> bool;

    /// Returns the number of eviction candidates.
    fn len(&self) -> usize;

    /// Returns true when no frame is evictable.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sentinel index for list ends.
const NIL: usize = usize::MAX;

struct LruNode<T> {
    value: T,
    prev: usize,
    next: usize,
}

struct LruInner<T> {
    /// Element to arena slot.
    map: HashMap<T, usize>,
    /// Arena of list nodes; slots are recycled via `free`.
    nodes: Vec<LruNode<T>>,
    /// Recycled arena slots.
    free: Vec<usize>,
    /// Most recently inserted element.
    head: usize,
    /// Least recently inserted element, the next victim.
    tail: usize,
}

/// Least-recently-used replacer.
///
/// An arena-backed doubly-linked list ordered by recency of insertion,
/// paired with a map from element to list node. Insert, victim selection,
/// and erase are all O(1) amortized, and victims come out in the exact
/// order of their last insertion.
pub struct LruReplacer<T> {
    inner: Mutex<LruInner<T>>,
}

impl<T: Copy + Eq + Hash> LruReplacer<T> {
    /// Creates an empty replacer.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                nodes: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
            }),
        }
    }

    /// Marks `value` as most recently used, inserting it if absent.
    pub fn insert(&self, value: T) {
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.map.get(&value) {
            Self::unlink(&mut inner, idx);
            Self::link_front(&mut inner, idx);
            return;
        }

        let node = LruNode {
            value,
            prev: NIL,
            next: NIL,
        };
        let idx = match inner.free.pop() {
            Some(slot) => {
                inner.nodes[slot] = node;
                slot
            }
            None => {
                inner.nodes.push(node);
                inner.nodes.len() - 1
            }
        };
        Self::link_front(&mut inner, idx);
        inner.map.insert(value, idx);
    }

    /// Removes and returns the least recently used element.
    pub fn victim(&self) -> Option<T> {
        let mut inner = self.inner.lock();

        let idx = inner.tail;
        if idx == NIL {
            return None;
        }

        let value = inner.nodes[idx].value;
        Self::unlink(&mut inner, idx);
        inner.map.remove(&value);
        inner.free.push(idx);
        Some(value)
    }

    /// Removes `value` if present, returning whether it existed.
    pub fn erase(&self, value: T) -> bool {
        let mut inner = self.inner.lock();

        match inner.map.remove(&value) {
            Some(idx) => {
                Self::unlink(&mut inner, idx);
                inner.free.push(idx);
                true
            }
            None => false,
        }
    }

    /// Returns the number of live elements.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Returns true when empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn link_front(inner: &mut LruInner<T>, idx: usize) {
        let old_head = inner.head;
        inner.nodes[idx].prev = NIL;
        inner.nodes[idx].next = old_head;
        if old_head != NIL {
            inner.nodes[old_head].prev = idx;
        }
        inner.head = idx;
        if inner.tail == NIL {
            inner.tail = idx;
        }
    }

    fn unlink(inner: &mut LruInner<T>, idx: usize) {
        let (prev, next) = {
            let node = &inner.nodes[idx];
            (node.prev, node.next)
        };
        if prev != NIL {
            inner.nodes[prev].next = next;
        } else {
            inner.head = next;
        }
        if next != NIL {
            inner.nodes[next].prev = prev;
        } else {
            inner.tail = prev;
        }
        inner.nodes[idx].prev = NIL;
        inner.nodes[idx].next = NIL;
    }
}

impl<T: Copy + Eq + Hash> Default for LruReplacer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl Replacer for LruReplacer<FrameId> {
    fn insert(&self, frame_id: FrameId) {
        LruReplacer::insert(self, frame_id)
    }

    fn victim(&self) -> Option<FrameId> {
        LruReplacer::victim(self)
    }

    fn erase(&self, frame_id: FrameId) -> bool {
        LruReplacer::erase(self, frame_id)
    }

    fn len(&self) -> usize {
        LruReplacer::len(self)
    }
}
