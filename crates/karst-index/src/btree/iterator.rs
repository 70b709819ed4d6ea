//! Forward iteration over the leaf chain.

use super::page::LeafNode;
use super::types::IndexKey;
use karst_buffer::{BufferPoolManager, PageGuard};
use karst_common::Rid;
use parking_lot::RwLockReadGuard;
use std::marker::PhantomData;

/// Lazy ascending cursor over (key, rid) pairs.
///
/// The cursor pins exactly the current leaf, unpinning it when it follows
/// the next-leaf pointer. It holds the shared tree latch for its lifetime,
/// so structure changes wait until iteration finishes; the sequence is
/// finite and non-restartable.
pub struct IndexIterator<'a, K: IndexKey> {
    pool: &'a BufferPoolManager,
    guard: Option<PageGuard<'a>>,
    index: usize,
    _latch: RwLockReadGuard<'a, ()>,
    _key: PhantomData<K>,
}

impl<'a, K: IndexKey> IndexIterator<'a, K> {
    pub(crate) fn new(
        pool: &'a BufferPoolManager,
        latch: RwLockReadGuard<'a, ()>,
        guard: Option<PageGuard<'a>>,
        index: usize,
    ) -> Self {
        Self {
            pool,
            guard,
            index,
            _latch: latch,
            _key: PhantomData,
        }
    }
}

impl<K: IndexKey> Iterator for IndexIterator<'_, K> {
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let guard = self.guard.as_ref()?;

            let step = {
                let mut data = guard.data_mut();
                let leaf = LeafNode::<K>::attach(&mut data[..]).ok()?;
                if self.index < leaf.size() as usize {
                    Ok((leaf.key_at(self.index), leaf.value_at(self.index)))
                } else {
                    Err(leaf.next_page_id())
                }
            };

            match step {
                Ok(item) => {
                    self.index += 1;
                    return Some(item);
                }
                Err(next_page_id) => {
                    // Unpin the exhausted leaf before pinning its successor
                    self.guard = None;
                    if !next_page_id.is_valid() {
                        return None;
                    }
                    self.guard = Some(self.pool.fetch_page(next_page_id).ok()?);
                    self.index = 0;
                }
            }
        }
    }
}
