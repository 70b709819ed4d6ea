//! Buffer pool manager.

use crate::frame::{Frame, FrameId};
use crate::hash_table::ExtendibleHashTable;
use crate::replacer::LruReplacer;
use karst_common::page::{PageId, PAGE_SIZE};
use karst_common::{KarstError, Result};
use karst_disk::DiskManager;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;
use sysinfo::System;
use tracing::debug;

/// Bucket capacity of the page-id directory.
const PAGE_TABLE_BUCKET_SIZE: usize = 8;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_frames: 1024 }
    }
}

/// Write-ahead log hook consumed by the buffer pool.
///
/// Invoked for a dirty page immediately before its bytes are written back,
/// so the log can be forced to stable storage first. The pool attaches no
/// further meaning to the log manager.
pub trait LogManager: Send + Sync {
    /// Forces log records covering `page_id` to stable storage.
    fn flush_for_page(&self, page_id: PageId) -> Result<()>;
}

/// State guarded by the pool-wide mutex.
///
/// Every public pool operation acquires this mutex on entry, so compound
/// sequences (lookup, evict, install) take effect atomically with respect
/// to each other.
struct PoolState {
    /// Frames holding no page.
    free_list: VecDeque<FrameId>,
    /// Unpinned resident frames, in eviction order.
    replacer: LruReplacer<FrameId>,
}

/// Buffer pool manager.
///
/// Mediates all access to disk pages through a fixed array of frames:
/// - page id to frame id mapping via an extendible hash directory
/// - free list for never-used frames
/// - LRU replacement for unpinned resident pages
/// - pin counts as leases that block eviction
///
/// Every frame is on the free list, in the replacer, or pinned, and never
/// in more than one of those states at a time.
pub struct BufferPoolManager {
    /// Array of buffer frames.
    frames: Vec<Frame>,
    /// Page id to frame id directory.
    page_table: ExtendibleHashTable<PageId, FrameId>,
    /// Free list and replacer, behind the pool-wide mutex.
    state: Mutex<PoolState>,
    /// Disk manager for page I/O and id allocation.
    disk: Arc<DiskManager>,
    /// Optional write-ahead log hook.
    log: Option<Arc<dyn LogManager>>,
}

impl BufferPoolManager {
    /// Creates a new buffer pool over the given disk manager.
    pub fn new(config: BufferPoolConfig, disk: Arc<DiskManager>) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| Frame::new(FrameId(i as u32)))
            .collect();
        let free_list: VecDeque<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        Self {
            frames,
            page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
            state: Mutex::new(PoolState {
                free_list,
                replacer: LruReplacer::new(),
            }),
            disk,
            log: None,
        }
    }

    /// Attaches a write-ahead log hook consulted before dirty writes.
    pub fn with_log_manager(mut self, log: Arc<dyn LogManager>) -> Self {
        self.log = Some(log);
        self
    }

    /// Creates a buffer pool sized to 25% of available system RAM, with a
    /// floor of 1,024 frames.
    pub fn auto_sized(disk: Arc<DiskManager>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let num_frames = (available_bytes / 4 / PAGE_SIZE).max(1024);

        Self::new(BufferPoolConfig { num_frames }, disk)
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Returns the number of evictable (resident, unpinned) frames.
    pub fn evictable_count(&self) -> usize {
        self.state.lock().replacer.len()
    }

    /// Checks whether a page is resident.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.find(&page_id).is_some()
    }

    /// Returns the pin count of a resident page.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let frame_id = self.page_table.find(&page_id)?;
        Some(self.frames[frame_id.0 as usize].pin_count())
    }

    /// Returns the dirty flag of a resident page.
    pub fn is_dirty(&self, page_id: PageId) -> Option<bool> {
        let frame_id = self.page_table.find(&page_id)?;
        Some(self.frames[frame_id.0 as usize].is_dirty())
    }

    /// Fetches a page, pinning its frame.
    ///
    /// On a hit the pin count is incremented and the frame leaves the
    /// eviction candidates. On a miss a frame is taken from the free list
    /// or reclaimed from the replacer (writing the victim back when dirty)
    /// and the page is read from disk. Fails with
    /// [`KarstError::BufferPoolFull`] when every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            state.replacer.erase(frame_id);
            return Ok(PageGuard::new(self, page_id, frame));
        }

        let frame_id = self.acquire_frame(&mut state)?;
        let frame = &self.frames[frame_id.0 as usize];

        match self.disk.read_page(page_id) {
            Ok(bytes) => frame.copy_from(&bytes),
            Err(e) => {
                state.free_list.push_back(frame_id);
                return Err(e);
            }
        }

        frame.set_page_id(Some(page_id));
        frame.pin();
        self.page_table.insert(page_id, frame_id);

        Ok(PageGuard::new(self, page_id, frame))
    }

    /// Allocates a fresh page and returns it pinned.
    ///
    /// The new frame starts zeroed and clean; the disk manager has already
    /// extended the file with a zeroed image of the page.
    pub fn new_page(&self) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock();

        let frame_id = self.acquire_frame(&mut state)?;
        let frame = &self.frames[frame_id.0 as usize];

        let page_id = match self.disk.allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                state.free_list.push_back(frame_id);
                return Err(e);
            }
        };

        frame.set_page_id(Some(page_id));
        frame.pin();
        self.page_table.insert(page_id, frame_id);

        Ok(PageGuard::new(self, page_id, frame))
    }

    /// Obtains an empty frame from the free list or by evicting the LRU
    /// victim. The returned frame is reset and unmapped.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = state
            .replacer
            .victim()
            .ok_or(KarstError::BufferPoolFull)?;
        let frame = &self.frames[frame_id.0 as usize];
        debug_assert_eq!(frame.pin_count(), 0, "evicting a pinned frame");

        if let Some(old_page_id) = frame.page_id() {
            if frame.is_dirty() {
                if let Err(e) = self.write_back(old_page_id, frame) {
                    // Leave the victim resident and evictable
                    state.replacer.insert(frame_id);
                    return Err(e);
                }
                debug!(
                    page_id = old_page_id.as_u32(),
                    frame_id = frame_id.0,
                    "dirty victim written back before reuse"
                );
            }
            self.page_table.remove(&old_page_id);
        }

        frame.reset();
        Ok(frame_id)
    }

    /// Writes a frame's bytes to disk, consulting the log hook first.
    fn write_back(&self, page_id: PageId, frame: &Frame) -> Result<()> {
        if let Some(log) = &self.log {
            log.flush_for_page(page_id)?;
        }
        let mut buf = [0u8; PAGE_SIZE];
        frame.copy_to(&mut buf);
        self.disk.write_page(page_id, &buf)?;
        frame.set_dirty(false);
        Ok(())
    }

    /// Releases one pin on a page, OR-ing `dirty` into its dirty flag.
    ///
    /// When the pin count reaches zero the frame becomes an eviction
    /// candidate. Fails when the page is not resident or not pinned.
    pub fn unpin_page(&self, page_id: PageId, dirty: bool) -> Result<()> {
        let mut state = self.state.lock();

        let frame_id = self
            .page_table
            .find(&page_id)
            .ok_or(KarstError::PageNotResident { page_id })?;
        let frame = &self.frames[frame_id.0 as usize];

        if frame.pin_count() == 0 {
            return Err(KarstError::PageNotPinned { page_id });
        }

        if dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            state.replacer.insert(frame_id);
        }
        Ok(())
    }

    /// Writes a resident page to disk and clears its dirty flag.
    ///
    /// The pin count is unchanged. Fails when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let _state = self.state.lock();

        let frame_id = self
            .page_table
            .find(&page_id)
            .ok_or(KarstError::PageNotResident { page_id })?;
        self.write_back(page_id, &self.frames[frame_id.0 as usize])
    }

    /// Writes every dirty resident page to disk.
    ///
    /// Returns the number of pages written.
    pub fn flush_all(&self) -> Result<usize> {
        let _state = self.state.lock();

        let mut flushed = 0;
        for frame in &self.frames {
            if let Some(page_id) = frame.page_id() {
                if frame.is_dirty() {
                    self.write_back(page_id, frame)?;
                    flushed += 1;
                }
            }
        }
        Ok(flushed)
    }

    /// Deletes a page from the pool and releases its id on disk.
    ///
    /// A non-resident page is simply deallocated. A resident unpinned page
    /// is removed from the pool and its frame returned to the free list.
    /// Fails with [`KarstError::PagePinned`] while any pin is held.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock();

        let frame_id = match self.page_table.find(&page_id) {
            None => return self.disk.deallocate_page(page_id),
            Some(frame_id) => frame_id,
        };
        let frame = &self.frames[frame_id.0 as usize];

        if frame.is_pinned() {
            return Err(KarstError::PagePinned { page_id });
        }

        state.replacer.erase(frame_id);
        self.page_table.remove(&page_id);
        frame.reset();
        state.free_list.push_back(frame_id);

        self.disk.deallocate_page(page_id)
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();

        let mut resident = 0;
        let mut pinned = 0;
        let mut dirty = 0;
        for frame in &self.frames {
            if frame.page_id().is_some() {
                resident += 1;
                if frame.is_pinned() {
                    pinned += 1;
                }
                if frame.is_dirty() {
                    dirty += 1;
                }
            }
        }

        BufferPoolStats {
            total_frames: self.frames.len(),
            free_frames: state.free_list.len(),
            resident_pages: resident,
            pinned_pages: pinned,
            dirty_pages: dirty,
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of frames holding no page.
    pub free_frames: usize,
    /// Number of frames holding a page.
    pub resident_pages: usize,
    /// Number of resident pages with at least one pin.
    pub pinned_pages: usize,
    /// Number of resident pages whose bytes differ from disk.
    pub dirty_pages: usize,
}

/// RAII lease on a pinned page.
///
/// Holding a guard keeps the page resident; dropping it releases exactly
/// one pin on every exit path, carrying the accumulated dirty flag into
/// the unpin.
pub struct PageGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    frame: &'a Frame,
    dirty: Cell<bool>,
}

impl<'a> PageGuard<'a> {
    fn new(pool: &'a BufferPoolManager, page_id: PageId, frame: &'a Frame) -> Self {
        Self {
            pool,
            page_id,
            frame,
            dirty: Cell::new(false),
        }
    }

    /// Returns the pinned page's id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns read access to the page bytes.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.read_data()
    }

    /// Returns write access to the page bytes.
    ///
    /// Mutating the bytes does not mark the page dirty by itself; callers
    /// record intent with [`PageGuard::mark_dirty`].
    pub fn data_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.write_data()
    }

    /// Records that this lease modified the page.
    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        // Cannot fail while the guard holds its pin
        let _ = self.pool.unpin_page(self.page_id, self.dirty.get());
    }
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id)
            .field("dirty", &self.dirty.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_disk::DiskManagerConfig;
    use parking_lot::Mutex as PlMutex;
    use tempfile::tempdir;

    fn create_test_pool(num_frames: usize) -> (Arc<BufferPoolManager>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(
            DiskManager::new(DiskManagerConfig {
                data_dir: dir.path().to_path_buf(),
                fsync_enabled: false,
            })
            .unwrap(),
        );
        let pool = Arc::new(BufferPoolManager::new(
            BufferPoolConfig { num_frames },
            disk,
        ));
        (pool, dir)
    }

    #[test]
    fn test_pool_new() {
        let (pool, _dir) = create_test_pool(10);

        assert_eq!(pool.num_frames(), 10);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.evictable_count(), 0);
    }

    #[test]
    fn test_pool_new_page_pins() {
        let (pool, _dir) = create_test_pool(10);

        let guard = pool.new_page().unwrap();
        let page_id = guard.page_id();

        assert!(pool.contains(page_id));
        assert_eq!(pool.pin_count(page_id), Some(1));
        assert_eq!(pool.free_count(), 9);

        drop(guard);
        assert_eq!(pool.pin_count(page_id), Some(0));
        assert_eq!(pool.evictable_count(), 1);
    }

    #[test]
    fn test_pool_fetch_hit_increments_pin() {
        let (pool, _dir) = create_test_pool(10);

        let g1 = pool.new_page().unwrap();
        let page_id = g1.page_id();

        let g2 = pool.fetch_page(page_id).unwrap();
        assert_eq!(pool.pin_count(page_id), Some(2));

        drop(g1);
        assert_eq!(pool.pin_count(page_id), Some(1));
        drop(g2);
        assert_eq!(pool.pin_count(page_id), Some(0));
    }

    #[test]
    fn test_pool_fetch_nonexistent_page() {
        let (pool, _dir) = create_test_pool(10);

        let result = pool.fetch_page(PageId(99));
        assert!(matches!(result, Err(KarstError::PageNotFound { .. })));
        // The frame taken for the miss went back to the free list
        assert_eq!(pool.free_count(), 10);
    }

    #[test]
    fn test_pool_dirty_data_survives_eviction() {
        let (pool, _dir) = create_test_pool(1);

        let page_id = {
            let guard = pool.new_page().unwrap();
            guard.data_mut()[0] = 0xAB;
            guard.mark_dirty();
            guard.page_id()
        };

        // Evict by claiming the only frame for another page
        let other = pool.new_page().unwrap().page_id();
        assert!(!pool.contains(page_id));
        assert!(pool.contains(other));

        // The dirty victim was written back, so a re-fetch sees the bytes
        let guard = pool.fetch_page(page_id).unwrap();
        assert_eq!(guard.data()[0], 0xAB);
    }

    #[test]
    fn test_pool_clean_victim_not_written() {
        let (pool, _dir) = create_test_pool(2);

        let clean = {
            let guard = pool.new_page().unwrap();
            guard.data_mut()[0] = 0x77;
            // No mark_dirty: the write is deliberately lost
            guard.page_id()
        };
        let dirty = {
            let guard = pool.new_page().unwrap();
            guard.data_mut()[0] = 0x99;
            guard.mark_dirty();
            guard.page_id()
        };

        // Two more pages evict both; clean was LRU and is evicted first
        let g3 = pool.new_page().unwrap();
        let g4 = pool.new_page().unwrap();
        assert!(!pool.contains(clean));
        assert!(!pool.contains(dirty));
        drop(g3);
        drop(g4);

        let g = pool.fetch_page(clean).unwrap();
        assert_eq!(g.data()[0], 0, "clean eviction must not write back");
        drop(g);
        let g = pool.fetch_page(dirty).unwrap();
        assert_eq!(g.data()[0], 0x99);
    }

    #[test]
    fn test_pool_eviction_order_is_lru() {
        let (pool, _dir) = create_test_pool(3);

        let p1 = pool.new_page().unwrap().page_id();
        let p2 = pool.new_page().unwrap().page_id();
        let p3 = pool.new_page().unwrap().page_id();

        // Touch p1 so p2 becomes the LRU victim
        drop(pool.fetch_page(p1).unwrap());

        let _g = pool.new_page().unwrap();
        assert!(pool.contains(p1));
        assert!(!pool.contains(p2));
        assert!(pool.contains(p3));
    }

    #[test]
    fn test_pool_full_when_all_pinned() {
        let (pool, _dir) = create_test_pool(2);

        let _g1 = pool.new_page().unwrap();
        let _g2 = pool.new_page().unwrap();

        assert!(matches!(pool.new_page(), Err(KarstError::BufferPoolFull)));
        assert!(matches!(
            pool.fetch_page(PageId(50)),
            Err(KarstError::BufferPoolFull)
        ));

        drop(_g1);
        assert!(pool.new_page().is_ok());
    }

    #[test]
    fn test_pool_unpin_errors() {
        let (pool, _dir) = create_test_pool(2);

        assert!(matches!(
            pool.unpin_page(PageId(7), false),
            Err(KarstError::PageNotResident { .. })
        ));

        let page_id = pool.new_page().unwrap().page_id();
        // The guard already released its pin
        assert!(matches!(
            pool.unpin_page(page_id, false),
            Err(KarstError::PageNotPinned { .. })
        ));
    }

    #[test]
    fn test_pool_unpin_dirty_is_sticky() {
        let (pool, _dir) = create_test_pool(2);

        let guard = pool.new_page().unwrap();
        let page_id = guard.page_id();
        guard.mark_dirty();
        drop(guard);
        assert_eq!(pool.is_dirty(page_id), Some(true));

        // A later clean unpin must not clear the flag
        drop(pool.fetch_page(page_id).unwrap());
        assert_eq!(pool.is_dirty(page_id), Some(true));
    }

    #[test]
    fn test_pool_flush_page() {
        let (pool, _dir) = create_test_pool(2);

        let guard = pool.new_page().unwrap();
        let page_id = guard.page_id();
        guard.data_mut()[10] = 0x42;
        guard.mark_dirty();
        drop(guard);

        pool.flush_page(page_id).unwrap();
        assert_eq!(pool.is_dirty(page_id), Some(false));

        assert!(matches!(
            pool.flush_page(PageId(99)),
            Err(KarstError::PageNotResident { .. })
        ));
    }

    #[test]
    fn test_pool_flush_then_fetch_identical_bytes() {
        let (pool, _dir) = create_test_pool(2);

        let guard = pool.new_page().unwrap();
        let page_id = guard.page_id();
        for i in 0..64 {
            guard.data_mut()[i] = i as u8;
        }
        guard.mark_dirty();
        drop(guard);

        pool.flush_page(page_id).unwrap();

        // Evict, then re-fetch from disk
        let _g1 = pool.new_page().unwrap();
        let _g2 = pool.new_page().unwrap();
        assert!(!pool.contains(page_id));
        drop(_g1);

        let guard = pool.fetch_page(page_id).unwrap();
        for i in 0..64 {
            assert_eq!(guard.data()[i], i as u8);
        }
    }

    #[test]
    fn test_pool_flush_all() {
        let (pool, _dir) = create_test_pool(8);

        for _ in 0..5 {
            let guard = pool.new_page().unwrap();
            guard.mark_dirty();
        }
        let _clean = pool.new_page().unwrap();

        assert_eq!(pool.flush_all().unwrap(), 5);
        assert_eq!(pool.stats().dirty_pages, 0);
    }

    #[test]
    fn test_pool_delete_page() {
        let (pool, _dir) = create_test_pool(4);

        let page_id = pool.new_page().unwrap().page_id();
        assert!(pool.contains(page_id));

        pool.delete_page(page_id).unwrap();
        assert!(!pool.contains(page_id));
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.evictable_count(), 0);
    }

    #[test]
    fn test_pool_delete_pinned_page_fails() {
        let (pool, _dir) = create_test_pool(4);

        let guard = pool.new_page().unwrap();
        let page_id = guard.page_id();

        assert!(matches!(
            pool.delete_page(page_id),
            Err(KarstError::PagePinned { .. })
        ));
        assert!(pool.contains(page_id));

        drop(guard);
        assert!(pool.delete_page(page_id).is_ok());
    }

    #[test]
    fn test_pool_delete_non_resident_page() {
        let (pool, _dir) = create_test_pool(1);

        let page_id = pool.new_page().unwrap().page_id();
        // Evict it
        let _g = pool.new_page().unwrap();
        assert!(!pool.contains(page_id));

        pool.delete_page(page_id).unwrap();
    }

    #[test]
    fn test_pool_frame_accounting_invariant() {
        let (pool, _dir) = create_test_pool(4);

        let g1 = pool.new_page().unwrap();
        let _g2 = pool.new_page().unwrap();
        let p3 = pool.new_page().unwrap().page_id();
        drop(pool.fetch_page(p3).unwrap());

        // free + evictable + pinned == pool size
        let stats = pool.stats();
        assert_eq!(
            stats.free_frames + pool.evictable_count() + stats.pinned_pages,
            pool.num_frames()
        );
        assert_eq!(stats.pinned_pages, 2);

        drop(g1);
        let stats = pool.stats();
        assert_eq!(
            stats.free_frames + pool.evictable_count() + stats.pinned_pages,
            pool.num_frames()
        );
    }

    #[test]
    fn test_pool_stats() {
        let (pool, _dir) = create_test_pool(10);

        let _pinned = pool.new_page().unwrap();
        let dirty = pool.new_page().unwrap();
        dirty.mark_dirty();
        drop(dirty);

        let stats = pool.stats();
        assert_eq!(stats.total_frames, 10);
        assert_eq!(stats.free_frames, 8);
        assert_eq!(stats.resident_pages, 2);
        assert_eq!(stats.pinned_pages, 1);
        assert_eq!(stats.dirty_pages, 1);
    }

    struct RecordingLog {
        flushed: PlMutex<Vec<PageId>>,
    }

    impl LogManager for RecordingLog {
        fn flush_for_page(&self, page_id: PageId) -> Result<()> {
            self.flushed.lock().push(page_id);
            Ok(())
        }
    }

    #[test]
    fn test_pool_log_hook_runs_before_write_back() {
        let dir = tempdir().unwrap();
        let disk = Arc::new(
            DiskManager::new(DiskManagerConfig {
                data_dir: dir.path().to_path_buf(),
                fsync_enabled: false,
            })
            .unwrap(),
        );
        let log = Arc::new(RecordingLog {
            flushed: PlMutex::new(Vec::new()),
        });
        let pool =
            BufferPoolManager::new(BufferPoolConfig { num_frames: 1 }, disk).with_log_manager(log.clone());

        let page_id = {
            let guard = pool.new_page().unwrap();
            guard.mark_dirty();
            guard.page_id()
        };

        // Eviction of the dirty page must consult the log first
        let _g = pool.new_page().unwrap();
        assert_eq!(log.flushed.lock().as_slice(), &[page_id]);
    }
}
