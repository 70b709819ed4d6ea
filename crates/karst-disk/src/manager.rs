//! Disk manager for page-level file I/O.

use karst_common::page::{PageId, PAGE_SIZE};
use karst_common::{KarstError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Name of the single data file inside the data directory.
const DATA_FILE: &str = "karst.db";

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for the data file.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

/// Manages reading and writing pages to the data file.
///
/// Pages are addressed by their [`PageId`] as a direct offset into the
/// file. Deallocated ids are kept in an in-memory free list and handed out
/// again by [`DiskManager::allocate_page`]; the file itself never shrinks.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// File handle and allocation state.
    inner: Mutex<DiskInner>,
}

struct DiskInner {
    /// The open data file.
    file: File,
    /// Number of pages the file currently holds.
    num_pages: u32,
    /// Ids released by `deallocate_page`, available for reuse.
    free_pages: Vec<PageId>,
}

impl DiskManager {
    /// Creates a new disk manager, opening or creating the data file.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let path = config.data_dir.join(DATA_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            config,
            inner: Mutex::new(DiskInner {
                file,
                num_pages,
                free_pages: Vec::new(),
            }),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Reads a page from disk.
    pub fn read_page(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
        let mut inner = self.inner.lock();

        if !page_id.is_valid() || page_id.0 >= inner.num_pages {
            return Err(KarstError::PageNotFound { page_id });
        }

        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;

        let mut buffer = [0u8; PAGE_SIZE];
        inner.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Writes a page to disk.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock();

        if !page_id.is_valid() {
            return Err(KarstError::PageNotFound { page_id });
        }

        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(data)?;

        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        // Update page count if the write extended the file
        if page_id.0 >= inner.num_pages {
            inner.num_pages = page_id.0 + 1;
        }

        Ok(())
    }

    /// Allocates a page id, reusing a deallocated one when available.
    ///
    /// The allocated page starts zeroed on disk, whether it is fresh or a
    /// reused id whose previous contents must not resurface.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();

        let page_id = match inner.free_pages.pop() {
            Some(page_id) => page_id,
            None => PageId(inner.num_pages),
        };

        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&[0u8; PAGE_SIZE])?;

        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        if page_id.0 >= inner.num_pages {
            inner.num_pages = page_id.0 + 1;
        }

        Ok(page_id)
    }

    /// Releases a page id for later reuse.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();

        if !page_id.is_valid() || page_id.0 >= inner.num_pages {
            return Err(KarstError::PageNotFound { page_id });
        }

        if !inner.free_pages.contains(&page_id) {
            inner.free_pages.push(page_id);
        }

        Ok(())
    }

    /// Returns the number of pages in the data file.
    pub fn num_pages(&self) -> u32 {
        self.inner.lock().num_pages
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.inner.lock().file.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        };
        let dm = DiskManager::new(config).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_disk_manager_new() {
        let (dm, _dir) = create_test_disk_manager();
        assert!(dm.data_dir().exists());
        assert_eq!(dm.num_pages(), 0);
    }

    #[test]
    fn test_disk_manager_allocate_page() {
        let (dm, _dir) = create_test_disk_manager();

        assert_eq!(dm.allocate_page().unwrap(), PageId(0));
        assert_eq!(dm.allocate_page().unwrap(), PageId(1));
        assert_eq!(dm.num_pages(), 2);
    }

    #[test]
    fn test_disk_manager_write_read() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[100] = 0xCD;
        data[PAGE_SIZE - 1] = 0xEF;
        dm.write_page(page_id, &data).unwrap();

        let read_data = dm.read_page(page_id).unwrap();
        assert_eq!(read_data[0], 0xAB);
        assert_eq!(read_data[100], 0xCD);
        assert_eq!(read_data[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_disk_manager_read_unallocated() {
        let (dm, _dir) = create_test_disk_manager();

        let result = dm.read_page(PageId(5));
        assert!(matches!(
            result,
            Err(KarstError::PageNotFound {
                page_id: PageId(5)
            })
        ));

        let result = dm.read_page(PageId::INVALID);
        assert!(matches!(result, Err(KarstError::PageNotFound { .. })));
    }

    #[test]
    fn test_disk_manager_fresh_page_zeroed() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();
        let data = dm.read_page(page_id).unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disk_manager_deallocate_reuse() {
        let (dm, _dir) = create_test_disk_manager();

        let p0 = dm.allocate_page().unwrap();
        let p1 = dm.allocate_page().unwrap();

        dm.deallocate_page(p0).unwrap();
        // Double deallocation is absorbed
        dm.deallocate_page(p0).unwrap();

        // Reuse the freed id before extending the file
        assert_eq!(dm.allocate_page().unwrap(), p0);
        assert_eq!(dm.allocate_page().unwrap(), PageId(p1.0 + 1));
    }

    #[test]
    fn test_disk_manager_reused_page_is_zeroed() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();
        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xFF;
        dm.write_page(page_id, &data).unwrap();

        dm.deallocate_page(page_id).unwrap();
        let reused = dm.allocate_page().unwrap();
        assert_eq!(reused, page_id);
        assert!(dm.read_page(reused).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disk_manager_deallocate_unallocated() {
        let (dm, _dir) = create_test_disk_manager();

        assert!(dm.deallocate_page(PageId(3)).is_err());
    }

    #[test]
    fn test_disk_manager_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        };

        let page_id;
        {
            let dm = DiskManager::new(config.clone()).unwrap();
            page_id = dm.allocate_page().unwrap();
            let mut data = [0u8; PAGE_SIZE];
            data[10] = 0x42;
            dm.write_page(page_id, &data).unwrap();
            dm.flush().unwrap();
        }

        let dm = DiskManager::new(config).unwrap();
        assert_eq!(dm.num_pages(), 1);
        let data = dm.read_page(page_id).unwrap();
        assert_eq!(data[10], 0x42);
    }
}
