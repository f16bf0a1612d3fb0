//! Disk manager for page-level file I/O.

use crate::bitmap::{BitmapPage, BITMAP_CAPACITY};
use crate::meta::{DiskMetaPage, MAX_VALID_PAGE_ID};
use karst_common::{KarstError, PageId, Result, PAGE_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

/// Physical page holding the meta page.
const META_PHYSICAL_PAGE: u64 = 0;

/// Manages the single database file behind the buffer pool.
///
/// The file is organized as the meta page followed by extents of
/// `1 + BITMAP_CAPACITY` physical pages: one allocation bitmap, then the data
/// pages it tracks. Callers address pages by dense logical id; the mapping to
/// physical offsets is internal.
pub struct DiskManager {
    /// Path of the database file.
    path: PathBuf,
    /// The file handle.
    file: Mutex<File>,
    /// Cached meta page, persisted on flush and close.
    meta: Mutex<DiskMetaPage>,
    /// Set once the file has been closed.
    closed: AtomicBool,
}

impl DiskManager {
    /// Opens a database file, creating it (and parent directories) if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut buf = Box::new([0u8; PAGE_SIZE]);
        Self::read_physical_into(&file, META_PHYSICAL_PAGE, &mut buf)?;
        let meta = DiskMetaPage::from_bytes(&buf)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            meta: Mutex::new(meta),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of allocated logical pages.
    pub fn num_allocated_pages(&self) -> u32 {
        self.meta.lock().num_allocated_pages
    }

    /// Physical page index of the bitmap of extent `extent`.
    fn bitmap_physical(extent: u32) -> u64 {
        extent as u64 * (1 + BITMAP_CAPACITY as u64) + 1
    }

    /// Physical page index of a logical data page.
    fn data_physical(logical: PageId) -> u64 {
        let extent = logical.0 as u64 / BITMAP_CAPACITY as u64;
        let offset = logical.0 as u64 % BITMAP_CAPACITY as u64;
        extent * (1 + BITMAP_CAPACITY as u64) + 2 + offset
    }

    /// Allocates a logical page and returns its id.
    ///
    /// Scans the extent table first-fit, appending a fresh extent when every
    /// existing one is full. Fails with `OutOfSpace` once the extent table
    /// itself is exhausted.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut meta = self.meta.lock();
        if meta.num_allocated_pages == MAX_VALID_PAGE_ID {
            return Err(KarstError::OutOfSpace);
        }

        let mut extent = meta.num_extents;
        for (i, used) in meta.extent_used_page.iter().enumerate() {
            if *used < BITMAP_CAPACITY {
                extent = i as u32;
                break;
            }
        }

        let mut bitmap = if extent < meta.num_extents {
            let mut buf = Box::new([0u8; PAGE_SIZE]);
            self.read_physical(Self::bitmap_physical(extent), &mut buf)?;
            BitmapPage::from_bytes(&buf)
        } else {
            meta.num_extents += 1;
            meta.extent_used_page.push(0);
            BitmapPage::new()
        };

        let offset = bitmap.allocate().ok_or_else(|| {
            KarstError::Internal(format!("extent {} full despite meta counters", extent))
        })?;

        meta.num_allocated_pages += 1;
        meta.extent_used_page[extent as usize] += 1;
        self.write_physical(Self::bitmap_physical(extent), &bitmap.to_bytes())?;

        Ok(PageId((extent * BITMAP_CAPACITY + offset) as i32))
    }

    /// Frees a logical page. No-op when the page is already free.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        if !page_id.is_valid() {
            return Err(KarstError::Internal(format!(
                "deallocate of invalid page id {}",
                page_id
            )));
        }

        let mut meta = self.meta.lock();
        let extent = page_id.0 as u32 / BITMAP_CAPACITY;
        let offset = page_id.0 as u32 % BITMAP_CAPACITY;
        if extent >= meta.num_extents {
            return Ok(());
        }

        let mut buf = Box::new([0u8; PAGE_SIZE]);
        self.read_physical(Self::bitmap_physical(extent), &mut buf)?;
        let mut bitmap = BitmapPage::from_bytes(&buf);

        if !bitmap.deallocate(offset) {
            return Ok(());
        }

        meta.num_allocated_pages -= 1;
        meta.extent_used_page[extent as usize] -= 1;
        self.write_physical(Self::bitmap_physical(extent), &bitmap.to_bytes())
    }

    /// Returns true if the logical page is unallocated.
    pub fn is_page_free(&self, page_id: PageId) -> Result<bool> {
        if !page_id.is_valid() {
            return Ok(true);
        }

        let meta = self.meta.lock();
        let extent = page_id.0 as u32 / BITMAP_CAPACITY;
        let offset = page_id.0 as u32 % BITMAP_CAPACITY;
        if extent >= meta.num_extents {
            return Ok(true);
        }

        let mut buf = Box::new([0u8; PAGE_SIZE]);
        self.read_physical(Self::bitmap_physical(extent), &mut buf)?;
        Ok(BitmapPage::from_bytes(&buf).is_free(offset))
    }

    /// Reads a logical page into `buf`. Reads past the end of the file
    /// zero-fill, so a freshly allocated page reads back as all zeroes.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        if !page_id.is_valid() {
            return Err(KarstError::Internal(format!(
                "read of invalid page id {}",
                page_id
            )));
        }
        self.read_physical(Self::data_physical(page_id), buf)
    }

    /// Writes a logical page from `buf`.
    pub fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        if !page_id.is_valid() {
            return Err(KarstError::Internal(format!(
                "write of invalid page id {}",
                page_id
            )));
        }
        self.write_physical(Self::data_physical(page_id), buf)
    }

    fn read_physical(&self, physical: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let file = self.file.lock();
        Self::read_physical_into(&file, physical, buf)
    }

    fn read_physical_into(mut file: &File, physical: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        file.seek(SeekFrom::Start(physical * PAGE_SIZE as u64))?;
        let mut total = 0;
        while total < PAGE_SIZE {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        // Short reads happen for pages beyond the current file length
        buf[total..].fill(0);
        Ok(())
    }

    fn write_physical(&self, physical: u64, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(physical * PAGE_SIZE as u64))?;
        if let Err(e) = file.write_all(buf) {
            error!(physical, error = %e, "page write failed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Persists the meta page and syncs the file.
    pub fn flush(&self) -> Result<()> {
        let meta = self.meta.lock();
        self.write_physical(META_PHYSICAL_PAGE, &meta.to_bytes())?;
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Flushes and closes the file. Subsequent calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.flush()
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let dm = DiskManager::open(dir.path().join("test.db")).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_open_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("new.db");
        let dm = DiskManager::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(dm.num_allocated_pages(), 0);
    }

    #[test]
    fn test_allocate_sequential_ids() {
        let (dm, _dir) = create_test_disk_manager();

        for expected in 0..5 {
            assert_eq!(dm.allocate_page().unwrap(), PageId(expected));
        }
        assert_eq!(dm.num_allocated_pages(), 5);
    }

    #[test]
    fn test_deallocate_then_reallocate() {
        let (dm, _dir) = create_test_disk_manager();

        for _ in 0..5 {
            dm.allocate_page().unwrap();
        }
        dm.deallocate_page(PageId(2)).unwrap();
        assert_eq!(dm.num_allocated_pages(), 4);
        assert!(dm.is_page_free(PageId(2)).unwrap());

        // First-fit hands the freed id back out
        assert_eq!(dm.allocate_page().unwrap(), PageId(2));
        assert!(!dm.is_page_free(PageId(2)).unwrap());
    }

    #[test]
    fn test_deallocate_free_page_is_noop() {
        let (dm, _dir) = create_test_disk_manager();
        dm.allocate_page().unwrap();

        dm.deallocate_page(PageId(3)).unwrap();
        dm.deallocate_page(PageId(100_000)).unwrap();
        assert_eq!(dm.num_allocated_pages(), 1);
    }

    #[test]
    fn test_is_page_free_unallocated_extent() {
        let (dm, _dir) = create_test_disk_manager();
        assert!(dm.is_page_free(PageId(0)).unwrap());
        assert!(dm
            .is_page_free(PageId(BITMAP_CAPACITY as i32 * 3))
            .unwrap());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (dm, _dir) = create_test_disk_manager();
        let page_id = dm.allocate_page().unwrap();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[100] = 0xCD;
        data[PAGE_SIZE - 1] = 0xEF;
        dm.write_page(page_id, &data).unwrap();

        let mut read_back = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read_back).unwrap();
        assert_eq!(read_back[0], 0xAB);
        assert_eq!(read_back[100], 0xCD);
        assert_eq!(read_back[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_read_unwritten_page_is_zeroed() {
        let (dm, _dir) = create_test_disk_manager();
        let page_id = dm.allocate_page().unwrap();

        let mut buf = [0xFFu8; PAGE_SIZE];
        dm.read_page(page_id, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pages_do_not_alias() {
        let (dm, _dir) = create_test_disk_manager();
        let a = dm.allocate_page().unwrap();
        let b = dm.allocate_page().unwrap();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0x11;
        dm.write_page(a, &data).unwrap();
        data[0] = 0x22;
        dm.write_page(b, &data).unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        dm.read_page(a, &mut buf).unwrap();
        assert_eq!(buf[0], 0x11);
        dm.read_page(b, &mut buf).unwrap();
        assert_eq!(buf[0], 0x22);
    }

    #[test]
    fn test_read_invalid_page_id() {
        let (dm, _dir) = create_test_disk_manager();
        let mut buf = [0u8; PAGE_SIZE];
        assert!(dm.read_page(PageId::INVALID, &mut buf).is_err());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let page_id;

        {
            let dm = DiskManager::open(&path).unwrap();
            page_id = dm.allocate_page().unwrap();
            dm.allocate_page().unwrap();

            let mut data = [0u8; PAGE_SIZE];
            data[7] = 0x99;
            dm.write_page(page_id, &data).unwrap();
            dm.close().unwrap();
        }

        {
            let dm = DiskManager::open(&path).unwrap();
            assert_eq!(dm.num_allocated_pages(), 2);
            assert!(!dm.is_page_free(page_id).unwrap());

            let mut buf = [0u8; PAGE_SIZE];
            dm.read_page(page_id, &mut buf).unwrap();
            assert_eq!(buf[7], 0x99);

            // Allocation continues after the existing pages
            assert_eq!(dm.allocate_page().unwrap(), PageId(2));
        }
    }

    #[test]
    fn test_drop_persists_meta() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drop.db");
        {
            let dm = DiskManager::open(&path).unwrap();
            dm.allocate_page().unwrap();
            dm.allocate_page().unwrap();
            dm.allocate_page().unwrap();
        }
        let dm = DiskManager::open(&path).unwrap();
        assert_eq!(dm.num_allocated_pages(), 3);
    }

    #[test]
    fn test_allocate_across_extent_boundary() {
        let (dm, _dir) = create_test_disk_manager();

        // Fill extent 0 entirely, then one page of extent 1
        for i in 0..BITMAP_CAPACITY {
            assert_eq!(dm.allocate_page().unwrap(), PageId(i as i32));
        }
        let first_of_second = dm.allocate_page().unwrap();
        assert_eq!(first_of_second, PageId(BITMAP_CAPACITY as i32));

        // The pages land in distinct physical slots
        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0x42;
        dm.write_page(first_of_second, &data).unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        dm.read_page(PageId(BITMAP_CAPACITY as i32 - 1), &mut buf)
            .unwrap();
        assert_eq!(buf[0], 0);

        // Deallocating in extent 0 makes first-fit return there
        dm.deallocate_page(PageId(10)).unwrap();
        assert_eq!(dm.allocate_page().unwrap(), PageId(10));
    }
}
