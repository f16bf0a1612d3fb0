//! Buffer pool manager.

use crate::frame::{FrameId, Page};
use crate::replacer::{LruReplacer, Replacer};
use karst_common::{KarstError, PageId, Result, PAGE_SIZE};
use karst_disk::DiskManager;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use sysinfo::System;
use tracing::{error, trace, warn};

/// Buffer pool manager.
///
/// Caches disk pages in a fixed array of frames. Pages are located through
/// the page table, empty frames come from the free list, and eviction
/// victims come from the LRU replacer over unpinned frames. Every fetched or
/// created page is returned pinned; callers release it with
/// [`BufferPoolManager::unpin_page`] or by holding a [`PageGuard`].
pub struct BufferPoolManager {
    /// Number of frames in the pool.
    pool_size: usize,
    /// The frames.
    frames: Vec<Page>,
    /// Maps resident logical pages to their frame.
    page_table: Mutex<HashMap<PageId, FrameId>>,
    /// Frames not holding any page.
    free_list: Mutex<Vec<FrameId>>,
    /// Eviction policy over unpinned frames.
    replacer: LruReplacer,
    /// Backing store.
    disk: Arc<DiskManager>,
}

impl BufferPoolManager {
    /// Creates a buffer pool with `pool_size` frames over `disk`.
    pub fn new(pool_size: usize, disk: Arc<DiskManager>) -> Self {
        let frames: Vec<_> = (0..pool_size).map(|_| Page::new()).collect();
        let free_list: Vec<_> = (0..pool_size).map(|i| FrameId(i as u32)).collect();

        Self {
            pool_size,
            frames,
            page_table: Mutex::new(HashMap::new()),
            free_list: Mutex::new(free_list),
            replacer: LruReplacer::new(pool_size),
            disk,
        }
    }

    /// Creates a buffer pool sized to 25% of available system RAM, with a
    /// floor of 1,000 frames.
    pub fn auto_sized(disk: Arc<DiskManager>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let pool_size = (available_bytes / 4 / PAGE_SIZE).max(1_000);
        Self::new(pool_size, disk)
    }

    /// Returns the number of frames in the pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the number of resident pages.
    pub fn page_count(&self) -> usize {
        self.page_table.lock().len()
    }

    /// Returns true if the page is resident in the pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.lock().contains_key(&page_id)
    }

    #[inline]
    fn frame(&self, frame_id: FrameId) -> &Page {
        &self.frames[frame_id.0 as usize]
    }

    /// Picks a frame to load a page into: free list first, then an eviction
    /// victim. A dirty victim is written back before being handed out, and
    /// its old mapping is removed from the page table.
    fn acquire_frame(&self, table: &mut HashMap<PageId, FrameId>) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop() {
            return Ok(frame_id);
        }

        let victim = self.replacer.victim().ok_or(KarstError::PoolExhausted)?;
        let frame = self.frame(victim);
        let old_page_id = frame.page_id();

        if frame.is_dirty() && old_page_id.is_valid() {
            trace!(%old_page_id, %victim, "writing back dirty page on eviction");
            let data = frame.read_data();
            if let Err(e) = self.disk.write_page(old_page_id, &data) {
                drop(data);
                self.replacer.unpin(victim);
                return Err(e);
            }
            drop(data);
            frame.set_dirty(false);
        }

        if old_page_id.is_valid() {
            table.remove(&old_page_id);
        }
        Ok(victim)
    }

    fn fetch_page_inner(&self, page_id: PageId) -> Result<FrameId> {
        if !page_id.is_valid() {
            return Err(KarstError::Internal(format!(
                "fetch of invalid page id {}",
                page_id
            )));
        }

        let mut table = self.page_table.lock();
        if let Some(&frame_id) = table.get(&page_id) {
            self.frame(frame_id).pin();
            self.replacer.pin(frame_id);
            return Ok(frame_id);
        }

        let frame_id = self.acquire_frame(&mut table)?;
        let frame = self.frame(frame_id);
        frame.reset();
        {
            let mut data = frame.write_data();
            if let Err(e) = self.disk.read_page(page_id, &mut data) {
                drop(data);
                self.free_list.lock().push(frame_id);
                return Err(e);
            }
        }
        frame.set_page_id(page_id);
        frame.pin();
        table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);
        Ok(frame_id)
    }

    /// Fetches a page, pinning it.
    ///
    /// Fails with `PoolExhausted` when the page is not resident and every
    /// frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&Page> {
        let frame_id = self.fetch_page_inner(page_id)?;
        Ok(self.frame(frame_id))
    }

    fn new_page_inner(&self) -> Result<(PageId, FrameId)> {
        let mut table = self.page_table.lock();
        if self.free_list.lock().is_empty() && self.replacer.size() == 0 {
            return Err(KarstError::PoolExhausted);
        }

        let page_id = self.disk.allocate_page()?;
        let frame_id = self.acquire_frame(&mut table)?;
        let frame = self.frame(frame_id);
        frame.reset();
        frame.set_page_id(page_id);
        frame.pin();
        table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);
        Ok((page_id, frame_id))
    }

    /// Allocates a new page on disk and pins it in the pool.
    ///
    /// The caller receives a pinned, zeroed page whose id is newly valid.
    /// Fails with `PoolExhausted` before touching the allocator when every
    /// frame is pinned.
    pub fn new_page(&self) -> Result<(PageId, &Page)> {
        let (page_id, frame_id) = self.new_page_inner()?;
        Ok((page_id, self.frame(frame_id)))
    }

    /// Releases one pin on a page, folding `is_dirty` into its dirty flag.
    ///
    /// Returns false if the page is not resident or was not pinned. The dirty
    /// flag is only ever raised here, never cleared.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let table = self.page_table.lock();
        let Some(&frame_id) = table.get(&page_id) else {
            return false;
        };
        let frame = self.frame(frame_id);

        if is_dirty {
            frame.set_dirty(true);
        }
        if frame.pin_count() == 0 {
            warn!(%page_id, "unpin of page with zero pin count");
            return false;
        }
        if frame.unpin() == 0 {
            self.replacer.unpin(frame_id);
        }
        true
    }

    /// Writes a resident dirty page back to disk and clears its dirty flag.
    ///
    /// Returns true if a write happened. Idempotent.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let table = self.page_table.lock();
        let Some(&frame_id) = table.get(&page_id) else {
            return Ok(false);
        };
        let frame = self.frame(frame_id);

        if !frame.is_dirty() {
            return Ok(false);
        }
        {
            let data = frame.read_data();
            self.disk.write_page(page_id, &data)?;
        }
        frame.set_dirty(false);
        Ok(true)
    }

    /// Flushes every resident dirty page. Returns the number flushed.
    pub fn flush_all_pages(&self) -> Result<usize> {
        let resident: Vec<PageId> = self.page_table.lock().keys().copied().collect();
        let mut flushed = 0;
        for page_id in resident {
            if self.flush_page(page_id)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Removes a resident page from the pool and deallocates it on disk.
    ///
    /// Returns true immediately when the page is not resident (nothing to
    /// do; the disk page is left untouched) and false, leaving all state
    /// unchanged, when it is pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut table = self.page_table.lock();
        let Some(&frame_id) = table.get(&page_id) else {
            return Ok(true);
        };
        let frame = self.frame(frame_id);
        if frame.is_pinned() {
            return Ok(false);
        }
        if frame.is_dirty() {
            let data = frame.read_data();
            self.disk.write_page(page_id, &data)?;
        }
        table.remove(&page_id);
        self.replacer.pin(frame_id);
        frame.reset();
        self.free_list.lock().push(frame_id);
        drop(table);

        self.disk.deallocate_page(page_id)?;
        Ok(true)
    }

    /// Returns true if the logical page is unallocated on disk.
    pub fn is_page_free(&self, page_id: PageId) -> Result<bool> {
        self.disk.is_page_free(page_id)
    }

    /// Returns true when no frame holds a pin. Logs each offender.
    pub fn check_all_unpinned(&self) -> bool {
        let mut all_unpinned = true;
        for frame in &self.frames {
            if frame.pin_count() != 0 {
                error!(
                    page_id = %frame.page_id(),
                    pin_count = frame.pin_count(),
                    "page still pinned"
                );
                all_unpinned = false;
            }
        }
        all_unpinned
    }

    /// Fetches a page behind an RAII pin guard.
    pub fn fetch_guard(self: &Arc<Self>, page_id: PageId) -> Result<PageGuard> {
        let frame_id = self.fetch_page_inner(page_id)?;
        Ok(PageGuard {
            pool: Arc::clone(self),
            page_id,
            frame_id,
            dirty: Cell::new(false),
        })
    }

    /// Allocates a new page behind an RAII pin guard.
    pub fn new_page_guard(self: &Arc<Self>) -> Result<PageGuard> {
        let (page_id, frame_id) = self.new_page_inner()?;
        Ok(PageGuard {
            pool: Arc::clone(self),
            page_id,
            frame_id,
            dirty: Cell::new(false),
        })
    }
}

impl Drop for BufferPoolManager {
    fn drop(&mut self) {
        let _ = self.flush_all_pages();
    }
}

/// RAII pin on a buffered page.
///
/// Holds exactly one pin from creation to drop and accumulates a dirty flag;
/// the drop releases the pin with that flag, so every exit path unpins with
/// `dirty == true` iff the page bytes were mutated through this guard.
pub struct PageGuard {
    pool: Arc<BufferPoolManager>,
    page_id: PageId,
    frame_id: FrameId,
    dirty: Cell<bool>,
}

impl PageGuard {
    /// Returns the pinned page's id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Reads the page bytes.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.pool.frame(self.frame_id).read_data()
    }

    /// Writes the page bytes. Callers that mutate must also
    /// [`PageGuard::mark_dirty`].
    pub fn data_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.pool.frame(self.frame_id).write_data()
    }

    /// Records that the page bytes were mutated.
    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    /// Returns the accumulated dirty flag.
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.dirty.get());
    }
}
