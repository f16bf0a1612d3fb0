//! The index roots page: persistent `index_id -> root_page_id` mapping.
//!
//! A single page, shared by every B+ tree in the database, holding one record
//! per index. Trees read their root from here at construction and write it
//! back on every root change.

use karst_buffer::BufferPoolManager;
use karst_common::{KarstError, PageId, Result, PAGE_SIZE};
use std::sync::Arc;

/// Logical page holding the index roots. Claimed by the first allocation on
/// a fresh database.
pub const INDEX_ROOTS_PAGE_ID: PageId = PageId(0);

/// Magic number identifying a valid index roots page.
const ROOTS_MAGIC: u32 = 0x4B52_5354;

const MAGIC_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 4;
const RECORDS_OFFSET: usize = 8;
const RECORD_SIZE: usize = 8;

/// Maximum number of index records the page can hold.
pub const MAX_INDEX_ROOTS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// View over the index roots page bytes.
pub struct IndexRootsView<B> {
    data: B,
}

impl<B: AsRef<[u8]>> IndexRootsView<B> {
    pub fn new(data: B) -> Self {
        Self { data }
    }

    fn magic(&self) -> u32 {
        let d = self.data.as_ref();
        u32::from_le_bytes([
            d[MAGIC_OFFSET],
            d[MAGIC_OFFSET + 1],
            d[MAGIC_OFFSET + 2],
            d[MAGIC_OFFSET + 3],
        ])
    }

    /// Number of records stored.
    pub fn count(&self) -> usize {
        let d = self.data.as_ref();
        u32::from_le_bytes([
            d[COUNT_OFFSET],
            d[COUNT_OFFSET + 1],
            d[COUNT_OFFSET + 2],
            d[COUNT_OFFSET + 3],
        ]) as usize
    }

    /// Fails fast when the page does not carry the expected magic number.
    pub fn validate(&self) -> Result<()> {
        if self.magic() != ROOTS_MAGIC {
            return Err(KarstError::Corruption {
                page_id: INDEX_ROOTS_PAGE_ID.0,
                reason: format!("index roots magic mismatch: {:#010x}", self.magic()),
            });
        }
        Ok(())
    }

    fn record_at(&self, slot: usize) -> (u32, PageId) {
        let off = RECORDS_OFFSET + slot * RECORD_SIZE;
        let d = self.data.as_ref();
        let index_id = u32::from_le_bytes([d[off], d[off + 1], d[off + 2], d[off + 3]]);
        let root = PageId::from_bytes([d[off + 4], d[off + 5], d[off + 6], d[off + 7]]);
        (index_id, root)
    }

    fn slot_of(&self, index_id: u32) -> Option<usize> {
        (0..self.count()).find(|&slot| self.record_at(slot).0 == index_id)
    }

    /// Returns the root page id recorded for `index_id`.
    pub fn get_root(&self, index_id: u32) -> Option<PageId> {
        self.slot_of(index_id).map(|slot| self.record_at(slot).1)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> IndexRootsView<B> {
    /// Initializes an empty roots page.
    pub fn init(&mut self) {
        let d = self.data.as_mut();
        d[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&ROOTS_MAGIC.to_le_bytes());
        d[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
    }

    fn set_count(&mut self, count: usize) {
        self.data.as_mut()[COUNT_OFFSET..COUNT_OFFSET + 4]
            .copy_from_slice(&(count as u32).to_le_bytes());
    }

    fn set_record_at(&mut self, slot: usize, index_id: u32, root: PageId) {
        let off = RECORDS_OFFSET + slot * RECORD_SIZE;
        let d = self.data.as_mut();
        d[off..off + 4].copy_from_slice(&index_id.to_le_bytes());
        d[off + 4..off + 8].copy_from_slice(&root.to_bytes());
    }

    /// Adds a record. Returns false if the id already exists or the page is
    /// full.
    pub fn insert(&mut self, index_id: u32, root: PageId) -> bool {
        if self.slot_of(index_id).is_some() || self.count() == MAX_INDEX_ROOTS {
            return false;
        }
        let slot = self.count();
        self.set_record_at(slot, index_id, root);
        self.set_count(slot + 1);
        true
    }

    /// Updates an existing record. Returns false if the id is absent.
    pub fn update(&mut self, index_id: u32, root: PageId) -> bool {
        match self.slot_of(index_id) {
            Some(slot) => {
                self.set_record_at(slot, index_id, root);
                true
            }
            None => false,
        }
    }

    /// Removes a record. Returns false if the id is absent.
    pub fn remove(&mut self, index_id: u32) -> bool {
        let Some(slot) = self.slot_of(index_id) else {
            return false;
        };
        let count = self.count();
        for s in slot + 1..count {
            let (id, root) = self.record_at(s);
            self.set_record_at(s - 1, id, root);
        }
        self.set_count(count - 1);
        true
    }
}

/// Makes sure the index roots page exists and is valid.
///
/// On a fresh database this claims logical page 0 through the pool's first
/// allocation and writes an empty roots page; otherwise it validates the
/// existing one.
pub fn ensure_index_roots(pool: &Arc<BufferPoolManager>) -> Result<()> {
    if pool.is_page_free(INDEX_ROOTS_PAGE_ID)? {
        let guard = pool.new_page_guard()?;
        if guard.page_id() != INDEX_ROOTS_PAGE_ID {
            return Err(KarstError::Internal(format!(
                "index roots must claim {}, database handed out {}",
                INDEX_ROOTS_PAGE_ID,
                guard.page_id()
            )));
        }
        let mut data = guard.data_mut();
        IndexRootsView::new(&mut data[..]).init();
        drop(data);
        guard.mark_dirty();
        Ok(())
    } else {
        let guard = pool.fetch_guard(INDEX_ROOTS_PAGE_ID)?;
        let data = guard.data();
        IndexRootsView::new(&data[..]).validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_disk::DiskManager;
    use tempfile::tempdir;

    fn fresh_page() -> Box<[u8; PAGE_SIZE]> {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        IndexRootsView::new(&mut buf[..]).init();
        buf
    }

    #[test]
    fn test_init_and_validate() {
        let buf = fresh_page();
        let view = IndexRootsView::new(&buf[..]);
        view.validate().unwrap();
        assert_eq!(view.count(), 0);
        assert_eq!(view.get_root(0), None);
    }

    #[test]
    fn test_zeroed_page_fails_validation() {
        let buf = Box::new([0u8; PAGE_SIZE]);
        assert!(matches!(
            IndexRootsView::new(&buf[..]).validate(),
            Err(KarstError::Corruption { .. })
        ));
    }

    #[test]
    fn test_insert_get_update() {
        let mut buf = fresh_page();
        let mut view = IndexRootsView::new(&mut buf[..]);

        assert!(view.insert(7, PageId(100)));
        assert!(view.insert(8, PageId(200)));
        assert!(!view.insert(7, PageId(300)));

        assert_eq!(view.get_root(7), Some(PageId(100)));
        assert_eq!(view.get_root(8), Some(PageId(200)));
        assert_eq!(view.get_root(9), None);

        assert!(view.update(7, PageId::INVALID));
        assert_eq!(view.get_root(7), Some(PageId::INVALID));
        assert!(!view.update(9, PageId(1)));
    }

    #[test]
    fn test_remove_shifts_records() {
        let mut buf = fresh_page();
        let mut view = IndexRootsView::new(&mut buf[..]);
        view.insert(1, PageId(10));
        view.insert(2, PageId(20));
        view.insert(3, PageId(30));

        assert!(view.remove(2));
        assert!(!view.remove(2));
        assert_eq!(view.count(), 2);
        assert_eq!(view.get_root(1), Some(PageId(10)));
        assert_eq!(view.get_root(3), Some(PageId(30)));
    }

    #[test]
    fn test_full_page_rejects_insert() {
        let mut buf = fresh_page();
        let mut view = IndexRootsView::new(&mut buf[..]);
        for i in 0..MAX_INDEX_ROOTS as u32 {
            assert!(view.insert(i, PageId(i as i32)));
        }
        assert!(!view.insert(u32::MAX, PageId(1)));
    }

    #[test]
    fn test_ensure_index_roots_bootstrap_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roots.db");

        {
            let disk = Arc::new(DiskManager::open(&path).unwrap());
            let pool = Arc::new(BufferPoolManager::new(8, Arc::clone(&disk)));
            ensure_index_roots(&pool).unwrap();
            ensure_index_roots(&pool).unwrap();

            let guard = pool.fetch_guard(INDEX_ROOTS_PAGE_ID).unwrap();
            let mut data = guard.data_mut();
            IndexRootsView::new(&mut data[..]).insert(1, PageId(5));
            drop(data);
            guard.mark_dirty();
            drop(guard);
            pool.flush_all_pages().unwrap();
        }

        let disk = Arc::new(DiskManager::open(&path).unwrap());
        let pool = Arc::new(BufferPoolManager::new(8, disk));
        ensure_index_roots(&pool).unwrap();
        let guard = pool.fetch_guard(INDEX_ROOTS_PAGE_ID).unwrap();
        let data = guard.data();
        assert_eq!(IndexRootsView::new(&data[..]).get_root(1), Some(PageId(5)));
    }
}
