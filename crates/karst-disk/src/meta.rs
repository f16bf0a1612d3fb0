//! Database file meta page (physical page 0).

use crate::bitmap::BITMAP_CAPACITY;
use karst_common::{KarstError, Result, PAGE_SIZE};

/// Maximum number of extents the meta page can describe.
pub const MAX_EXTENTS: usize = (PAGE_SIZE - 8) / 4;

/// Maximum number of logical pages the file can hold.
pub const MAX_VALID_PAGE_ID: u32 = MAX_EXTENTS as u32 * BITMAP_CAPACITY;

/// In-memory mirror of the meta page.
///
/// On-disk layout (little-endian):
/// - `num_allocated_pages`: 4 bytes
/// - `num_extents`: 4 bytes
/// - `extent_used_page[num_extents]`: 4 bytes each
///
/// Invariant: `sum(extent_used_page) == num_allocated_pages` and every entry
/// is at most [`BITMAP_CAPACITY`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskMetaPage {
    /// Total number of allocated logical pages.
    pub num_allocated_pages: u32,
    /// Number of extents currently laid out in the file.
    pub num_extents: u32,
    /// Allocated-page count per extent.
    pub extent_used_page: Vec<u32>,
}

impl DiskMetaPage {
    /// Creates the meta page of a fresh, empty database.
    pub fn new() -> Self {
        Self {
            num_allocated_pages: 0,
            num_extents: 0,
            extent_used_page: Vec::new(),
        }
    }

    /// Serializes the meta page into a full page buffer.
    pub fn to_bytes(&self) -> Box<[u8; PAGE_SIZE]> {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        buf[0..4].copy_from_slice(&self.num_allocated_pages.to_le_bytes());
        buf[4..8].copy_from_slice(&self.num_extents.to_le_bytes());
        for (i, used) in self.extent_used_page.iter().enumerate() {
            let off = 8 + i * 4;
            buf[off..off + 4].copy_from_slice(&used.to_le_bytes());
        }
        buf
    }

    /// Deserializes the meta page from a page buffer.
    ///
    /// A zero-filled buffer (fresh database file) yields an empty meta page.
    pub fn from_bytes(buf: &[u8; PAGE_SIZE]) -> Result<Self> {
        let num_allocated_pages = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let num_extents = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if num_extents as usize > MAX_EXTENTS {
            return Err(KarstError::Corruption {
                page_id: 0,
                reason: format!("meta page claims {} extents", num_extents),
            });
        }

        let mut extent_used_page = Vec::with_capacity(num_extents as usize);
        let mut total = 0u64;
        for i in 0..num_extents as usize {
            let off = 8 + i * 4;
            let used = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
            if used > BITMAP_CAPACITY {
                return Err(KarstError::Corruption {
                    page_id: 0,
                    reason: format!("extent {} claims {} used pages", i, used),
                });
            }
            total += used as u64;
            extent_used_page.push(used);
        }

        if total != num_allocated_pages as u64 {
            return Err(KarstError::Corruption {
                page_id: 0,
                reason: format!(
                    "extent totals {} disagree with allocated count {}",
                    total, num_allocated_pages
                ),
            });
        }

        Ok(Self {
            num_allocated_pages,
            num_extents,
            extent_used_page,
        })
    }
}

impl Default for DiskMetaPage {
    fn default() -> Self {
        Self::new()
    }
}
