//! Forward iteration over the linked leaf chain.

use crate::node::{BTreeNode, LeafNode};
use crate::tree::BPlusTree;
use bytes::Bytes;
use karst_buffer::{BufferPoolManager, PageGuard};
use karst_common::{Result, RowId};
use std::sync::Arc;
use tracing::error;

/// Forward, single-pass iterator over a B+ tree's entries in key order.
///
/// Pins exactly the leaf it is positioned on; advancing past a leaf's last
/// slot releases it and follows `next_page_id`. Dropping the iterator
/// releases the current pin. Mutating the tree while an iterator is live is
/// undefined.
pub struct IndexIterator {
    pool: Arc<BufferPoolManager>,
    /// Current leaf, `None` once the chain is exhausted.
    leaf: Option<PageGuard>,
    /// Next slot to yield within the current leaf.
    slot: usize,
}

impl IndexIterator {
    pub(crate) fn new(pool: Arc<BufferPoolManager>, leaf: Option<PageGuard>, slot: usize) -> Self {
        Self { pool, leaf, slot }
    }

    /// Returns true once the iterator has passed the last entry.
    pub fn is_exhausted(&self) -> bool {
        self.leaf.is_none()
    }
}

impl Iterator for IndexIterator {
    type Item = (Bytes, RowId);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let guard = self.leaf.as_ref()?;
            let (size, next_page_id) = {
                let data = guard.data();
                let node = LeafNode::new(&data[..]);
                (node.size() as usize, node.next_page_id())
            };

            if self.slot < size {
                let item = {
                    let data = guard.data();
                    let node = LeafNode::new(&data[..]);
                    let (key, row_id) = node.item_at(self.slot);
                    (Bytes::copy_from_slice(key), row_id)
                };
                self.slot += 1;
                return Some(item);
            }

            // Move to the next leaf, releasing the current pin first.
            self.leaf = None;
            self.slot = 0;
            if !next_page_id.is_valid() {
                return None;
            }
            match self.pool.fetch_guard(next_page_id) {
                Ok(next) => self.leaf = Some(next),
                Err(e) => {
                    error!(%next_page_id, error = %e, "leaf chain fetch failed");
                    return None;
                }
            }
        }
    }
}

impl BPlusTree {
    /// Iterates over every entry in ascending key order.
    pub fn iter(&self) -> Result<IndexIterator> {
        if self.is_empty() {
            return Ok(IndexIterator::new(Arc::clone(self.pool()), None, 0));
        }
        let leaf = self.find_leaf(&[], true)?;
        Ok(IndexIterator::new(Arc::clone(self.pool()), Some(leaf), 0))
    }

    /// Iterates starting at the first entry whose key is `>= key`.
    pub fn iter_from(&self, key: &[u8]) -> Result<IndexIterator> {
        self.check_key(key)?;
        if self.is_empty() {
            return Ok(IndexIterator::new(Arc::clone(self.pool()), None, 0));
        }
        let leaf = self.find_leaf(key, false)?;
        let slot = {
            let data = leaf.data();
            let node = LeafNode::new(&data[..]);
            match node.key_index(key, self.key_manager()) {
                Ok(slot) | Err(slot) => slot,
            }
        };
        Ok(IndexIterator::new(
            Arc::clone(self.pool()),
            Some(leaf),
            slot,
        ))
    }
}
