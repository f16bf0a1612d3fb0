//! B+ tree operations: search, insert, remove, and rebalancing.

use crate::key::KeyManager;
use crate::node::{
    internal_capacity, leaf_capacity, node_type_of, BTreeNode, BTreeNodeMut, InternalNode,
    LeafNode, NodeType, RawNode,
};
use crate::roots::{IndexRootsView, INDEX_ROOTS_PAGE_ID};
use bytes::Bytes;
use karst_buffer::{BufferPoolManager, PageGuard};
use karst_common::{KarstError, PageId, Result, RowId};
use std::sync::Arc;
use tracing::debug;

/// A disk-resident B+ tree mapping fixed-width binary keys to row ids.
///
/// Keys are unique. Every operation acquires its pages through the buffer
/// pool and releases them before returning; the only pin that outlives a call
/// is the leaf held by an [`crate::IndexIterator`].
pub struct BPlusTree {
    /// Identifies this tree in the index roots page.
    index_id: u32,
    pool: Arc<BufferPoolManager>,
    key_manager: KeyManager,
    /// Pair capacity of leaf nodes; a leaf splits on reaching it.
    leaf_max_size: i32,
    /// Pair capacity of internal nodes; a node splits on reaching it.
    internal_max_size: i32,
    /// Root of the tree, `INVALID` while the tree is empty.
    root_page_id: PageId,
}

impl BPlusTree {
    /// Opens the tree identified by `index_id`, reading its root from the
    /// index roots page. `None` sizes default to the page capacity for the
    /// key width.
    pub fn new(
        index_id: u32,
        pool: Arc<BufferPoolManager>,
        key_manager: KeyManager,
        leaf_max_size: Option<i32>,
        internal_max_size: Option<i32>,
    ) -> Result<Self> {
        let key_size = key_manager.key_size();
        let leaf_max_size = leaf_max_size.unwrap_or_else(|| leaf_capacity(key_size));
        let internal_max_size = internal_max_size.unwrap_or_else(|| internal_capacity(key_size));
        debug_assert!(leaf_max_size >= 2);
        debug_assert!(internal_max_size >= 3);

        let root_page_id = {
            let guard = pool.fetch_guard(INDEX_ROOTS_PAGE_ID)?;
            let data = guard.data();
            let view = IndexRootsView::new(&data[..]);
            view.validate()?;
            view.get_root(index_id).unwrap_or(PageId::INVALID)
        };

        Ok(Self {
            index_id,
            pool,
            key_manager,
            leaf_max_size,
            internal_max_size,
            root_page_id,
        })
    }

    /// The id under which this tree is registered.
    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    /// Current root page id, `INVALID` when empty.
    pub fn root_page_id(&self) -> PageId {
        self.root_page_id
    }

    /// Returns true when the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        !self.root_page_id.is_valid()
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPoolManager> {
        &self.pool
    }

    pub(crate) fn key_manager(&self) -> &KeyManager {
        &self.key_manager
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_manager.key_size() {
            return Err(KarstError::Internal(format!(
                "key width {} does not match index width {}",
                key.len(),
                self.key_manager.key_size()
            )));
        }
        Ok(())
    }

    /// Records the current root page id in the index roots page.
    fn update_root_page_id(&self) -> Result<()> {
        let guard = self.pool.fetch_guard(INDEX_ROOTS_PAGE_ID)?;
        {
            let mut data = guard.data_mut();
            let mut view = IndexRootsView::new(&mut data[..]);
            view.validate()?;
            if !view.update(self.index_id, self.root_page_id)
                && !view.insert(self.index_id, self.root_page_id)
            {
                return Err(KarstError::Internal(
                    "index roots page is full".to_string(),
                ));
            }
        }
        guard.mark_dirty();
        Ok(())
    }

    /// Descends from the root to the leaf responsible for `key`, or to the
    /// leftmost leaf. Ancestors are unpinned before each step down; the
    /// returned leaf is pinned.
    pub(crate) fn find_leaf(&self, key: &[u8], leftmost: bool) -> Result<PageGuard> {
        let mut guard = self.pool.fetch_guard(self.root_page_id)?;
        loop {
            let child = {
                let data = guard.data();
                match node_type_of(&data[..], guard.page_id())? {
                    NodeType::Leaf => None,
                    NodeType::Internal => {
                        let node = InternalNode::new(&data[..]);
                        Some(if leftmost {
                            node.child_at(0)
                        } else {
                            node.lookup(key, &self.key_manager)
                        })
                    }
                }
            };
            match child {
                None => return Ok(guard),
                Some(child) => {
                    drop(guard);
                    guard = self.pool.fetch_guard(child)?;
                }
            }
        }
    }

    /// Point lookup: the row id stored under `key`, if any.
    pub fn get_value(&self, key: &[u8]) -> Result<Option<RowId>> {
        self.check_key(key)?;
        if self.is_empty() {
            return Ok(None);
        }
        let leaf = self.find_leaf(key, false)?;
        let data = leaf.data();
        let node = LeafNode::new(&data[..]);
        Ok(node.lookup(key, &self.key_manager))
    }

    /// Inserts a key/value pair. Returns false (without mutating) when the
    /// key already exists.
    pub fn insert(&mut self, key: &[u8], value: RowId) -> Result<bool> {
        self.check_key(key)?;
        if self.is_empty() {
            self.start_new_tree(key, value)?;
            return Ok(true);
        }
        self.insert_into_leaf(key, value)
    }

    /// Boots an empty tree: a fresh internal root with a single empty leaf
    /// child, the pair inserted into that leaf, and the root id persisted.
    fn start_new_tree(&mut self, key: &[u8], value: RowId) -> Result<()> {
        let key_size = self.key_manager.key_size();
        let root = self.pool.new_page_guard()?;
        let leaf = self.pool.new_page_guard()?;

        {
            let mut data = root.data_mut();
            let mut node = InternalNode::new(&mut data[..]);
            node.init(
                root.page_id(),
                PageId::INVALID,
                key_size,
                self.internal_max_size,
            );
            node.set_child_at(0, leaf.page_id());
            node.set_size(1);
        }
        root.mark_dirty();

        {
            let mut data = leaf.data_mut();
            let mut node = LeafNode::new(&mut data[..]);
            node.init(leaf.page_id(), root.page_id(), key_size, self.leaf_max_size);
            node.insert(key, value, &self.key_manager)?;
        }
        leaf.mark_dirty();

        self.root_page_id = root.page_id();
        self.update_root_page_id()
    }

    fn insert_into_leaf(&mut self, key: &[u8], value: RowId) -> Result<bool> {
        let leaf = self.find_leaf(key, false)?;
        let needs_split = {
            let mut data = leaf.data_mut();
            let mut node = LeafNode::new(&mut data[..]);
            if node.key_index(key, &self.key_manager).is_ok() {
                return Ok(false);
            }
            node.insert(key, value, &self.key_manager)? == self.leaf_max_size
        };
        leaf.mark_dirty();

        if needs_split {
            self.split_leaf(leaf)?;
        }
        Ok(true)
    }

    /// Splits a full leaf: the upper half moves to a new right sibling, the
    /// leaf chain is relinked, and the sibling's first key is pushed up.
    fn split_leaf(&mut self, leaf: PageGuard) -> Result<()> {
        let key_size = self.key_manager.key_size();
        let sibling = self.pool.new_page_guard()?;

        let sep_key = {
            let mut ldata = leaf.data_mut();
            let mut lnode = LeafNode::new(&mut ldata[..]);
            let mut sdata = sibling.data_mut();
            let mut snode = LeafNode::new(&mut sdata[..]);

            snode.init(
                sibling.page_id(),
                lnode.parent_page_id(),
                key_size,
                self.leaf_max_size,
            );
            lnode.move_half_to(&mut snode);
            snode.set_next_page_id(lnode.next_page_id());
            lnode.set_next_page_id(sibling.page_id());
            Bytes::copy_from_slice(snode.key_at(0))
        };
        leaf.mark_dirty();
        sibling.mark_dirty();

        self.insert_into_parent(&leaf, &sep_key, &sibling)
    }

    /// Splits a full internal node and pushes its new sibling up.
    fn split_internal(&mut self, node: PageGuard) -> Result<()> {
        let key_size = self.key_manager.key_size();
        let sibling = self.pool.new_page_guard()?;

        let (sep_key, moved_children) = {
            let mut ndata = node.data_mut();
            let mut nnode = InternalNode::new(&mut ndata[..]);
            let mut sdata = sibling.data_mut();
            let mut snode = InternalNode::new(&mut sdata[..]);

            snode.init(
                sibling.page_id(),
                nnode.parent_page_id(),
                key_size,
                self.internal_max_size,
            );
            nnode.move_half_to(&mut snode);
            (Bytes::copy_from_slice(snode.key_at(0)), snode.children())
        };
        node.mark_dirty();
        sibling.mark_dirty();

        for child in moved_children {
            self.reparent(child, sibling.page_id())?;
        }

        self.insert_into_parent(&node, &sep_key, &sibling)
    }

    /// Registers `right` (the new sibling of `left`) under their parent,
    /// growing a new root when `left` was the root. Splits the parent
    /// recursively when it fills up.
    fn insert_into_parent(
        &mut self,
        left: &PageGuard,
        sep_key: &[u8],
        right: &PageGuard,
    ) -> Result<()> {
        let parent_id = {
            let data = left.data();
            RawNode::new(&data[..]).parent_page_id()
        };

        if !parent_id.is_valid() {
            // The root split: grow the tree by one level.
            let new_root = self.pool.new_page_guard()?;
            {
                let mut data = new_root.data_mut();
                let mut node = InternalNode::new(&mut data[..]);
                node.init(
                    new_root.page_id(),
                    PageId::INVALID,
                    self.key_manager.key_size(),
                    self.internal_max_size,
                );
                node.populate_new_root(left.page_id(), sep_key, right.page_id());
            }
            new_root.mark_dirty();

            for child in [left, right] {
                let mut data = child.data_mut();
                RawNode::new(&mut data[..]).set_parent_page_id(new_root.page_id());
                drop(data);
                child.mark_dirty();
            }

            self.root_page_id = new_root.page_id();
            return self.update_root_page_id();
        }

        let parent = self.pool.fetch_guard(parent_id)?;
        let needs_split = {
            let mut data = parent.data_mut();
            let mut node = InternalNode::new(&mut data[..]);
            node.insert_node_after(left.page_id(), sep_key, right.page_id())?
                == self.internal_max_size
        };
        parent.mark_dirty();

        if needs_split {
            self.split_internal(parent)?;
        }
        Ok(())
    }

    /// Removes `key` from the tree. Absent keys are a no-op.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.check_key(key)?;
        if self.is_empty() {
            return Ok(());
        }

        let leaf = self.find_leaf(key, false)?;
        let removed = {
            let mut data = leaf.data_mut();
            let mut node = LeafNode::new(&mut data[..]);
            match node.key_index(key, &self.key_manager) {
                Ok(index) => {
                    node.remove_at(index);
                    true
                }
                Err(_) => false,
            }
        };
        if !removed {
            return Ok(());
        }
        leaf.mark_dirty();
        self.handle_underflow(leaf)
    }

    /// Rebalances after a removal: adjusts the root, or redistributes /
    /// coalesces an underfull non-root node.
    fn handle_underflow(&mut self, node: PageGuard) -> Result<()> {
        if node.page_id() == self.root_page_id {
            return self.adjust_root(node);
        }
        let (size, min_size) = {
            let data = node.data();
            let raw = RawNode::new(&data[..]);
            (raw.size(), raw.min_size())
        };
        if size >= min_size {
            return Ok(());
        }
        self.coalesce_or_redistribute(node)
    }

    fn coalesce_or_redistribute(&mut self, node: PageGuard) -> Result<()> {
        let node_id = node.page_id();
        let parent_id = {
            let data = node.data();
            RawNode::new(&data[..]).parent_page_id()
        };
        let parent = self.pool.fetch_guard(parent_id)?;

        let (index, sibling_id, parent_size) = {
            let data = parent.data();
            let pnode = InternalNode::new(&data[..]);
            let index = pnode.child_index(node_id).ok_or_else(|| {
                KarstError::Internal(format!(
                    "page {} is not a child of its parent {}",
                    node_id, parent_id
                ))
            })?;
            let parent_size = pnode.size() as usize;
            let sibling_index = if index == 0 { 1 } else { index - 1 };
            let sibling_id = if sibling_index < parent_size {
                pnode.child_at(sibling_index)
            } else {
                PageId::INVALID
            };
            (index, sibling_id, parent_size)
        };

        if !sibling_id.is_valid() {
            // The node is its parent's only child, which only the root may
            // have: collapse the root into the node, then rebalance it as
            // the new root.
            if parent_size == 1 && parent_id == self.root_page_id {
                self.adjust_root(parent)?;
                return self.handle_underflow(node);
            }
            return Err(KarstError::Internal(format!(
                "internal page {} has a single child but is not the root",
                parent_id
            )));
        }

        let sibling = self.pool.fetch_guard(sibling_id)?;
        let can_redistribute = {
            let ndata = node.data();
            let sdata = sibling.data();
            let nraw = RawNode::new(&ndata[..]);
            let sraw = RawNode::new(&sdata[..]);
            nraw.size() + sraw.size() >= sraw.max_size()
        };

        if can_redistribute {
            self.redistribute(sibling, node, parent, index)
        } else {
            self.coalesce(sibling, node, parent, index)
        }
    }

    /// Moves one entry from the sibling to restore the node's minimum
    /// occupancy, updating (and for internal nodes rotating) the parent's
    /// separator key.
    fn redistribute(
        &mut self,
        sibling: PageGuard,
        node: PageGuard,
        parent: PageGuard,
        index: usize,
    ) -> Result<()> {
        let is_leaf = {
            let data = node.data();
            RawNode::new(&data[..]).is_leaf()
        };
        let node_id = node.page_id();

        if is_leaf {
            let (new_sep, sep_slot) = if index == 0 {
                // Right sibling donates its first entry to the node's end.
                let mut sdata = sibling.data_mut();
                let mut snode = LeafNode::new(&mut sdata[..]);
                let mut ndata = node.data_mut();
                let mut nnode = LeafNode::new(&mut ndata[..]);
                snode.move_first_to_end_of(&mut nnode);
                (Bytes::copy_from_slice(snode.key_at(0)), 1)
            } else {
                // Left sibling donates its last entry to the node's front.
                let mut sdata = sibling.data_mut();
                let mut snode = LeafNode::new(&mut sdata[..]);
                let mut ndata = node.data_mut();
                let mut nnode = LeafNode::new(&mut ndata[..]);
                snode.move_last_to_front_of(&mut nnode);
                (Bytes::copy_from_slice(nnode.key_at(0)), index)
            };
            {
                let mut pdata = parent.data_mut();
                InternalNode::new(&mut pdata[..]).set_key_at(sep_slot, &new_sep);
            }
            sibling.mark_dirty();
            node.mark_dirty();
            parent.mark_dirty();
            Ok(())
        } else if index == 0 {
            // Right sibling donates its first child; the parent separator
            // rotates down to key the donated child and the sibling's first
            // real key rotates up.
            let (middle, borrowed_child, new_sep) = {
                let pdata = parent.data();
                let pnode = InternalNode::new(&pdata[..]);
                let sdata = sibling.data();
                let snode = InternalNode::new(&sdata[..]);
                (
                    Bytes::copy_from_slice(pnode.key_at(1)),
                    snode.child_at(0),
                    Bytes::copy_from_slice(snode.key_at(1)),
                )
            };
            {
                let mut ndata = node.data_mut();
                InternalNode::new(&mut ndata[..]).append(&middle, borrowed_child);
            }
            {
                let mut sdata = sibling.data_mut();
                InternalNode::new(&mut sdata[..]).remove_at(0);
            }
            {
                let mut pdata = parent.data_mut();
                InternalNode::new(&mut pdata[..]).set_key_at(1, &new_sep);
            }
            sibling.mark_dirty();
            node.mark_dirty();
            parent.mark_dirty();
            self.reparent(borrowed_child, node_id)
        } else {
            // Left sibling donates its last child; its boundary key rotates
            // up and the old separator rotates down in front of the node.
            let (middle, borrowed_child, new_sep, donor_size) = {
                let pdata = parent.data();
                let pnode = InternalNode::new(&pdata[..]);
                let sdata = sibling.data();
                let snode = InternalNode::new(&sdata[..]);
                let last = snode.size() as usize - 1;
                (
                    Bytes::copy_from_slice(pnode.key_at(index)),
                    snode.child_at(last),
                    Bytes::copy_from_slice(snode.key_at(last)),
                    snode.size(),
                )
            };
            {
                let mut ndata = node.data_mut();
                InternalNode::new(&mut ndata[..]).prepend(&middle, borrowed_child);
            }
            {
                let mut sdata = sibling.data_mut();
                InternalNode::new(&mut sdata[..]).set_size(donor_size - 1);
            }
            {
                let mut pdata = parent.data_mut();
                InternalNode::new(&mut pdata[..]).set_key_at(index, &new_sep);
            }
            sibling.mark_dirty();
            node.mark_dirty();
            parent.mark_dirty();
            self.reparent(borrowed_child, node_id)
        }
    }

    /// Merges the right-of-pair node into the left one, deletes the emptied
    /// page, removes the parent's separator slot, and rebalances the parent.
    fn coalesce(
        &mut self,
        sibling: PageGuard,
        node: PageGuard,
        parent: PageGuard,
        index: usize,
    ) -> Result<()> {
        let is_leaf = {
            let data = node.data();
            RawNode::new(&data[..]).is_leaf()
        };
        let (left, right, removed_index) = if index == 0 {
            (node, sibling, 1)
        } else {
            (sibling, node, index)
        };
        let left_id = left.page_id();
        let right_id = right.page_id();

        if is_leaf {
            let mut rdata = right.data_mut();
            let mut rnode = LeafNode::new(&mut rdata[..]);
            let mut ldata = left.data_mut();
            let mut lnode = LeafNode::new(&mut ldata[..]);
            rnode.move_all_to(&mut lnode);
        } else {
            let middle = {
                let pdata = parent.data();
                Bytes::copy_from_slice(InternalNode::new(&pdata[..]).key_at(removed_index))
            };
            let moved_children = {
                let rdata = right.data();
                InternalNode::new(&rdata[..]).children()
            };
            {
                let mut rdata = right.data_mut();
                let mut rnode = InternalNode::new(&mut rdata[..]);
                let mut ldata = left.data_mut();
                let mut lnode = InternalNode::new(&mut ldata[..]);
                rnode.move_all_to(&mut lnode, &middle);
            }
            for child in moved_children {
                self.reparent(child, left_id)?;
            }
        }
        left.mark_dirty();

        {
            let mut pdata = parent.data_mut();
            InternalNode::new(&mut pdata[..]).remove_at(removed_index);
        }
        parent.mark_dirty();

        drop(left);
        drop(right);
        if !self.pool.delete_page(right_id)? {
            return Err(KarstError::Internal(format!(
                "merged page {} could not be deleted",
                right_id
            )));
        }

        self.handle_underflow(parent)
    }

    /// Shrinks the root when it degenerates: an internal root with a single
    /// child is replaced by that child; an empty leaf root empties the tree.
    fn adjust_root(&mut self, root: PageGuard) -> Result<()> {
        let (is_leaf, size) = {
            let data = root.data();
            let raw = RawNode::new(&data[..]);
            (raw.is_leaf(), raw.size())
        };

        if !is_leaf && size == 1 {
            let child = {
                let data = root.data();
                InternalNode::new(&data[..]).child_at(0)
            };
            let old_root = root.page_id();

            {
                let child_guard = self.pool.fetch_guard(child)?;
                let mut data = child_guard.data_mut();
                RawNode::new(&mut data[..]).set_parent_page_id(PageId::INVALID);
                drop(data);
                child_guard.mark_dirty();
            }

            self.root_page_id = child;
            self.update_root_page_id()?;
            debug!(index_id = self.index_id, %old_root, new_root = %child, "root collapsed into its only child");

            drop(root);
            self.pool.delete_page(old_root)?;
        } else if is_leaf && size == 0 {
            let old_root = root.page_id();
            self.root_page_id = PageId::INVALID;
            self.update_root_page_id()?;
            debug!(index_id = self.index_id, %old_root, "tree emptied");

            drop(root);
            self.pool.delete_page(old_root)?;
        }
        Ok(())
    }

    fn reparent(&self, child: PageId, new_parent: PageId) -> Result<()> {
        let guard = self.pool.fetch_guard(child)?;
        {
            let mut data = guard.data_mut();
            RawNode::new(&mut data[..]).set_parent_page_id(new_parent);
        }
        guard.mark_dirty();
        Ok(())
    }

    /// Deletes every page of the tree and removes its record from the index
    /// roots page.
    pub fn destroy(&mut self) -> Result<()> {
        if self.root_page_id.is_valid() {
            self.destroy_subtree(self.root_page_id)?;
            self.root_page_id = PageId::INVALID;
        }

        let guard = self.pool.fetch_guard(INDEX_ROOTS_PAGE_ID)?;
        let removed = {
            let mut data = guard.data_mut();
            IndexRootsView::new(&mut data[..]).remove(self.index_id)
        };
        if removed {
            guard.mark_dirty();
        }
        debug!(index_id = self.index_id, "index destroyed");
        Ok(())
    }

    fn destroy_subtree(&mut self, page_id: PageId) -> Result<()> {
        let children = {
            let guard = self.pool.fetch_guard(page_id)?;
            let data = guard.data();
            match node_type_of(&data[..], page_id)? {
                NodeType::Leaf => Vec::new(),
                NodeType::Internal => InternalNode::new(&data[..]).children(),
            }
        };
        // Delete while the page is still resident; descending first could
        // evict it and turn the delete into a no-op that leaks the disk page.
        if !self.pool.delete_page(page_id)? {
            return Err(KarstError::Internal(format!(
                "tree page {} could not be deleted",
                page_id
            )));
        }
        for child in children {
            self.destroy_subtree(child)?;
        }
        Ok(())
    }
}
